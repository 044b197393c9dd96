//! `/k8s/*` handlers: exec channels, containers, ephemeral containers, logs and port-forwards.

use std::convert::Infallible;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::api::error::{ApiError, ApiResponse, ApiResult};
use crate::api::extract::{ApiJson, ApiPath, ApiQuery, UserId};
use crate::api::state::AppState;
use crate::ephemeral::{EphemeralContainerBasicData, EphemeralContainerRequest, PodContainerList};
use crate::exec::{ExecTarget, TerminalChannel, TerminalMessage};
use crate::logs::{LogQuery, parse_last_event_id};
use crate::session::TerminalError;

/// Browser side of an exec session. The first frame must bind a session id.
pub async fn exec_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let hub = state.hub().clone();
    ws.on_upgrade(move |socket| async move {
        hub.accept(TerminalChannel::from_websocket(socket)).await;
    })
}

#[derive(Debug, Deserialize)]
pub struct ExecSessionPath {
    pub cluster_id: i64,
    pub namespace: String,
    pub pod: String,
    pub shell: String,
    pub container: String,
}

/// Open an exec session into any container and return its id for the browser to bind.
#[instrument(skip(state))]
pub async fn open_exec_session(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiPath(path): ApiPath<ExecSessionPath>,
) -> ApiResult<ApiResponse<TerminalMessage>> {
    let cluster = state
        .connector
        .connect(path.cluster_id)
        .await
        .map_err(TerminalError::from)?;
    let container = Some(path.container.clone()).filter(|c| !c.is_empty());
    let session_id = state.hub().open(ExecTarget {
        cluster,
        namespace: path.namespace.clone(),
        pod: path.pod.clone(),
        container: container.clone(),
        shell: path.shell.clone(),
        activity: None,
    });

    if let Some(container) = container {
        let ephemeral = state.ephemeral.clone();
        tokio::spawn(async move {
            match ephemeral
                .audit_access(user_id, path.cluster_id, &path.namespace, &path.pod, &container)
                .await
            {
                Ok(true) => debug!(container = %container, "recorded ephemeral container access"),
                Ok(false) => {}
                Err(e) => warn!(container = %container, error = %e, "auditing container access failed"),
            }
        });
    }

    Ok(ApiResponse::ok(TerminalMessage::bind(session_id)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodQuery {
    pub cluster_id: i64,
    #[serde(default)]
    pub namespace: String,
}

#[instrument(skip(state, _user))]
pub async fn list_pod_containers(
    State(state): State<AppState>,
    _user: UserId,
    ApiPath(pod_name): ApiPath<String>,
    ApiQuery(query): ApiQuery<PodQuery>,
) -> ApiResult<ApiResponse<PodContainerList>> {
    let namespace = namespace_or_default(&state, &query.namespace);
    let containers = state
        .ephemeral
        .list_containers(query.cluster_id, &namespace, &pod_name)
        .await?;
    Ok(ApiResponse::ok(containers))
}

#[instrument(skip(state, request), fields(pod = %request.pod_name))]
pub async fn create_ephemeral_container(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(request): ApiJson<EphemeralContainerRequest>,
) -> ApiResult<ApiResponse<EphemeralContainerBasicData>> {
    let created = state.ephemeral.create(user_id, &request).await?;
    Ok(ApiResponse::ok(created))
}

#[instrument(skip(state, request), fields(pod = %request.pod_name))]
pub async fn terminate_ephemeral_container(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(request): ApiJson<EphemeralContainerRequest>,
) -> ApiResult<ApiResponse<bool>> {
    state.ephemeral.terminate(user_id, &request).await?;
    Ok(ApiResponse::ok(true))
}

/// Container logs as server-sent events. `Last-Event-ID` resumes after the given line.
#[instrument(skip(state, headers, query), fields(namespace = %query.namespace))]
pub async fn stream_pod_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(pod_name): ApiPath<String>,
    ApiQuery(mut query): ApiQuery<LogQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    query.namespace = namespace_or_default(&state, &query.namespace);
    let last_event_id = parse_last_event_id(
        headers
            .get("last-event-id")
            .and_then(|value| value.to_str().ok()),
    );
    let frames = state
        .logs
        .open(&pod_name, &query, last_event_id)
        .await?;

    // Heartbeats arrive as PING frames from the streamer.
    let stream = frames.map(|frame| Ok::<_, Infallible>(frame.into_event()));
    Ok(Sse::new(stream))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRequest {
    pub cluster_id: i64,
    #[serde(default)]
    pub namespace: String,
    pub port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardResponse {
    pub local_port: u16,
}

#[instrument(skip(state, _user, request), fields(port = request.port))]
pub async fn start_port_forward(
    State(state): State<AppState>,
    _user: UserId,
    ApiPath(pod_name): ApiPath<String>,
    ApiJson(request): ApiJson<PortForwardRequest>,
) -> ApiResult<ApiResponse<PortForwardResponse>> {
    let namespace = namespace_or_default(&state, &request.namespace);
    let cluster = state
        .connector
        .connect(request.cluster_id)
        .await
        .map_err(TerminalError::from)?;
    cluster
        .get_pod(&namespace, &pod_name)
        .await
        .map_err(TerminalError::from)?;
    let local_port = state
        .port_forwards
        .start(cluster, &namespace, &pod_name, request.port)
        .await
        .map_err(TerminalError::from)?;
    info!(local_port, "port-forward started");
    Ok(ApiResponse::ok(PortForwardResponse { local_port }))
}

#[instrument(skip(state, _user))]
pub async fn stop_port_forward(
    State(state): State<AppState>,
    _user: UserId,
    ApiPath(local_port): ApiPath<u16>,
) -> ApiResult<ApiResponse<bool>> {
    if !state.port_forwards.stop(local_port) {
        return Err(ApiError::not_found(format!(
            "no port-forward on local port {local_port}"
        )));
    }
    Ok(ApiResponse::ok(true))
}

fn namespace_or_default(state: &AppState, namespace: &str) -> String {
    if namespace.trim().is_empty() {
        state.terminal.settings().default_namespace.clone()
    } else {
        namespace.to_string()
    }
}
