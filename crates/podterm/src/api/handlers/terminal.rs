//! `/user/terminal/*` handlers.

use axum::extract::State;
use k8s_openapi::api::core::v1::{Event, Pod};
use serde::Deserialize;
use tracing::instrument;

use crate::api::error::{ApiResponse, ApiResult};
use crate::api::extract::{ApiJson, ApiQuery, UserId};
use crate::api::state::AppState;
use crate::session::{
    ManifestEditRequest, ManifestEditResponse, TerminalStatusQuery, UserTerminalSessionRequest,
    UserTerminalSessionResponse, UserTerminalShellSessionRequest, ValidShellResponse,
    ValidateShellQuery,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalAccessIdQuery {
    pub terminal_access_id: i64,
}

#[instrument(skip(state, request), fields(cluster_id = request.cluster_id))]
pub async fn start_terminal_session(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(request): ApiJson<UserTerminalSessionRequest>,
) -> ApiResult<ApiResponse<UserTerminalSessionResponse>> {
    let response = state.terminal.start(user_id, request).await?;
    Ok(ApiResponse::ok(response))
}

#[instrument(skip(state, request))]
pub async fn update_terminal_session(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(request): ApiJson<UserTerminalSessionRequest>,
) -> ApiResult<ApiResponse<UserTerminalSessionResponse>> {
    let response = state.terminal.update(user_id, request).await?;
    Ok(ApiResponse::ok(response))
}

#[instrument(skip(state, request), fields(id = request.terminal_access_id))]
pub async fn update_terminal_shell(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(request): ApiJson<UserTerminalShellSessionRequest>,
) -> ApiResult<ApiResponse<UserTerminalSessionResponse>> {
    let response = state.terminal.update_shell(user_id, request).await?;
    Ok(ApiResponse::ok(response))
}

/// Poll a session. Once the pod runs the response carries the exec session id to bind.
#[instrument(skip(state, query), fields(id = query.terminal_access_id))]
pub async fn fetch_terminal_status(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiQuery(query): ApiQuery<TerminalStatusQuery>,
) -> ApiResult<ApiResponse<UserTerminalSessionResponse>> {
    let response = state.terminal.fetch_status(user_id, query).await?;
    Ok(ApiResponse::ok(response))
}

#[instrument(skip(state))]
pub async fn fetch_pod_events(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiQuery(query): ApiQuery<TerminalAccessIdQuery>,
) -> ApiResult<ApiResponse<Vec<Event>>> {
    let events = state
        .terminal
        .fetch_events(user_id, query.terminal_access_id)
        .await?;
    Ok(ApiResponse::ok(events))
}

#[instrument(skip(state))]
pub async fn fetch_pod_manifest(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiQuery(query): ApiQuery<TerminalAccessIdQuery>,
) -> ApiResult<ApiResponse<Pod>> {
    let pod = state
        .terminal
        .fetch_manifest(user_id, query.terminal_access_id)
        .await?;
    Ok(ApiResponse::ok(pod))
}

#[instrument(skip(state, request))]
pub async fn edit_pod_manifest(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(request): ApiJson<ManifestEditRequest>,
) -> ApiResult<ApiResponse<ManifestEditResponse>> {
    let response = state.terminal.edit_pod_manifest(user_id, request).await?;
    Ok(ApiResponse::ok(response))
}

#[instrument(skip(state))]
pub async fn disconnect_terminal_session(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiQuery(query): ApiQuery<TerminalAccessIdQuery>,
) -> ApiResult<ApiResponse<&'static str>> {
    state
        .terminal
        .disconnect(user_id, query.terminal_access_id)
        .await?;
    Ok(ApiResponse::ok("terminal session disconnected"))
}

/// Answers as soon as ownership is checked; the pod is deleted in the background.
#[instrument(skip(state))]
pub async fn stop_terminal_session(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiQuery(query): ApiQuery<TerminalAccessIdQuery>,
) -> ApiResult<ApiResponse<&'static str>> {
    state
        .terminal
        .stop(user_id, query.terminal_access_id)
        .await?;
    Ok(ApiResponse::ok("terminal session stopping"))
}

#[instrument(skip(state, request))]
pub async fn disconnect_and_retry(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    ApiJson(request): ApiJson<UserTerminalSessionRequest>,
) -> ApiResult<ApiResponse<UserTerminalSessionResponse>> {
    let response = state.terminal.disconnect_and_retry(user_id, request).await?;
    Ok(ApiResponse::ok(response))
}

#[instrument(skip(state, _user))]
pub async fn validate_shell(
    State(state): State<AppState>,
    _user: UserId,
    ApiQuery(query): ApiQuery<ValidateShellQuery>,
) -> ApiResult<ApiResponse<ValidShellResponse>> {
    let response = state.terminal.validate_shell(query).await?;
    Ok(ApiResponse::ok(response))
}
