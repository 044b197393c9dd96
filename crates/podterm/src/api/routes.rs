//! API route definitions.

use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::extract::USER_ID_HEADER;
use super::handlers;
use super::state::AppState;

/// Create the application router. An empty `allowed_origins` mirrors the request origin.
pub fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = build_cors_layer(allowed_origins);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let terminal_routes = Router::new()
        .route("/start", post(handlers::start_terminal_session))
        .route("/update", put(handlers::update_terminal_session))
        .route("/update/shell", put(handlers::update_terminal_shell))
        .route("/get", get(handlers::fetch_terminal_status))
        .route("/pod/events", get(handlers::fetch_pod_events))
        .route("/pod/manifest", get(handlers::fetch_pod_manifest))
        .route("/edit", put(handlers::edit_pod_manifest))
        .route("/disconnect", post(handlers::disconnect_terminal_session))
        .route("/stop", put(handlers::stop_terminal_session))
        .route("/disconnectAndRetry", post(handlers::disconnect_and_retry))
        .route("/validateShell", get(handlers::validate_shell));

    let k8s_routes = Router::new()
        .route("/pod/exec/sockjs/ws", get(handlers::exec_socket))
        .route("/pod/exec/sockjs/ws/{*rest}", get(handlers::exec_socket))
        .route(
            "/pod/exec/session/{cluster_id}/{namespace}/{pod}/{shell}/{container}",
            get(handlers::open_exec_session),
        )
        .route("/pods/{pod_name}/containers", get(handlers::list_pod_containers))
        .route("/pods/logs/{pod_name}", get(handlers::stream_pod_logs))
        .route("/pods/{pod_name}/portforward", post(handlers::start_port_forward))
        .route("/portforward/{local_port}", delete(handlers::stop_port_forward))
        .route(
            "/resources/ephemeralContainers",
            post(handlers::create_ephemeral_container)
                .delete(handlers::terminate_ephemeral_container),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/user/terminal", terminal_routes)
        .nest("/k8s", k8s_routes)
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer from the configured origins.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    let headers = [
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
        HeaderName::from_static(USER_ID_HEADER),
        HeaderName::from_static("last-event-id"),
    ];

    if allowed_origins.is_empty() {
        tracing::warn!("CORS: No origins configured, mirroring request origin");
        return CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        tracing::error!("CORS: All configured origins are invalid!");
        CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")))
    } else {
        tracing::info!("CORS: Allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(true)
    }
}
