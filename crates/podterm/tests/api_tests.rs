//! API integration tests.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use futures::StreamExt;
use podterm::api;
use podterm::logs::LogStreamer;
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{CLUSTER_ID, test_app, test_app_with_version};

const USER: &str = "7";

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("x-user-id", USER);
    let body = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_string(&value).unwrap())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

fn start_body() -> Value {
    json!({
        "clusterId": CLUSTER_ID,
        "nodeName": "autoSelect",
        "baseImage": "alpine:3.20",
        "shellName": "sh",
        "namespace": "default"
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_terminal_requires_user_header() {
    let app = test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/user/terminal/start")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(start_body().to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["code"], 401);
    assert_eq!(json["errors"][0]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_start_poll_and_disconnect() {
    let app = test_app().await;

    let (status, json) = send(&app.router, Method::POST, "/user/terminal/start", Some(start_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["code"], 200);
    assert_eq!(json["status"], "OK");
    let result = &json["result"];
    assert_eq!(result["status"], "Starting");
    assert_eq!(result["userId"], 7);
    let id = result["terminalAccessId"].as_i64().unwrap();
    let pod = result["podName"].as_str().unwrap().to_string();
    assert_eq!(pod, "terminal-access-cluster-1-user-7-1");
    assert!(app.cluster.pod_names().contains(&pod));

    // Pending pods keep the session Starting and no exec session is handed out.
    let uri = format!("/user/terminal/get?terminalAccessId={id}&namespace=default");
    let (status, json) = send(&app.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["result"]["status"], "Starting");
    assert_eq!(json["result"]["userTerminalSessionId"], "");

    app.cluster.insert_pod("default", &pod, "Running");
    let (_, json) = send(&app.router, Method::GET, &uri, None).await;
    assert_eq!(json["result"]["status"], "Running");
    let exec_id = json["result"]["userTerminalSessionId"].as_str().unwrap();
    assert!(!exec_id.is_empty());
    assert!(app.state.hub().is_active(exec_id));

    let uri = format!("/user/terminal/disconnect?terminalAccessId={id}");
    let (status, _) = send(&app.router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!app.cluster.pod_names().contains(&pod));

    let uri = format!("/user/terminal/pod/manifest?terminalAccessId={id}");
    let (status, json) = send(&app.router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(
        json["errors"][0]["userMessage"]
            .as_str()
            .unwrap()
            .starts_with("pod-terminated")
    );
}

#[tokio::test]
async fn test_session_ceiling_is_a_bad_request() {
    let app = test_app().await;

    for _ in 0..3 {
        let (status, _) = send(&app.router, Method::POST, "/user/terminal/start", Some(start_body())).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, json) = send(&app.router, Method::POST, "/user/terminal/start", Some(start_body())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], 400);
    assert_eq!(
        json["errors"][0]["userMessage"],
        "cannot start new session more than configured 3"
    );

    // Retrying tears down every live session first.
    let (status, json) = send(
        &app.router,
        Method::POST,
        "/user/terminal/disconnectAndRetry",
        Some(start_body()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["result"]["status"], "Starting");
    assert_eq!(app.cluster.pod_names().len(), 1);
}

#[tokio::test]
async fn test_malformed_body_uses_the_envelope() {
    let app = test_app().await;

    let (status, json) = send(
        &app.router,
        Method::POST,
        "/user/terminal/start",
        Some(json!({"nodeName": "autoSelect"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["errors"][0]["code"], "BAD_REQUEST");

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/user/terminal/start",
        Some(json!({
            "clusterId": CLUSTER_ID,
            "baseImage": "alpine:3.20",
            "shellName": "zsh"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_other_users_cannot_touch_a_session() {
    let app = test_app().await;
    let (_, json) = send(&app.router, Method::POST, "/user/terminal/start", Some(start_body())).await;
    let id = json["result"]["terminalAccessId"].as_i64().unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/user/terminal/disconnect?terminalAccessId={id}"))
                .method(Method::POST)
                .header("x-user-id", "8")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(app.cluster.pod_names().len(), 1);
}

#[tokio::test]
async fn test_unknown_cluster_is_not_found() {
    let app = test_app().await;
    let mut body = start_body();
    body["clusterId"] = json!(99);
    let (status, json) = send(&app.router, Method::POST, "/user/terminal/start", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["errors"][0]["userMessage"], "cluster 99 not found");
}

#[tokio::test]
async fn test_exec_session_for_any_pod() {
    let app = test_app().await;
    app.cluster.insert_pod("apps", "web-0", "Running");

    let (status, json) = send(
        &app.router,
        Method::GET,
        "/k8s/pod/exec/session/1/apps/web-0/sh/nginx",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = json["result"]["sessionId"].as_str().unwrap();
    assert_eq!(session_id.len(), 32);
    assert!(app.state.hub().is_active(session_id));
}

#[tokio::test]
async fn test_container_list_and_ephemeral_create() {
    let app = test_app().await;
    app.cluster.insert_pod("default", "web-0", "Running");

    let (status, json) = send(
        &app.router,
        Method::POST,
        "/k8s/resources/ephemeralContainers",
        Some(json!({
            "clusterId": CLUSTER_ID,
            "namespace": "default",
            "podName": "web-0",
            "basicData": {
                "containerName": "debug",
                "targetContainerName": "nginx",
                "image": "busybox:1.36"
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let name = json["result"]["containerName"].as_str().unwrap();
    assert!(name.starts_with("debug-"));
    assert_eq!(json["result"]["image"], "busybox:1.36");

    let (status, json) = send(
        &app.router,
        Method::GET,
        "/k8s/pods/web-0/containers?clusterId=1&namespace=default",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["result"]["ephemeralContainers"], json!([]));
}

#[tokio::test]
async fn test_ephemeral_containers_need_a_recent_cluster() {
    let app = test_app_with_version("v1.22.9").await;
    app.cluster.insert_pod("default", "web-0", "Running");

    let (status, json) = send(
        &app.router,
        Method::POST,
        "/k8s/resources/ephemeralContainers",
        Some(json!({
            "clusterId": CLUSTER_ID,
            "namespace": "default",
            "podName": "web-0",
            "basicData": {"containerName": "debug", "targetContainerName": "nginx", "image": "busybox"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json["errors"][0]["userMessage"]
            .as_str()
            .unwrap()
            .contains("v1.22.9")
    );
}

#[tokio::test]
async fn test_terminating_foreign_ephemeral_container_is_refused() {
    let app = test_app().await;
    app.cluster.insert_pod("default", "web-0", "Running");

    let (status, _) = send(
        &app.router,
        Method::DELETE,
        "/k8s/resources/ephemeralContainers",
        Some(json!({
            "clusterId": CLUSTER_ID,
            "namespace": "default",
            "podName": "web-0",
            "basicData": {"containerName": "kubectl-debug-x"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_logs_stream_as_server_sent_events() {
    let app = test_app().await;
    app.cluster.insert_pod("default", "web-0", "Running");
    *app.cluster.log_lines.lock().unwrap() = vec![
        "2025-03-01T10:00:00.000000001Z booting".to_string(),
        "2025-03-01T10:00:01.000000000Z ready".to_string(),
    ];

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/k8s/pods/logs/web-0?clusterId=1&namespace=default")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("data: booting"));
    assert!(text.contains("id: 1740823200000000001"));
    assert!(text.contains("data: ready"));

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/k8s/pods/logs/web-0?clusterId=1&namespace=default")
                .method(Method::GET)
                .header("last-event-id", "1740823200000000001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("event: RECONNECT_STREAM"));
    assert!(!text.contains("booting"));
    assert!(text.contains("data: ready"));
}

#[tokio::test]
async fn test_followed_logs_carry_ping_events_only() {
    let app = test_app().await;
    app.cluster.insert_pod("default", "web-0", "Running");
    app.cluster.follow_stays_open.store(true, Ordering::SeqCst);
    *app.cluster.log_lines.lock().unwrap() =
        vec!["2025-03-01T10:00:00.000000001Z booting".to_string()];

    let mut state = app.state.clone();
    state.logs = Arc::new(LogStreamer::with_heartbeat(
        Arc::clone(&state.connector),
        Duration::from_millis(50),
    ));
    let router = api::create_router(state, &[]);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/k8s/pods/logs/web-0?clusterId=1&namespace=default&follow=true")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut text = String::new();
    while text.matches("event: PING").count() < 2 {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("heartbeat within five seconds")
            .expect("stream still open")
            .unwrap();
        text.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(text.contains("data: booting"));
    assert!(text.contains("data: PING"));
    assert!(!text.lines().any(|line| line.starts_with(':')));
}

#[tokio::test]
async fn test_stopping_unknown_port_forward() {
    let app = test_app().await;
    let (status, _) = send(&app.router, Method::DELETE, "/k8s/portforward/40123", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_port_forward_round_trip() {
    let app = test_app().await;
    app.cluster.insert_pod("default", "db-0", "Running");

    let (status, json) = send(
        &app.router,
        Method::POST,
        "/k8s/pods/db-0/portforward",
        Some(json!({"clusterId": CLUSTER_ID, "namespace": "default", "port": 5432})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let local_port = json["result"]["localPort"].as_u64().unwrap();
    assert!(local_port > 0);

    let uri = format!("/k8s/portforward/{local_port}");
    let (status, _) = send(&app.router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app.router, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_with_axum_test_server() {
    let app = test_app().await;
    let server = axum_test::TestServer::new(app.router).unwrap();

    let response = server
        .post("/user/terminal/start")
        .add_header("x-user-id", USER)
        .json(&start_body())
        .await;
    response.assert_status_ok();
    let json: Value = response.json();
    let id = json["result"]["terminalAccessId"].as_i64().unwrap();

    let response = server
        .put("/user/terminal/stop")
        .add_query_param("terminalAccessId", id)
        .add_header("x-user-id", USER)
        .await;
    response.assert_status_ok();
}
