//! Exec over a plain websocket using the `v4.channel.k8s.io` framing.
//!
//! Every binary frame starts with a channel byte:
//!   0 = stdin, 1 = stdout, 2 = stderr, 3 = error/status (JSON `Status`),
//!   4 = resize (JSON `{"Width": N, "Height": N}`).

use futures::{SinkExt, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use super::kube_client::exit_from_status;
use super::tls;
use super::{ClusterError, ClusterRecord, ClusterResult, ExecExit, ExecRequest, ExecStream, TerminalSize};

const SUBPROTOCOL: &str = "v4.channel.k8s.io";
const PIPE_BUFFER: usize = 64 * 1024;
const RESIZE_QUEUE: usize = 8;

const STDIN: u8 = 0;
const STDOUT: u8 = 1;
const STDERR: u8 = 2;
const STATUS: u8 = 3;
const RESIZE: u8 = 4;

pub(super) fn exec_url(server_url: &str, request: &ExecRequest) -> ClusterResult<String> {
    let base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(ClusterError::ConfigInvalid(format!(
            "unsupported server url: {server_url}"
        )));
    };

    let mut query: Vec<String> = request
        .command
        .iter()
        .map(|arg| format!("command={}", urlencoding::encode(arg)))
        .collect();
    if let Some(container) = &request.container {
        query.push(format!("container={}", urlencoding::encode(container)));
    }
    query.push(format!("stdin={}", request.stdin));
    query.push("stdout=true".to_string());
    query.push(format!("stderr={}", !request.tty));
    query.push(format!("tty={}", request.tty));

    Ok(format!(
        "{}/api/v1/namespaces/{}/pods/{}/exec?{}",
        base.trim_end_matches('/'),
        request.namespace,
        request.pod,
        query.join("&")
    ))
}

fn frame(channel: u8, payload: &[u8]) -> Message {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(channel);
    data.extend_from_slice(payload);
    Message::binary(data)
}

pub(super) async fn exec(record: &ClusterRecord, request: &ExecRequest) -> ClusterResult<ExecStream> {
    let url = exec_url(&record.server_url, request)?;
    let mut ws_request = url
        .into_client_request()
        .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
    let headers = ws_request.headers_mut();
    headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
    if let Some(token) = &record.bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ClusterError::ConfigInvalid(e.to_string()))?;
        headers.insert("Authorization", value);
    }

    let connector = tls::client_config(record)?.map(Connector::Rustls);
    let (socket, _response) = connect_async_tls_with_config(ws_request, None, false, connector)
        .await
        .map_err(|e| ClusterError::Handshake(e.to_string()))?;
    debug!("legacy exec connected to {}/{}", request.namespace, request.pod);
    let (mut ws_write, mut ws_read) = socket.split();

    let (stdin_local, mut stdin_remote) = tokio::io::duplex(PIPE_BUFFER);
    let (mut stdout_remote, stdout_local) = tokio::io::duplex(PIPE_BUFFER);
    let (mut stderr_remote, stderr_local) = tokio::io::duplex(PIPE_BUFFER);
    let (resize_tx, mut resize_rx) = mpsc::channel::<TerminalSize>(RESIZE_QUEUE);
    let (exit_tx, exit_rx) = oneshot::channel::<ExecExit>();

    // Writer: stdin bytes and resize events towards the API server. The sink stays open
    // after both inputs end so the server can still deliver output; the reader aborts it.
    let writer = tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        let mut stdin_open = true;
        let mut resize_open = true;
        while stdin_open || resize_open {
            let sent = tokio::select! {
                read = stdin_remote.read(&mut buf), if stdin_open => match read {
                    Ok(0) | Err(_) => {
                        stdin_open = false;
                        Ok(())
                    }
                    Ok(n) => ws_write.send(frame(STDIN, &buf[..n])).await,
                },
                size = resize_rx.recv(), if resize_open => match size {
                    Some(size) => {
                        let payload = serde_json::json!({"Width": size.width, "Height": size.height});
                        ws_write.send(frame(RESIZE, payload.to_string().as_bytes())).await
                    }
                    None => {
                        resize_open = false;
                        Ok(())
                    }
                },
            };
            if sent.is_err() {
                break;
            }
        }
        futures::future::pending::<()>().await;
        drop(ws_write);
    });

    // Reader: demultiplex output channels until the server closes.
    tokio::spawn(async move {
        let mut exit = ExecExit::success();
        while let Some(message) = ws_read.next().await {
            let data = match message {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    exit = ExecExit::failure(e.to_string());
                    break;
                }
            };
            let Some((&channel, payload)) = data.split_first() else {
                continue;
            };
            let written = match channel {
                STDOUT => stdout_remote.write_all(payload).await,
                STDERR => stderr_remote.write_all(payload).await,
                STATUS => {
                    if let Ok(status) = serde_json::from_slice::<Status>(payload) {
                        exit = exit_from_status(Some(status));
                    }
                    Ok(())
                }
                _ => Ok(()),
            };
            if written.is_err() {
                debug!("legacy exec output pipe closed");
            }
        }
        drop(stdout_remote);
        drop(stderr_remote);
        writer.abort();
        let _ = exit_tx.send(exit);
    });

    Ok(ExecStream {
        stdin: request
            .stdin
            .then(|| Box::new(stdin_local) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>),
        stdout: Some(Box::new(stdout_local)),
        stderr: (!request.tty).then(|| Box::new(stderr_local) as Box<dyn tokio::io::AsyncRead + Send + Unpin>),
        resize: request.tty.then_some(resize_tx),
        exit: Box::pin(async move {
            exit_rx
                .await
                .unwrap_or_else(|_| ExecExit::failure("exec stream dropped"))
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    struct Seen {
        uri: String,
        authorization: Option<String>,
    }

    /// Accept one legacy exec connection, send `frames` and close.
    async fn serve_once(frames: Vec<Message>) -> (String, oneshot::Receiver<Seen>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                let _ = seen_tx.send(Seen {
                    uri: req.uri().to_string(),
                    authorization: req
                        .headers()
                        .get("Authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                });
                resp.headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
                Ok(resp)
            };
            let mut socket = accept_hdr_async(stream, callback).await.unwrap();
            for message in frames {
                socket.send(message).await.unwrap();
            }
            let _ = socket.close(None).await;
            while socket.next().await.is_some() {}
        });
        (format!("http://{addr}"), seen_rx)
    }

    fn loopback_record(server_url: String) -> ClusterRecord {
        ClusterRecord {
            id: 1,
            name: "loopback".to_string(),
            server_url,
            bearer_token: Some("secret".to_string()),
            certificate_authority_data: None,
            insecure_skip_tls_verify: false,
            created_at: String::new(),
        }
    }

    fn echo_request() -> ExecRequest {
        ExecRequest::command(
            "default",
            "debug-pod",
            Some("shell"),
            vec!["echo".to_string(), "hi".to_string()],
        )
    }

    #[tokio::test]
    async fn legacy_exec_demultiplexes_output_and_status() {
        let (url, seen) = serve_once(vec![
            frame(STDOUT, b"hi\n"),
            frame(STDERR, b"warn"),
            frame(STATUS, br#"{"status":"Success","metadata":{}}"#),
        ])
        .await;

        let mut stream = exec(&loopback_record(url), &echo_request()).await.unwrap();
        let seen = seen.await.unwrap();
        assert!(seen.uri.starts_with("/api/v1/namespaces/default/pods/debug-pod/exec?"));
        assert!(seen.uri.contains("command=echo&command=hi"));
        assert_eq!(seen.authorization.as_deref(), Some("Bearer secret"));

        let mut stdout = String::new();
        stream.stdout.take().unwrap().read_to_string(&mut stdout).await.unwrap();
        let mut stderr = String::new();
        stream.stderr.take().unwrap().read_to_string(&mut stderr).await.unwrap();
        assert_eq!(stdout, "hi\n");
        assert_eq!(stderr, "warn");
        assert!(stream.stdin.is_none());
        assert!(stream.exit.await.success);
    }

    #[tokio::test]
    async fn legacy_exec_reports_failure_status() {
        let (url, _seen) = serve_once(vec![frame(
            STATUS,
            br#"{"status":"Failure","message":"command terminated with non-zero exit code","metadata":{}}"#,
        )])
        .await;

        let stream = exec(&loopback_record(url), &echo_request()).await.unwrap();
        let exit = stream.exit.await;
        assert!(!exit.success);
        assert_eq!(
            exit.message.as_deref(),
            Some("command terminated with non-zero exit code")
        );
    }

    #[tokio::test]
    async fn refused_upgrade_is_a_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let result = exec(&loopback_record(format!("http://{addr}")), &echo_request()).await;
        assert!(matches!(result, Err(ClusterError::Handshake(_))));
    }

    #[test]
    fn exec_url_switches_scheme_and_encodes_arguments() {
        let request = ExecRequest::command(
            "default",
            "debug-pod",
            Some("internal-kubectl"),
            vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
        );
        let url = exec_url("https://10.0.0.1:6443/", &request).unwrap();
        assert_eq!(
            url,
            "wss://10.0.0.1:6443/api/v1/namespaces/default/pods/debug-pod/exec?\
             command=sh&command=-c&command=echo%20hi&container=internal-kubectl\
             &stdin=false&stdout=true&stderr=true&tty=false"
        );
    }

    #[test]
    fn exec_url_rejects_unknown_scheme() {
        let request = ExecRequest::interactive("default", "p", None, vec!["sh".to_string()]);
        assert!(matches!(
            exec_url("unix:///var/run/k8s.sock", &request),
            Err(ClusterError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn frames_carry_the_channel_prefix() {
        let Message::Binary(data) = frame(STDIN, b"ls\n") else {
            panic!("expected a binary frame");
        };
        assert_eq!(&data[..], &[0, b'l', b's', b'\n']);
    }
}
