//! Cluster access.
//!
//! `ClusterConnector` turns a cluster id into a live `ClusterApi` handle. The production
//! implementation reads credentials from the `clusters` table and talks to the API server with
//! `kube`; tests substitute in-memory fakes behind the same traits.

mod error;
mod kube_client;
mod legacy_exec;
mod port_forward;
mod repository;
mod tls;

pub use error::{ClusterError, ClusterResult};
pub use kube_client::{KubeCluster, KubeConnector};
pub use port_forward::{PortForwardRegistry, StopChannelMap};
pub use repository::{ClusterRecord, ClusterRepository, NewCluster};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Event, Pod};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

/// Group/version/kind of a templated resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDescriptor {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindDescriptor {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// `apiVersion` as written in manifests.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Streaming protocol used for exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecProtocol {
    /// Upgrade negotiated by the kube client.
    Modern,
    /// Plain websocket with the `v4.channel.k8s.io` framing.
    Legacy,
}

/// Target and options of an exec call.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub command: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
}

impl ExecRequest {
    /// Interactive request with a tty and stdin attached.
    pub fn interactive(namespace: &str, pod: &str, container: Option<&str>, command: Vec<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.map(str::to_string),
            command,
            tty: true,
            stdin: true,
        }
    }

    /// Non-interactive request that only collects stdout and stderr.
    pub fn command(namespace: &str, pod: &str, container: Option<&str>, command: Vec<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.map(str::to_string),
            command,
            tty: false,
            stdin: false,
        }
    }
}

/// Terminal dimensions pushed to the remote pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

/// How a remote process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecExit {
    pub success: bool,
    pub message: Option<String>,
}

impl ExecExit {
    pub fn success() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// A running remote process.
pub struct ExecStream {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub resize: Option<mpsc::Sender<TerminalSize>>,
    pub exit: BoxFuture<'static, ExecExit>,
}

/// Captured output of a non-interactive exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Patch flavours accepted by pod subresources.
#[derive(Debug, Clone)]
pub enum PodPatch {
    StrategicMerge(serde_json::Value),
    Json(serde_json::Value),
}

/// Options for reading container logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub container: Option<String>,
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub since_time: Option<DateTime<Utc>>,
    pub previous: bool,
}

/// Log lines, each prefixed with its RFC 3339 timestamp.
pub type LogLines = BoxStream<'static, std::io::Result<String>>;

/// Operations the terminal subsystem needs from one cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Git version reported by the API server, e.g. `v1.29.4`.
    async fn server_version(&self) -> ClusterResult<String>;

    async fn create_resource(
        &self,
        kind: &KindDescriptor,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> ClusterResult<()>;

    async fn delete_resource(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> ClusterResult<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod>;

    async fn list_pod_events(&self, namespace: &str, pod: &str) -> ClusterResult<Vec<Event>>;

    async fn patch_pod_subresource(
        &self,
        namespace: &str,
        pod: &str,
        subresource: &str,
        patch: &PodPatch,
    ) -> ClusterResult<()>;

    async fn exec(&self, request: &ExecRequest, protocol: ExecProtocol) -> ClusterResult<ExecStream>;

    async fn pod_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> ClusterResult<LogLines>;

    /// Open a byte stream to `port` inside the pod.
    async fn port_forward(&self, namespace: &str, pod: &str, port: u16) -> ClusterResult<DuplexStream>;

    /// Run a command to completion and collect its output.
    async fn exec_output(&self, request: &ExecRequest) -> ClusterResult<ExecOutput> {
        let (_, stream) = exec_with_fallback(self, request).await;
        let mut stream = stream?;
        drop(stream.stdin.take());

        let stdout = read_all(stream.stdout.take());
        let stderr = read_all(stream.stderr.take());
        let (stdout, stderr) = tokio::try_join!(stdout, stderr)?;
        let exit = stream.exit.await;

        let mut stderr = stderr;
        if !exit.success && stderr.is_empty() {
            if let Some(message) = exit.message {
                stderr = message;
            }
        }
        Ok(ExecOutput { stdout, stderr })
    }
}

/// Exec over the modern transport, retried once over the legacy one when the upgrade
/// handshake is refused. Returns the protocol that produced the result.
pub async fn exec_with_fallback<C>(
    cluster: &C,
    request: &ExecRequest,
) -> (ExecProtocol, ClusterResult<ExecStream>)
where
    C: ClusterApi + ?Sized,
{
    match cluster.exec(request, ExecProtocol::Modern).await {
        Err(ClusterError::Handshake(e)) => {
            debug!(
                "exec upgrade to {}/{} refused ({}), retrying over legacy websocket",
                request.namespace, request.pod, e
            );
            let stream = cluster.exec(request, ExecProtocol::Legacy).await;
            (ExecProtocol::Legacy, stream)
        }
        other => (ExecProtocol::Modern, other),
    }
}

async fn read_all(reader: Option<Box<dyn AsyncRead + Send + Unpin>>) -> ClusterResult<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Produces fresh cluster handles. Nothing is cached, so revoked credentials take effect on
/// the next call.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster_id: i64) -> ClusterResult<Arc<dyn ClusterApi>>;
}

#[cfg(test)]
pub mod testing;
