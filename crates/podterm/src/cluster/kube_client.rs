//! `kube`-backed implementation of the cluster traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::{AsyncBufReadExt, SinkExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::Scope;
use kube::{Client, Config};
use log::{debug, warn};
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::legacy_exec;
use super::{
    ClusterApi, ClusterConnector, ClusterError, ClusterRecord, ClusterRepository, ClusterResult,
    ExecExit, ExecProtocol, ExecRequest, ExecStream, KindDescriptor, LogLines, LogOptions,
    PodPatch, TerminalSize,
};

const RESIZE_QUEUE: usize = 8;
const FORWARD_BUFFER: usize = 64 * 1024;

/// Builds a fresh `kube::Client` per call from the credential store.
#[derive(Debug, Clone)]
pub struct KubeConnector {
    repo: ClusterRepository,
    connect_timeout: Duration,
}

impl KubeConnector {
    pub fn new(repo: ClusterRepository, connect_timeout: Duration) -> Self {
        Self {
            repo,
            connect_timeout,
        }
    }

    fn kubeconfig(record: &ClusterRecord) -> ClusterResult<Kubeconfig> {
        let value = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": record.name,
                "cluster": {
                    "server": record.server_url,
                    "certificate-authority-data": record.certificate_authority_data,
                    "insecure-skip-tls-verify": record.insecure_skip_tls_verify,
                },
            }],
            "users": [{
                "name": "podterm",
                "user": { "token": record.bearer_token },
            }],
            "contexts": [{
                "name": "podterm",
                "context": { "cluster": record.name, "user": "podterm" },
            }],
            "current-context": "podterm",
        });
        serde_json::from_value(value).map_err(|e| ClusterError::ConfigInvalid(e.to_string()))
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, cluster_id: i64) -> ClusterResult<Arc<dyn ClusterApi>> {
        let record = self
            .repo
            .get(cluster_id)
            .await
            .map_err(|e| ClusterError::Store(format!("{e:#}")))?
            .ok_or(ClusterError::ClusterNotFound(cluster_id))?;

        let kubeconfig = Self::kubeconfig(&record)?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::ConfigInvalid(e.to_string()))?;
        config.connect_timeout = Some(self.connect_timeout);

        let client =
            Client::try_from(config).map_err(|e| ClusterError::ConfigInvalid(e.to_string()))?;
        let info = client
            .apiserver_version()
            .await
            .map_err(|e| ClusterError::Unreachable(e.to_string()))?;
        debug!(
            "connected to cluster {} ({}) running {}",
            record.id, record.name, info.git_version
        );

        Ok(Arc::new(KubeCluster {
            client,
            record,
            version: info.git_version,
        }))
    }
}

/// One authenticated cluster connection.
///
/// The same client serves core, typed and metrics API groups.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    record: ClusterRecord,
    version: String,
}

impl KubeCluster {
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn dynamic_api(
        &self,
        kind: &KindDescriptor,
        namespace: &str,
    ) -> ClusterResult<Api<DynamicObject>> {
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        let (resource, caps) = kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| match e {
                kube::Error::Discovery(d) => ClusterError::NotRegistered(d.to_string()),
                other => other.into(),
            })?;
        let api = if caps.scope == Scope::Namespaced {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        Ok(api)
    }

    async fn modern_exec(&self, request: &ExecRequest) -> ClusterResult<ExecStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let mut params = AttachParams::default()
            .stdin(request.stdin)
            .stdout(true)
            .stderr(!request.tty)
            .tty(request.tty);
        if let Some(container) = &request.container {
            params = params.container(container.clone());
        }

        let mut attached = pods
            .exec(&request.pod, request.command.clone(), &params)
            .await?;

        let stdin = attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>);
        let stdout = attached
            .stdout()
            .map(|r| Box::new(r) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        let stderr = attached
            .stderr()
            .map(|r| Box::new(r) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);

        let resize = attached.terminal_size().map(|mut sink| {
            let (tx, mut rx) = mpsc::channel::<TerminalSize>(RESIZE_QUEUE);
            tokio::spawn(async move {
                while let Some(size) = rx.recv().await {
                    let size = kube::api::TerminalSize {
                        width: size.width,
                        height: size.height,
                    };
                    if sink.send(size).await.is_err() {
                        break;
                    }
                }
            });
            tx
        });

        let status = attached.take_status();
        let exit = Box::pin(async move {
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            if let Err(e) = attached.join().await {
                debug!("exec stream ended with error: {}", e);
            }
            exit_from_status(status)
        });

        Ok(ExecStream {
            stdin,
            stdout,
            stderr,
            resize,
            exit,
        })
    }
}

pub(super) fn exit_from_status(status: Option<Status>) -> ExecExit {
    match status {
        Some(status) if status.status.as_deref() == Some("Failure") => {
            let message = status
                .message
                .or(status.reason)
                .unwrap_or_else(|| "command failed".to_string());
            ExecExit::failure(message)
        }
        _ => ExecExit::success(),
    }
}

pub(super) fn log_path(namespace: &str, pod: &str, options: &LogOptions) -> String {
    let mut query = vec!["timestamps=true".to_string()];
    if let Some(container) = &options.container {
        query.push(format!("container={}", urlencoding::encode(container)));
    }
    if options.follow {
        query.push("follow=true".to_string());
    }
    if options.previous {
        query.push("previous=true".to_string());
    }
    if let Some(tail) = options.tail_lines {
        query.push(format!("tailLines={tail}"));
    }
    if let Some(since) = options.since_time {
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        query.push(format!("sinceTime={}", urlencoding::encode(&since)));
    } else if let Some(seconds) = options.since_seconds {
        query.push(format!("sinceSeconds={seconds}"));
    }
    format!(
        "/api/v1/namespaces/{namespace}/pods/{pod}/log?{}",
        query.join("&")
    )
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn server_version(&self) -> ClusterResult<String> {
        Ok(self.version.clone())
    }

    async fn create_resource(
        &self,
        kind: &KindDescriptor,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> ClusterResult<()> {
        let api = self.dynamic_api(kind, namespace).await?;
        let object: DynamicObject = serde_json::from_value(manifest.clone())
            .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
        api.create(&PostParams::default(), &object).await?;
        Ok(())
    }

    async fn delete_resource(
        &self,
        kind: &KindDescriptor,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<()> {
        let api = self.dynamic_api(kind, namespace).await?;
        api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get(name).await?)
    }

    async fn list_pod_events(&self, namespace: &str, pod: &str) -> ClusterResult<Vec<Event>> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("involvedObject.name={pod}");
        let list = events.list(&ListParams::default().fields(&selector)).await?;
        Ok(list.items)
    }

    async fn patch_pod_subresource(
        &self,
        namespace: &str,
        pod: &str,
        subresource: &str,
        patch: &PodPatch,
    ) -> ClusterResult<()> {
        match patch {
            PodPatch::StrategicMerge(value) => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                pods.patch_subresource(
                    subresource,
                    pod,
                    &PatchParams::default(),
                    &Patch::Strategic(value),
                )
                .await?;
            }
            PodPatch::Json(value) => {
                let body = serde_json::to_vec(value)
                    .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
                let request = http::Request::builder()
                    .method(http::Method::PATCH)
                    .uri(format!(
                        "/api/v1/namespaces/{namespace}/pods/{pod}/{subresource}"
                    ))
                    .header(http::header::CONTENT_TYPE, "application/json-patch+json")
                    .body(body)
                    .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
                self.client.request_text(request).await?;
            }
        }
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest, protocol: ExecProtocol) -> ClusterResult<ExecStream> {
        match protocol {
            ExecProtocol::Modern => self.modern_exec(request).await,
            ExecProtocol::Legacy => legacy_exec::exec(&self.record, request).await,
        }
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &LogOptions,
    ) -> ClusterResult<LogLines> {
        let request = http::Request::get(log_path(namespace, pod, options))
            .body(Vec::new())
            .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
        let reader = self.client.request_stream(request).await?;
        Ok(reader.lines().map_err(std::io::Error::other).boxed())
    }

    async fn port_forward(&self, namespace: &str, pod: &str, port: u16) -> ClusterResult<DuplexStream> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = pods.portforward(pod, &[port]).await?;
        let mut upstream = forwarder
            .take_stream(port)
            .ok_or_else(|| ClusterError::Unreachable(format!("no stream for port {port}")))?;

        let (local, mut remote) = tokio::io::duplex(FORWARD_BUFFER);
        let target = format!("{namespace}/{pod}:{port}");
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy_bidirectional(&mut upstream, &mut remote).await {
                debug!("port-forward {} closed: {}", target, e);
            }
            drop(upstream);
            if let Err(e) = forwarder.join().await {
                warn!("port-forward {} failed: {}", target, e);
            }
        });
        Ok(local)
    }
}
