//! In-memory cluster used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Pod, PodStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::*;

#[derive(Debug, Clone)]
pub struct ExecCall {
    pub request: ExecRequest,
    pub protocol: ExecProtocol,
}

#[derive(Default)]
pub struct FakeCluster {
    pub version: Mutex<String>,
    pub pods: Mutex<HashMap<(String, String), Pod>>,
    pub created: Mutex<Vec<(KindDescriptor, String, serde_json::Value)>>,
    pub deleted: Mutex<Vec<(KindDescriptor, String, String)>>,
    pub patches: Mutex<Vec<(String, String, String, PodPatch)>>,
    pub exec_calls: Mutex<Vec<ExecCall>>,
    pub events: Mutex<Vec<Event>>,
    pub log_lines: Mutex<Vec<String>>,
    /// Kinds whose creation fails with a server error.
    pub failing_kinds: Mutex<HashSet<String>>,
    /// Binaries that do not exist in any container.
    pub missing_binaries: Mutex<HashSet<String>>,
    /// Stderr returned for `sh -c` commands.
    pub shell_stderr: Mutex<String>,
    pub unreachable: AtomicBool,
    pub reject_modern_exec: AtomicBool,
    /// Modern exec calls accepted before upgrades start being refused.
    pub modern_exec_limit: Mutex<Option<usize>>,
    /// Pods whose lookup never answers.
    pub stalled_pods: Mutex<HashSet<String>>,
    pub reject_strategic_patch: AtomicBool,
    pub get_pod_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let cluster = Self::default();
        *cluster.version.lock().unwrap() = "v1.29.4".to_string();
        Arc::new(cluster)
    }

    pub fn insert_pod(&self, namespace: &str, name: &str, phase: &str) {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.namespace = Some(namespace.to_string());
        pod.spec = Some(Default::default());
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        self.pods
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), pod);
    }

    pub fn set_phase(&self, namespace: &str, name: &str, phase: &str) {
        let mut pods = self.pods.lock().unwrap();
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            });
        }
    }

    pub fn set_node(&self, namespace: &str, name: &str, node: &str) {
        let mut pods = self.pods.lock().unwrap();
        if let Some(pod) = pods.get_mut(&(namespace.to_string(), name.to_string())) {
            if let Some(spec) = pod.spec.as_mut() {
                spec.node_name = Some(node.to_string());
            }
        }
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn has_pod(&self, namespace: &str, name: &str) -> bool {
        self.pods
            .lock()
            .unwrap()
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().map(|(_, n)| n.clone()).collect()
    }

    pub fn created_kinds(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _, _)| k.kind.clone())
            .collect()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, n)| n.clone())
            .collect()
    }

    fn check_reachable(&self) -> ClusterResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ClusterError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn server_version(&self) -> ClusterResult<String> {
        self.check_reachable()?;
        Ok(self.version.lock().unwrap().clone())
    }

    async fn create_resource(
        &self,
        kind: &KindDescriptor,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> ClusterResult<()> {
        self.check_reachable()?;
        if self.failing_kinds.lock().unwrap().contains(&kind.kind) {
            return Err(ClusterError::Api {
                code: 422,
                reason: "Invalid".to_string(),
                message: format!("{} rejected", kind.kind),
            });
        }
        self.created
            .lock()
            .unwrap()
            .push((kind.clone(), namespace.to_string(), manifest.clone()));

        if kind.kind == "Pod" {
            let name = manifest["metadata"]["name"].as_str().unwrap_or_default().to_string();
            let key = (namespace.to_string(), name.clone());
            let mut pods = self.pods.lock().unwrap();
            if pods.contains_key(&key) {
                return Err(ClusterError::AlreadyExists(format!(
                    "pods \"{name}\" already exists"
                )));
            }
            let mut pod: Pod = serde_json::from_value(manifest.clone()).unwrap_or_default();
            pod.metadata.namespace = Some(namespace.to_string());
            pod.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            pods.insert(key, pod);
        }
        Ok(())
    }

    async fn delete_resource(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> ClusterResult<()> {
        self.check_reachable()?;
        self.deleted
            .lock()
            .unwrap()
            .push((kind.clone(), namespace.to_string(), name.to_string()));
        if kind.kind == "Pod" {
            let removed = self
                .pods
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
            if removed.is_none() {
                return Err(ClusterError::NotFound(format!("pods \"{name}\" not found")));
            }
        }
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        self.get_pod_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let stalled = self.stalled_pods.lock().unwrap().contains(name);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("pods \"{name}\" not found")))
    }

    async fn list_pod_events(&self, _namespace: &str, _pod: &str) -> ClusterResult<Vec<Event>> {
        self.check_reachable()?;
        Ok(self.events.lock().unwrap().clone())
    }

    async fn patch_pod_subresource(
        &self,
        namespace: &str,
        pod: &str,
        subresource: &str,
        patch: &PodPatch,
    ) -> ClusterResult<()> {
        self.check_reachable()?;
        if matches!(patch, PodPatch::StrategicMerge(_))
            && self.reject_strategic_patch.load(Ordering::SeqCst)
        {
            return Err(ClusterError::NotRegistered(
                "the server could not find the requested resource".to_string(),
            ));
        }
        if !self.has_pod(namespace, pod) {
            return Err(ClusterError::NotFound(format!("pods \"{pod}\" not found")));
        }
        self.patches.lock().unwrap().push((
            namespace.to_string(),
            pod.to_string(),
            subresource.to_string(),
            patch.clone(),
        ));
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest, protocol: ExecProtocol) -> ClusterResult<ExecStream> {
        self.check_reachable()?;
        self.exec_calls.lock().unwrap().push(ExecCall {
            request: request.clone(),
            protocol,
        });
        if protocol == ExecProtocol::Modern {
            let modern_calls = self
                .exec_calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.protocol == ExecProtocol::Modern)
                .count();
            let over_limit = self
                .modern_exec_limit
                .lock()
                .unwrap()
                .is_some_and(|limit| modern_calls > limit);
            if over_limit || self.reject_modern_exec.load(Ordering::SeqCst) {
                return Err(ClusterError::Handshake("upgrade refused".to_string()));
            }
        }
        if !self.has_pod(&request.namespace, &request.pod) {
            return Err(ClusterError::NotFound(format!(
                "pods \"{}\" not found",
                request.pod
            )));
        }

        let binary = request.command.first().cloned().unwrap_or_default();
        let binary = binary.trim_start_matches("/bin/").to_string();
        if self.missing_binaries.lock().unwrap().contains(&binary) {
            return Ok(finished_stream(
                "",
                &format!("exec: \"{binary}\": executable file not found in $PATH"),
                ExecExit::failure("command terminated with non-zero exit code"),
            ));
        }

        if request.tty {
            return Ok(echo_process());
        }

        let stderr = if binary == "sh" && request.command.len() > 1 {
            self.shell_stderr.lock().unwrap().clone()
        } else {
            String::new()
        };
        Ok(finished_stream("", &stderr, ExecExit::success()))
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, _options: &LogOptions) -> ClusterResult<LogLines> {
        self.check_reachable()?;
        if !self.has_pod(namespace, pod) {
            return Err(ClusterError::NotFound(format!("pods \"{pod}\" not found")));
        }
        let lines: Vec<std::io::Result<String>> =
            self.log_lines.lock().unwrap().iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn port_forward(&self, _namespace: &str, _pod: &str, _port: u16) -> ClusterResult<DuplexStream> {
        self.check_reachable()?;
        let (local, mut remote) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok(n) = remote.read(&mut buf).await {
                if n == 0 || remote.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        Ok(local)
    }
}

fn finished_stream(stdout: &str, stderr: &str, exit: ExecExit) -> ExecStream {
    let stdout = std::io::Cursor::new(stdout.as_bytes().to_vec());
    let stderr = std::io::Cursor::new(stderr.as_bytes().to_vec());
    ExecStream {
        stdin: None,
        stdout: Some(Box::new(stdout)),
        stderr: Some(Box::new(stderr)),
        resize: None,
        exit: Box::pin(async move { exit }),
    }
}

/// Interactive process that answers `echo <x>` lines and exits on EOT.
fn echo_process() -> ExecStream {
    let (stdin_writer, mut stdin_reader) = tokio::io::duplex(1024);
    let (mut stdout_writer, stdout_reader) = tokio::io::duplex(1024);
    let (resize_tx, mut resize_rx) = mpsc::channel::<TerminalSize>(4);
    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let mut line = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                size = resize_rx.recv() => {
                    if let Some(size) = size {
                        let msg = format!("resized {}x{}\n", size.width, size.height);
                        let _ = stdout_writer.write_all(msg.as_bytes()).await;
                    }
                }
                read = stdin_reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    for byte in &buf[..n] {
                        if *byte == 0x04 {
                            let _ = exit_tx.send(ExecExit::success());
                            return;
                        }
                        if *byte == b'\n' {
                            let text = String::from_utf8_lossy(&line).to_string();
                            if let Some(rest) = text.strip_prefix("echo ") {
                                let _ = stdout_writer.write_all(format!("{rest}\n").as_bytes()).await;
                            }
                            line.clear();
                        } else {
                            line.push(*byte);
                        }
                    }
                }
            }
        }
        let _ = exit_tx.send(ExecExit::success());
    });

    ExecStream {
        stdin: Some(Box::new(stdin_writer)),
        stdout: Some(Box::new(stdout_reader)),
        stderr: None,
        resize: Some(resize_tx),
        exit: Box::pin(async move { exit_rx.await.unwrap_or_else(|_| ExecExit::success()) }),
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub clusters: Mutex<HashMap<i64, Arc<FakeCluster>>>,
}

impl FakeConnector {
    pub fn with_cluster(cluster_id: i64, cluster: Arc<FakeCluster>) -> Arc<Self> {
        let connector = Self::default();
        connector.clusters.lock().unwrap().insert(cluster_id, cluster);
        Arc::new(connector)
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, cluster_id: i64) -> ClusterResult<Arc<dyn ClusterApi>> {
        let cluster = self
            .clusters
            .lock()
            .unwrap()
            .get(&cluster_id)
            .cloned()
            .ok_or(ClusterError::ClusterNotFound(cluster_id))?;
        Ok(cluster as Arc<dyn ClusterApi>)
    }
}
