//! Test utilities and common setup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Pod, PodStatus};
use tokio::io::DuplexStream;

use podterm::api::{self, AppState};
use podterm::cluster::{
    ClusterApi, ClusterConnector, ClusterError, ClusterResult, ExecExit, ExecProtocol, ExecRequest,
    ExecStream, KindDescriptor, LogLines, LogOptions, PodPatch, PortForwardRegistry,
};
use podterm::db::Database;
use podterm::ephemeral::{
    DEFAULT_SERVER_VERSION_REGEX, EphemeralContainerRepository, EphemeralContainerService,
};
use podterm::exec::TerminalHub;
use podterm::session::{
    TerminalAccessRepository, TerminalService, TerminalSettings,
};
use podterm::templates::TemplateRepository;

pub const CLUSTER_ID: i64 = 1;

/// A cluster that keeps pods in memory. Created pods stay Pending until told otherwise.
#[derive(Default)]
pub struct StubCluster {
    pub version: Mutex<String>,
    pub pods: Mutex<HashMap<(String, String), Pod>>,
    pub log_lines: Mutex<Vec<String>>,
    /// Keep followed log streams open after the stored lines.
    pub follow_stays_open: AtomicBool,
}

impl StubCluster {
    pub fn new(version: &str) -> Arc<Self> {
        let cluster = Self::default();
        *cluster.version.lock().unwrap() = version.to_string();
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

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().map(|(_, n)| n.clone()).collect()
    }

    fn not_found(name: &str) -> ClusterError {
        ClusterError::NotFound(format!("pods \"{name}\" not found"))
    }
}

#[async_trait]
impl ClusterApi for StubCluster {
    async fn server_version(&self) -> ClusterResult<String> {
        Ok(self.version.lock().unwrap().clone())
    }

    async fn create_resource(
        &self,
        kind: &KindDescriptor,
        namespace: &str,
        manifest: &serde_json::Value,
    ) -> ClusterResult<()> {
        if kind.kind == "Pod" {
            let mut pod: Pod = serde_json::from_value(manifest.clone())
                .map_err(|e| ClusterError::InvalidInput(e.to_string()))?;
            let name = pod.metadata.name.clone().unwrap_or_default();
            pod.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            self.pods
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), pod);
        }
        Ok(())
    }

    async fn delete_resource(&self, kind: &KindDescriptor, namespace: &str, name: &str) -> ClusterResult<()> {
        if kind.kind == "Pod" {
            self.pods
                .lock()
                .unwrap()
                .remove(&(namespace.to_string(), name.to_string()));
        }
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn list_pod_events(&self, _namespace: &str, _pod: &str) -> ClusterResult<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn patch_pod_subresource(
        &self,
        namespace: &str,
        pod: &str,
        _subresource: &str,
        _patch: &PodPatch,
    ) -> ClusterResult<()> {
        self.get_pod(namespace, pod).await.map(|_| ())
    }

    async fn exec(&self, request: &ExecRequest, _protocol: ExecProtocol) -> ClusterResult<ExecStream> {
        self.get_pod(&request.namespace, &request.pod).await?;
        Ok(ExecStream {
            stdin: None,
            stdout: Some(Box::new(std::io::Cursor::new(Vec::new()))),
            stderr: Some(Box::new(std::io::Cursor::new(Vec::new()))),
            resize: None,
            exit: Box::pin(async { ExecExit::success() }),
        })
    }

    async fn pod_logs(&self, namespace: &str, pod: &str, options: &LogOptions) -> ClusterResult<LogLines> {
        self.get_pod(namespace, pod).await?;
        let lines: Vec<std::io::Result<String>> =
            self.log_lines.lock().unwrap().iter().cloned().map(Ok).collect();
        let lines = futures::stream::iter(lines);
        if options.follow && self.follow_stays_open.load(Ordering::SeqCst) {
            return Ok(lines.chain(futures::stream::pending()).boxed());
        }
        Ok(lines.boxed())
    }

    async fn port_forward(&self, namespace: &str, pod: &str, _port: u16) -> ClusterResult<DuplexStream> {
        self.get_pod(namespace, pod).await?;
        let (local, _remote) = tokio::io::duplex(64);
        Ok(local)
    }
}

pub struct StubConnector {
    cluster: Arc<StubCluster>,
}

#[async_trait]
impl ClusterConnector for StubConnector {
    async fn connect(&self, cluster_id: i64) -> ClusterResult<Arc<dyn ClusterApi>> {
        if cluster_id != CLUSTER_ID {
            return Err(ClusterError::ClusterNotFound(cluster_id));
        }
        Ok(Arc::clone(&self.cluster) as Arc<dyn ClusterApi>)
    }
}

pub struct TestApp {
    pub router: Router,
    pub cluster: Arc<StubCluster>,
    pub state: AppState,
}

/// Create a test application backed by an in-memory database and a stub cluster.
pub async fn test_app() -> TestApp {
    test_app_with_version("v1.29.4").await
}

pub async fn test_app_with_version(version: &str) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let pool = db.pool().clone();
    let cluster = StubCluster::new(version);
    let connector: Arc<dyn ClusterConnector> = Arc::new(StubConnector {
        cluster: Arc::clone(&cluster),
    });

    let hub = Arc::new(TerminalHub::new(Duration::from_secs(5)));
    let terminal = Arc::new(TerminalService::new(
        TerminalSettings::default(),
        Arc::clone(&connector),
        TerminalAccessRepository::new(pool.clone()),
        TemplateRepository::new(pool.clone()),
        hub,
    ));
    let ephemeral = Arc::new(
        EphemeralContainerService::new(
            Arc::clone(&connector),
            EphemeralContainerRepository::new(pool),
            DEFAULT_SERVER_VERSION_REGEX,
        )
        .unwrap(),
    );

    let state = AppState::new(
        terminal,
        ephemeral,
        connector,
        PortForwardRegistry::new("127.0.0.1"),
    );
    TestApp {
        router: api::create_router(state.clone(), &[]),
        cluster,
        state,
    }
}
