//! Session controller: debug pod lifecycle on top of the store, the registry and the
//! exec hub.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Event, Pod};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::error::{TerminalError, TerminalResult};
use super::models::{
    ManifestEditRequest, ManifestEditResponse, NewTerminalAccess, TerminalAccessData,
    TerminalMetadata, TerminalStatus, UserTerminalSessionRequest, UserTerminalSessionResponse,
    UserTerminalShellSessionRequest, ValidShellResponse, ValidateShellQuery,
};
use super::registry::{LiveSession, SessionRegistry};
use super::repository::TerminalAccessRepository;
use crate::cluster::{ClusterApi, ClusterConnector};
use crate::exec::{
    ActivityClock, ExecTarget, POD_NOT_FOUND, TerminalHub, auto_select_shell, is_supported_shell,
    check_shell,
};
use crate::templates::{AUTO_SELECT, ApplyPlan, TemplateRepository, TemplateVars};

const POD_DELETE_POLL: Duration = Duration::from_millis(500);

/// Tunables of the terminal subsystem.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub max_sessions_per_user: usize,
    /// Namespace used when a request does not name one.
    pub default_namespace: String,
    /// Reconciler period; also the grace period of Starting sessions.
    pub status_sync_interval: Duration,
    pub idle_budget: Duration,
    /// Deadline for single pod reads.
    pub cluster_timeout: Duration,
    /// Sessions checked concurrently per reconciler batch.
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// How long update waits for the old pod to disappear.
    pub pod_delete_wait: Duration,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 3,
            default_namespace: "default".to_string(),
            status_sync_interval: Duration::from_secs(30),
            idle_budget: Duration::from_secs(10 * 60),
            cluster_timeout: Duration::from_secs(5),
            batch_size: 5,
            batch_timeout: Duration::from_secs(5),
            pod_delete_wait: Duration::from_secs(60),
        }
    }
}

/// Query of `GET /user/terminal/get`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatusQuery {
    pub terminal_access_id: i64,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub shell_name: String,
    #[serde(default)]
    pub container_name: Option<String>,
}

pub fn pod_name(cluster_id: i64, user_id: i64, index: usize) -> String {
    format!("terminal-access-cluster-{cluster_id}-user-{user_id}-{index}")
}

fn validate_start(request: &UserTerminalSessionRequest) -> TerminalResult<()> {
    if request.cluster_id <= 0 {
        return Err(TerminalError::BadRequest("clusterId is required".to_string()));
    }
    if request.base_image.trim().is_empty() {
        return Err(TerminalError::BadRequest("baseImage is required".to_string()));
    }
    validate_shell_name(&request.shell_name)
}

fn validate_shell_name(shell: &str) -> TerminalResult<()> {
    if shell.trim().is_empty() {
        return Err(TerminalError::BadRequest("shellName is required".to_string()));
    }
    if shell != AUTO_SELECT && !is_supported_shell(shell) {
        return Err(TerminalError::BadRequest(format!(
            "shell \"{shell}\" is not supported"
        )));
    }
    Ok(())
}

/// Service for terminal sessions.
pub struct TerminalService {
    pub(super) settings: TerminalSettings,
    pub(super) connector: Arc<dyn ClusterConnector>,
    pub(super) repo: TerminalAccessRepository,
    pub(super) templates: TemplateRepository,
    pub(super) registry: Arc<SessionRegistry>,
    hub: Arc<TerminalHub>,
    start_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl TerminalService {
    pub fn new(
        settings: TerminalSettings,
        connector: Arc<dyn ClusterConnector>,
        repo: TerminalAccessRepository,
        templates: TemplateRepository,
        hub: Arc<TerminalHub>,
    ) -> Self {
        Self {
            settings,
            connector,
            repo,
            templates,
            registry: Arc::new(SessionRegistry::new()),
            hub,
            start_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &TerminalSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<TerminalHub> {
        &self.hub
    }

    fn namespace_or_default(&self, namespace: &str) -> String {
        if namespace.trim().is_empty() {
            self.settings.default_namespace.clone()
        } else {
            namespace.to_string()
        }
    }

    fn vars_for(&self, data: &TerminalAccessData) -> TemplateVars {
        let metadata = data.metadata();
        TemplateVars {
            pod_name: data.pod_name.clone(),
            cluster_id: data.cluster_id,
            user_id: data.user_id,
            base_image: metadata.base_image,
            default_namespace: data.namespace_or(&self.settings.default_namespace),
            node_name: data.node_name.clone(),
            node_taints: Vec::new(),
            rewrite_images: true,
        }
    }

    /// Load a session from the registry or the store and check that `user_id` owns it.
    async fn load_owned(&self, user_id: i64, id: i64) -> TerminalResult<TerminalAccessData> {
        let data = match self.registry.get(id).await {
            Some(session) => session.data,
            None => self
                .repo
                .get(id)
                .await?
                .ok_or_else(|| TerminalError::NotFound(format!("terminal session {id} not found")))?,
        };
        if data.user_id != user_id {
            return Err(TerminalError::Forbidden(format!(
                "terminal session {id} belongs to another user"
            )));
        }
        Ok(data)
    }

    /// Start a new debug pod session.
    pub async fn start(
        &self,
        user_id: i64,
        request: UserTerminalSessionRequest,
    ) -> TerminalResult<UserTerminalSessionResponse> {
        self.start_with(user_id, request, None).await
    }

    async fn start_with(
        &self,
        user_id: i64,
        request: UserTerminalSessionRequest,
        pod_manifest: Option<Value>,
    ) -> TerminalResult<UserTerminalSessionResponse> {
        validate_start(&request)?;

        let lock = self
            .start_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let live = self.registry.list_for_user(user_id).await;
        let max = self.settings.max_sessions_per_user;
        if live.len() >= max {
            return Err(TerminalError::ConcurrencyLimit { max });
        }

        let taken: Vec<String> = self
            .repo
            .list_for_user(user_id)
            .await?
            .into_iter()
            .map(|row| row.pod_name)
            .collect();
        let mut index = live.len() + 1;
        while taken.contains(&pod_name(request.cluster_id, user_id, index)) {
            index += 1;
        }
        let pod_name = pod_name(request.cluster_id, user_id, index);

        let namespace = self.namespace_or_default(&request.namespace);
        let node_name = if request.node_name.trim().is_empty() {
            AUTO_SELECT.to_string()
        } else {
            request.node_name.clone()
        };
        let vars = TemplateVars {
            pod_name: pod_name.clone(),
            cluster_id: request.cluster_id,
            user_id,
            base_image: request.base_image.clone(),
            default_namespace: namespace.clone(),
            node_name: node_name.clone(),
            node_taints: request.node_taints.clone(),
            rewrite_images: pod_manifest.is_none(),
        };

        let templates = self.templates.fetch_all().await?;
        let mut plan = ApplyPlan::build(&templates, &vars)?;
        if let Some(manifest) = pod_manifest {
            let edited = ApplyPlan::from_pod_manifest(manifest, &vars)?;
            if let Some(pod) = edited.pod() {
                plan = plan.with_pod(pod.clone());
            }
        }

        let cluster = self.connector.connect(request.cluster_id).await?;
        let applied = plan.apply(cluster.as_ref(), &namespace).await;

        let row = self
            .repo
            .save(&NewTerminalAccess {
                user_id,
                cluster_id: request.cluster_id,
                node_name,
                pod_name,
                metadata: TerminalMetadata {
                    base_image: request.base_image,
                    shell_name: request.shell_name,
                    namespace: namespace.clone(),
                },
            })
            .await?;

        if let Err(e) = applied {
            let reason = e.to_string();
            warn!(
                "applying templates for session {} ({}) failed: {}",
                row.id, row.pod_name, reason
            );
            self.repo
                .update_status(row.id, TerminalStatus::Error, Some(&reason))
                .await?;
            return Err(e.into());
        }

        self.registry.insert(LiveSession::new(row.clone())).await;
        info!(
            "started terminal session {} for user {} as {}/{}",
            row.id, user_id, namespace, row.pod_name
        );
        Ok(UserTerminalSessionResponse::from_data(&row))
    }

    /// Recreate the pod of an existing session with new settings. The session id, pod name
    /// and namespace are kept.
    pub async fn update(
        &self,
        user_id: i64,
        request: UserTerminalSessionRequest,
    ) -> TerminalResult<UserTerminalSessionResponse> {
        let id = request
            .id
            .ok_or_else(|| TerminalError::BadRequest("id is required".to_string()))?;
        validate_start(&request)?;

        let data = self.load_owned(user_id, id).await?;
        if data.status.is_terminal() {
            return Err(TerminalError::AlreadyTerminated(id));
        }
        self.close_exec(id).await;

        let namespace = data.namespace_or(&self.settings.default_namespace);
        let node_name = if request.node_name.trim().is_empty() {
            AUTO_SELECT.to_string()
        } else {
            request.node_name.clone()
        };
        let vars = TemplateVars {
            pod_name: data.pod_name.clone(),
            cluster_id: data.cluster_id,
            user_id,
            base_image: request.base_image.clone(),
            default_namespace: namespace.clone(),
            node_name: node_name.clone(),
            node_taints: request.node_taints.clone(),
            rewrite_images: true,
        };
        let templates = self.templates.fetch_all().await?;
        let plan = ApplyPlan::build(&templates, &vars)?.pod_only();

        let cluster = self.connector.connect(data.cluster_id).await?;
        plan.delete(cluster.as_ref(), &namespace).await?;
        self.wait_for_pod_deletion(cluster.as_ref(), &namespace, &data.pod_name)
            .await?;
        plan.apply(cluster.as_ref(), &namespace).await?;

        let metadata = TerminalMetadata {
            base_image: request.base_image,
            shell_name: request.shell_name,
            namespace,
        };
        self.repo.update_metadata(id, &metadata).await?;
        self.repo.update_node_name(id, &node_name).await?;

        let row = self
            .repo
            .get(id)
            .await?
            .ok_or_else(|| TerminalError::NotFound(format!("terminal session {id} not found")))?;
        self.registry.insert(LiveSession::new(row.clone())).await;
        info!("recreated pod {} for session {}", row.pod_name, id);
        Ok(UserTerminalSessionResponse::from_data(&row))
    }

    async fn wait_for_pod_deletion(
        &self,
        cluster: &dyn ClusterApi,
        namespace: &str,
        pod: &str,
    ) -> TerminalResult<()> {
        let deadline = tokio::time::Instant::now() + self.settings.pod_delete_wait;
        loop {
            match cluster.get_pod(namespace, pod).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(_) if tokio::time::Instant::now() >= deadline => {
                    return Err(TerminalError::Internal(format!(
                        "timed out waiting for pod {namespace}/{pod} to be deleted"
                    )));
                }
                Ok(_) => tokio::time::sleep(POD_DELETE_POLL).await,
            }
        }
    }

    /// Record the shell to use for a session. Running sessions get the shell checked first.
    pub async fn update_shell(
        &self,
        user_id: i64,
        request: UserTerminalShellSessionRequest,
    ) -> TerminalResult<UserTerminalSessionResponse> {
        validate_shell_name(&request.shell_name)?;
        let id = request.terminal_access_id;
        let data = self.load_owned(user_id, id).await?;
        self.close_exec(id).await;

        let mut response = UserTerminalSessionResponse::from_data(&data);
        if data.status.is_terminal() {
            response.error_reason = data.status_reason.clone().unwrap_or_default();
            return Ok(response);
        }

        let mut shell = request.shell_name.clone();
        if data.status == TerminalStatus::Running {
            let cluster = self.connector.connect(data.cluster_id).await?;
            let namespace = data.namespace_or(&self.settings.default_namespace);
            let check = validate_shell_in(
                cluster.as_ref(),
                &namespace,
                &data.pod_name,
                request.container_name.as_deref(),
                &shell,
            )
            .await;
            if check.error_reason == POD_NOT_FOUND {
                self.mark_terminated(id, POD_NOT_FOUND).await?;
                response.status = Some(TerminalStatus::Terminated);
                response.error_reason = POD_NOT_FOUND.to_string();
                return Ok(response);
            }
            if !check.is_valid_shell {
                response.is_valid_shell = false;
                response.error_reason = check.error_reason;
                response.shell_name = check.shell_name;
                return Ok(response);
            }
            shell = check.shell_name;
        }

        let mut metadata = data.metadata();
        metadata.shell_name = shell.clone();
        self.repo.update_metadata(id, &metadata).await?;
        let encoded = serde_json::to_string(&metadata).unwrap_or_default();
        self.registry
            .update(id, |session| {
                session.data.metadata = encoded;
                session.exec_session_id = None;
                session.activity.touch();
            })
            .await;

        response.shell_name = shell;
        response.is_valid_shell = true;
        Ok(response)
    }

    /// Delete the pod and its account and binding, and mark the session Terminated.
    pub async fn disconnect(&self, user_id: i64, id: i64) -> TerminalResult<()> {
        let data = self.load_owned(user_id, id).await?;
        self.terminate(&data, "disconnected by user").await
    }

    /// Disconnect in the background; errors are logged.
    pub async fn stop(self: &Arc<Self>, user_id: i64, id: i64) -> TerminalResult<()> {
        let data = self.load_owned(user_id, id).await?;
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.terminate(&data, "stopped by user").await {
                warn!("stopping terminal session {} failed: {}", data.id, e);
            }
        });
        Ok(())
    }

    /// Disconnect every live session of `user_id`. Returns how many were terminated.
    pub async fn disconnect_all_for_user(&self, user_id: i64) -> TerminalResult<usize> {
        let mut sessions: Vec<TerminalAccessData> = self
            .registry
            .list_for_user(user_id)
            .await
            .into_iter()
            .map(|s| s.data)
            .collect();
        for row in self.repo.list_for_user(user_id).await? {
            if !sessions.iter().any(|s| s.id == row.id) {
                sessions.push(row);
            }
        }

        let mut terminated = 0;
        for data in &sessions {
            match self.terminate(data, "disconnected for retry").await {
                Ok(()) => terminated += 1,
                Err(e) => warn!("disconnecting terminal session {} failed: {}", data.id, e),
            }
        }
        if terminated > 0 {
            info!("disconnected {} session(s) of user {}", terminated, user_id);
        }
        Ok(terminated)
    }

    pub async fn disconnect_and_retry(
        &self,
        user_id: i64,
        request: UserTerminalSessionRequest,
    ) -> TerminalResult<UserTerminalSessionResponse> {
        self.disconnect_all_for_user(user_id).await?;
        self.start(user_id, request).await
    }

    /// Tear down a session regardless of owner. Already sunk sessions are left alone.
    pub(super) async fn terminate(&self, data: &TerminalAccessData, reason: &str) -> TerminalResult<()> {
        if data.status.is_terminal() {
            return Ok(());
        }
        self.close_exec(data.id).await;

        let namespace = data.namespace_or(&self.settings.default_namespace);
        let templates = self.templates.fetch_all().await?;
        let plan = ApplyPlan::build(&templates, &self.vars_for(data))?;
        let cluster = self.connector.connect(data.cluster_id).await?;
        plan.delete(cluster.as_ref(), &namespace).await?;

        self.mark_terminated(data.id, reason).await?;
        info!(
            "terminated session {} ({}/{}): {}",
            data.id, namespace, data.pod_name, reason
        );
        Ok(())
    }

    async fn mark_terminated(&self, id: i64, reason: &str) -> TerminalResult<()> {
        self.repo
            .update_status(id, TerminalStatus::Terminated, Some(reason))
            .await?;
        if let Some(session) = self.registry.remove(id).await {
            if let Some(exec_id) = session.exec_session_id {
                self.hub.close(&exec_id);
            }
        }
        Ok(())
    }

    pub(super) async fn close_exec(&self, id: i64) {
        let Some(session) = self.registry.get(id).await else {
            return;
        };
        if let Some(exec_id) = session.exec_session_id {
            self.hub.close(&exec_id);
            self.registry
                .update(id, |session| session.exec_session_id = None)
                .await;
        }
    }

    /// Current state of a session. When the pod runs, an exec session is opened and its id
    /// returned for the browser to bind.
    pub async fn fetch_status(
        &self,
        user_id: i64,
        query: TerminalStatusQuery,
    ) -> TerminalResult<UserTerminalSessionResponse> {
        let id = query.terminal_access_id;
        let entry = self.registry.get(id).await;

        if let Some(session) = &entry {
            if let Some(exec_id) = &session.exec_session_id {
                if self.hub.is_active(exec_id) {
                    let data = self.load_owned(user_id, id).await?;
                    let mut response = UserTerminalSessionResponse::from_data(&data);
                    response.user_terminal_session_id = exec_id.clone();
                    return self.check_requested_shell(response, &data, &query).await;
                }
            }
        }

        let mut data = self.load_owned(user_id, id).await?;
        if data.status.is_terminal() {
            let mut response = UserTerminalSessionResponse::from_data(&data);
            response.error_reason = data.terminated_reason();
            return Ok(response);
        }

        let cluster = self.connector.connect(data.cluster_id).await?;
        let namespace = data.namespace_or(&self.settings.default_namespace);
        let pod = match cluster.get_pod(&namespace, &data.pod_name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                let reason = e.to_string();
                self.mark_terminated(id, &reason).await?;
                data.status = TerminalStatus::Terminated;
                data.status_reason = Some(reason);
                let mut response = UserTerminalSessionResponse::from_data(&data);
                response.error_reason = data.terminated_reason();
                return Ok(response);
            }
            Err(e) => return Err(e.into()),
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();
        let observed = TerminalStatus::from_pod_phase(&phase).unwrap_or(data.status);
        if observed == TerminalStatus::Terminated {
            let reason = pod_end_reason(&pod, &phase);
            self.mark_terminated(id, &reason).await?;
            data.status = TerminalStatus::Terminated;
            data.status_reason = Some(reason);
            let mut response = UserTerminalSessionResponse::from_data(&data);
            response.error_reason = data.terminated_reason();
            return Ok(response);
        }
        if observed != data.status
            && self.repo.update_status(id, observed, None).await?
        {
            data.status = observed;
        }

        if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
            if node != data.node_name {
                self.repo.update_node_name(id, &node).await?;
                data.node_name = node;
            }
        }

        let activity = entry.as_ref().map(|s| Arc::clone(&s.activity));
        let mut exec_session_id = None;
        if data.status == TerminalStatus::Running {
            let shell = if query.shell_name.is_empty() {
                data.metadata().shell_name
            } else {
                query.shell_name.clone()
            };
            let activity = activity
                .clone()
                .unwrap_or_else(|| Arc::new(ActivityClock::new()));
            let exec_id = self.hub.open(ExecTarget {
                cluster: Arc::clone(&cluster),
                namespace: namespace.clone(),
                pod: data.pod_name.clone(),
                container: query.container_name.clone().filter(|c| !c.is_empty()),
                shell,
                activity: Some(Arc::clone(&activity)),
            });
            debug!("opened exec session {} for terminal {}", exec_id, id);
            exec_session_id = Some(exec_id);

            if entry.is_none() {
                let mut session = LiveSession::new(data.clone());
                session.activity = activity;
                session.exec_session_id = exec_session_id.clone();
                self.registry.insert(session).await;
            }
        } else if entry.is_none() {
            self.registry.insert(LiveSession::new(data.clone())).await;
        }

        if entry.is_some() {
            let refreshed = data.clone();
            let exec_id = exec_session_id.clone();
            self.registry
                .update(id, move |session| {
                    session.data = refreshed;
                    session.exec_session_id = exec_id;
                })
                .await;
        }

        let mut response = UserTerminalSessionResponse::from_data(&data);
        response.user_terminal_session_id = exec_session_id.unwrap_or_default();
        self.check_requested_shell(response, &data, &query).await
    }

    async fn check_requested_shell(
        &self,
        mut response: UserTerminalSessionResponse,
        data: &TerminalAccessData,
        query: &TerminalStatusQuery,
    ) -> TerminalResult<UserTerminalSessionResponse> {
        if data.status != TerminalStatus::Running || query.shell_name.is_empty() {
            return Ok(response);
        }

        let cluster = self.connector.connect(data.cluster_id).await?;
        let namespace = data.namespace_or(&self.settings.default_namespace);
        let check = validate_shell_in(
            cluster.as_ref(),
            &namespace,
            &data.pod_name,
            query.container_name.as_deref().filter(|c| !c.is_empty()),
            &query.shell_name,
        )
        .await;

        if check.error_reason == POD_NOT_FOUND {
            self.mark_terminated(data.id, POD_NOT_FOUND).await?;
            response.status = Some(TerminalStatus::Terminated);
            response.user_terminal_session_id.clear();
            response.error_reason = POD_NOT_FOUND.to_string();
            return Ok(response);
        }
        response.is_valid_shell = check.is_valid_shell;
        response.error_reason = check.error_reason;
        response.shell_name = check.shell_name;
        Ok(response)
    }

    async fn live_pod(
        &self,
        user_id: i64,
        id: i64,
    ) -> TerminalResult<(TerminalAccessData, Arc<dyn ClusterApi>, String)> {
        let data = self.load_owned(user_id, id).await?;
        if data.status.is_terminal() {
            return Err(TerminalError::NotFound(data.terminated_reason()));
        }
        let cluster = self.connector.connect(data.cluster_id).await?;
        let namespace = data.namespace_or(&self.settings.default_namespace);
        Ok((data, cluster, namespace))
    }

    /// The session's pod as served by the cluster.
    pub async fn fetch_manifest(&self, user_id: i64, id: i64) -> TerminalResult<Pod> {
        let (data, cluster, namespace) = self.live_pod(user_id, id).await?;
        Ok(cluster.get_pod(&namespace, &data.pod_name).await?)
    }

    pub async fn fetch_events(&self, user_id: i64, id: i64) -> TerminalResult<Vec<Event>> {
        let (data, cluster, namespace) = self.live_pod(user_id, id).await?;
        Ok(cluster.list_pod_events(&namespace, &data.pod_name).await?)
    }

    /// Replace the session's pod with a caller-edited manifest. Manifests that do not
    /// describe a valid pod come back with `errorComments` instead of an error.
    pub async fn edit_pod_manifest(
        &self,
        user_id: i64,
        request: ManifestEditRequest,
    ) -> TerminalResult<ManifestEditResponse> {
        let mut response = ManifestEditResponse {
            manifest: request.manifest.clone(),
            ..Default::default()
        };

        let manifest: Value = match serde_yaml::from_str(&request.manifest) {
            Ok(value) => value,
            Err(e) => {
                response.error_comments = Some(e.to_string());
                return Ok(response);
            }
        };
        if manifest.get("kind").and_then(Value::as_str) != Some("Pod") {
            return Err(TerminalError::BadRequest(
                "manifest should be of kind \"Pod\"".to_string(),
            ));
        }
        if let Err(e) = serde_json::from_value::<Pod>(manifest.clone()) {
            response.error_comments = Some(e.to_string());
            return Ok(response);
        }

        let mut start = request.user_terminal_request;
        if let Some(id) = start.id.take() {
            let data = self.load_owned(user_id, id).await?;
            self.terminate(&data, "replaced by edited manifest").await?;
            if start.namespace.is_empty() {
                start.namespace = data.namespace_or(&self.settings.default_namespace);
            }
        }
        let started = self.start_with(user_id, start, Some(manifest)).await?;
        response.user_terminal_response = Some(started);
        Ok(response)
    }

    /// Check a shell in an arbitrary pod.
    pub async fn validate_shell(&self, query: ValidateShellQuery) -> TerminalResult<ValidShellResponse> {
        let cluster = self.connector.connect(query.cluster_id).await?;
        let namespace = self.namespace_or_default(&query.namespace);
        Ok(validate_shell_in(
            cluster.as_ref(),
            &namespace,
            &query.pod_name,
            query.container_name.as_deref().filter(|c| !c.is_empty()),
            &query.shell_name,
        )
        .await)
    }

    /// Load every Starting/Running row into the registry. Returns how many were loaded.
    pub async fn sync_running_instances(&self) -> TerminalResult<usize> {
        let rows = self.repo.list_all_live().await?;
        let mut loaded = 0;
        for row in rows {
            if self.registry.insert(LiveSession::new(row)).await {
                loaded += 1;
            }
        }
        info!("loaded {} live terminal session(s)", loaded);
        Ok(loaded)
    }
}

/// Check `shell` (or pick one for `autoSelect`) and describe the outcome.
pub async fn validate_shell_in(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    shell: &str,
) -> ValidShellResponse {
    if shell == AUTO_SELECT {
        return match auto_select_shell(cluster, namespace, pod, container).await {
            Ok(selected) => ValidShellResponse {
                is_valid_shell: true,
                error_reason: String::new(),
                shell_name: selected.to_string(),
            },
            Err(reason) => ValidShellResponse {
                is_valid_shell: false,
                error_reason: reason.to_string(),
                shell_name: shell.to_string(),
            },
        };
    }

    match check_shell(cluster, namespace, pod, container, shell).await {
        Ok(()) => ValidShellResponse {
            is_valid_shell: true,
            error_reason: String::new(),
            shell_name: shell.to_string(),
        },
        Err(POD_NOT_FOUND) => ValidShellResponse {
            is_valid_shell: false,
            error_reason: POD_NOT_FOUND.to_string(),
            shell_name: shell.to_string(),
        },
        Err(_) => ValidShellResponse {
            is_valid_shell: false,
            error_reason: format!("\"{shell}\" is not supported for the selected image"),
            shell_name: shell.to_string(),
        },
    }
}

/// Why a pod stopped, for the session's status reason.
pub(super) fn pod_end_reason(pod: &Pod, phase: &str) -> String {
    let status = pod.status.as_ref();
    let waiting = status
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .find_map(|c| {
            c.state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
                .and_then(|t| t.reason.clone())
        });
    status
        .and_then(|s| s.reason.clone().or_else(|| s.message.clone()))
        .or(waiting)
        .unwrap_or_else(|| format!("pod phase {phase}"))
}
