//! Injection and cooperative termination of ephemeral debug containers.

use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use log::{info, warn};
use regex::Regex;
use serde_json::{Value, json};

use super::models::{
    EphemeralAction, EphemeralContainerBasicData, EphemeralContainerRequest, NewEphemeralRecord,
    PodContainerList,
};
use super::repository::EphemeralContainerRepository;
use crate::cluster::{ClusterApi, ClusterConnector, ClusterError, ExecRequest, PodPatch};
use crate::session::{TerminalError, TerminalResult};

/// Kubernetes versions that serve the `ephemeralcontainers` subresource.
pub const DEFAULT_SERVER_VERSION_REGEX: &str = r"v[1-9]\.(2[3-9]|[3-9][0-9])\b.*";

const NAME_SUFFIX_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r',
    's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Script the container runs; its name is what `pgrep` later looks for.
pub fn script_name(container: &str) -> String {
    format!("./{container}-podterm.sh")
}

pub fn start_command(container: &str) -> Vec<String> {
    let script = script_name(container);
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo 'while true; do sleep 600; done;' > {script} && sh {script}"),
    ]
}

/// SIGPROF is not handled by the sleep loop, so the script dies with it.
pub fn kill_command(container: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("kill -16 $(pgrep -f '{}' -o)", script_name(container)),
    ]
}

fn suffixed(name: &str) -> String {
    format!("{}-{}", name, nanoid::nanoid!(5, &NAME_SUFFIX_ALPHABET))
}

/// Build the container to inject from a basic or advanced payload.
pub fn build_container(request: &EphemeralContainerRequest) -> TerminalResult<EphemeralContainer> {
    let mut container = if let Some(advanced) = &request.advanced_data {
        let container: EphemeralContainer = serde_json::from_str(&advanced.manifest)
            .map_err(|e| TerminalError::BadRequest(format!("invalid ephemeral container manifest: {e}")))?;
        let blank = |v: &Option<String>| v.as_deref().is_none_or(str::is_empty);
        if container.name.is_empty() || blank(&container.image) || blank(&container.target_container_name) {
            return Err(TerminalError::BadRequest(
                "containerName, targetContainerName and image cannot be empty".to_string(),
            ));
        }
        if container.command.as_ref().is_some_and(|c| !c.is_empty()) {
            return Err(TerminalError::BadRequest(
                "Command field is not supported, please remove command and try again".to_string(),
            ));
        }
        container
    } else if let Some(basic) = &request.basic_data {
        if basic.container_name.is_empty()
            || basic.target_container_name.is_empty()
            || basic.image.is_empty()
        {
            return Err(TerminalError::BadRequest(
                "containerName, targetContainerName and image cannot be empty".to_string(),
            ));
        }
        EphemeralContainer {
            name: basic.container_name.clone(),
            image: Some(basic.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            stdin: Some(true),
            tty: Some(true),
            termination_message_policy: Some("File".to_string()),
            target_container_name: Some(basic.target_container_name.clone()),
            ..Default::default()
        }
    } else {
        return Err(TerminalError::BadRequest(
            "either basicData or advancedData is required".to_string(),
        ));
    };

    container.name = suffixed(&container.name);
    container.command = Some(start_command(&container.name));
    Ok(container)
}

/// Strategic-merge patch adding `container`. Ephemeral containers merge on `name`, so the
/// patch between the pod and the pod plus one container is that container alone.
pub fn strategic_patch(container: &Value) -> Value {
    json!({ "spec": { "ephemeralContainers": [container] } })
}

/// JSON patch for clusters that only know the older subresource shape.
pub fn legacy_patch(container: &Value) -> Value {
    json!([{ "op": "add", "path": "/ephemeralContainers/-", "value": container }])
}

fn pod_gone(err: ClusterError) -> TerminalError {
    match err {
        ClusterError::NotFound(message) => TerminalError::PodGone(message),
        other => other.into(),
    }
}

/// Service for ephemeral containers.
pub struct EphemeralContainerService {
    connector: Arc<dyn ClusterConnector>,
    repo: EphemeralContainerRepository,
    version_pattern: Regex,
}

impl EphemeralContainerService {
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        repo: EphemeralContainerRepository,
        server_version_regex: &str,
    ) -> anyhow::Result<Self> {
        let version_pattern = Regex::new(server_version_regex)
            .with_context(|| format!("invalid server version pattern {server_version_regex:?}"))?;
        Ok(Self {
            connector,
            repo,
            version_pattern,
        })
    }

    async fn compatible_cluster(&self, cluster_id: i64) -> TerminalResult<Arc<dyn ClusterApi>> {
        let cluster = self.connector.connect(cluster_id).await?;
        let version = cluster.server_version().await?;
        if !self.version_pattern.is_match(&version) {
            return Err(TerminalError::FeatureUnsupported(format!(
                "ephemeral containers are not supported on Kubernetes {version}, v1.23 or later is required"
            )));
        }
        Ok(cluster)
    }

    /// Inject a debug container into a running pod and record who did it.
    pub async fn create(
        &self,
        user_id: i64,
        request: &EphemeralContainerRequest,
    ) -> TerminalResult<EphemeralContainerBasicData> {
        let container = build_container(request)?;
        let cluster = self.compatible_cluster(request.cluster_id).await?;
        cluster
            .get_pod(&request.namespace, &request.pod_name)
            .await
            .map_err(pod_gone)?;

        let value = serde_json::to_value(&container)
            .map_err(|e| TerminalError::Internal(format!("encoding ephemeral container: {e}")))?;
        let applied = cluster
            .patch_pod_subresource(
                &request.namespace,
                &request.pod_name,
                "ephemeralcontainers",
                &PodPatch::StrategicMerge(strategic_patch(&value)),
            )
            .await;
        match applied {
            Ok(()) => {}
            Err(ClusterError::NotRegistered(message)) => {
                warn!(
                    "strategic patch of ephemeral containers refused ({}), retrying as json patch",
                    message
                );
                cluster
                    .patch_pod_subresource(
                        &request.namespace,
                        &request.pod_name,
                        "ephemeralcontainers",
                        &PodPatch::Json(legacy_patch(&value)),
                    )
                    .await
                    .map_err(pod_gone)?;
            }
            Err(e) => return Err(pod_gone(e)),
        }

        let created = EphemeralContainerBasicData {
            container_name: container.name.clone(),
            target_container_name: container.target_container_name.clone().unwrap_or_default(),
            image: container.image.clone().unwrap_or_default(),
        };
        self.repo
            .record(&NewEphemeralRecord {
                cluster_id: request.cluster_id,
                namespace: request.namespace.clone(),
                pod_name: request.pod_name.clone(),
                container_name: created.container_name.clone(),
                target_container: created.target_container_name.clone(),
                image: created.image.clone(),
                manifest: Some(value.to_string()),
                action: EphemeralAction::Create,
                user_id,
            })
            .await?;

        info!(
            "created ephemeral container {} in {}/{} on cluster {}",
            created.container_name, request.namespace, request.pod_name, request.cluster_id
        );
        Ok(created)
    }

    /// Stop a container this service created by killing its keep-alive script.
    pub async fn terminate(&self, user_id: i64, request: &EphemeralContainerRequest) -> TerminalResult<()> {
        let name = request
            .basic_data
            .as_ref()
            .map(|b| b.container_name.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TerminalError::BadRequest("basicData.containerName is required".to_string()))?;

        let created = self
            .repo
            .find_created(request.cluster_id, &request.namespace, &request.pod_name, &name)
            .await?
            .ok_or_else(|| TerminalError::ExternallyInjected(name.clone()))?;

        let cluster = self.compatible_cluster(request.cluster_id).await?;
        let exec = ExecRequest::command(
            &request.namespace,
            &request.pod_name,
            Some(&name),
            kill_command(&name),
        );
        let output = cluster.exec_output(&exec).await.map_err(pod_gone)?;
        if !output.stderr.trim().is_empty() {
            warn!(
                "terminating ephemeral container {} in {}/{} failed: {}",
                name,
                request.namespace,
                request.pod_name,
                output.stderr.trim()
            );
            return Err(TerminalError::Internal(format!(
                "terminating ephemeral container {name} failed: {}",
                output.stderr.trim()
            )));
        }

        self.repo
            .record(&NewEphemeralRecord {
                cluster_id: request.cluster_id,
                namespace: request.namespace.clone(),
                pod_name: request.pod_name.clone(),
                container_name: name.clone(),
                target_container: created.target_container,
                image: created.image,
                manifest: None,
                action: EphemeralAction::Terminate,
                user_id,
            })
            .await?;
        info!(
            "terminated ephemeral container {} in {}/{}",
            name, request.namespace, request.pod_name
        );
        Ok(())
    }

    pub async fn list_containers(
        &self,
        cluster_id: i64,
        namespace: &str,
        pod_name: &str,
    ) -> TerminalResult<PodContainerList> {
        let cluster = self.connector.connect(cluster_id).await?;
        let pod = cluster.get_pod(namespace, pod_name).await?;
        Ok(container_list(&pod))
    }

    /// Record that a terminal was opened into `container` if it is an ephemeral container.
    /// Returns whether a record was written.
    pub async fn audit_access(
        &self,
        user_id: i64,
        cluster_id: i64,
        namespace: &str,
        pod_name: &str,
        container: &str,
    ) -> TerminalResult<bool> {
        let cluster = self.connector.connect(cluster_id).await?;
        let pod = cluster.get_pod(namespace, pod_name).await?;
        let Some(ephemeral) = pod
            .spec
            .as_ref()
            .and_then(|s| s.ephemeral_containers.as_ref())
            .and_then(|list| list.iter().find(|c| c.name == container))
        else {
            return Ok(false);
        };

        self.repo
            .record(&NewEphemeralRecord {
                cluster_id,
                namespace: namespace.to_string(),
                pod_name: pod_name.to_string(),
                container_name: container.to_string(),
                target_container: ephemeral.target_container_name.clone().unwrap_or_default(),
                image: ephemeral.image.clone().unwrap_or_default(),
                manifest: None,
                action: EphemeralAction::Accessed,
                user_id,
            })
            .await?;
        Ok(true)
    }
}

/// Names of a pod's containers; ephemeral containers only while running.
pub fn container_list(pod: &Pod) -> PodContainerList {
    let running: Vec<&str> = pod
        .status
        .as_ref()
        .and_then(|s| s.ephemeral_container_statuses.as_ref())
        .into_iter()
        .flatten()
        .filter(|c| c.state.as_ref().is_some_and(|s| s.running.is_some()))
        .map(|c| c.name.as_str())
        .collect();

    let Some(spec) = pod.spec.as_ref() else {
        return PodContainerList::default();
    };
    PodContainerList {
        containers: spec.containers.iter().map(|c| c.name.clone()).collect(),
        init_containers: spec
            .init_containers
            .iter()
            .flatten()
            .map(|c| c.name.clone())
            .collect(),
        ephemeral_containers: spec
            .ephemeral_containers
            .iter()
            .flatten()
            .filter(|c| running.contains(&c.name.as_str()))
            .map(|c| c.name.clone())
            .collect(),
    }
}
