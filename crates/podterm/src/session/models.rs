//! Terminal session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::templates::NodeTaint;

/// Lifecycle of a debug pod session.
///
/// `Starting → Running → Terminated`, `Starting → Error`, `Running → Error`.
/// Terminated and Error are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalStatus {
    Starting,
    Running,
    Terminated,
    Error,
}

impl TerminalStatus {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    /// Statuses a row may hold right before moving to `self`, including `self`.
    pub fn allowed_from(self) -> &'static [TerminalStatus] {
        match self {
            Self::Starting => &[Self::Starting],
            Self::Running => &[Self::Starting, Self::Running],
            Self::Terminated => &[Self::Starting, Self::Running, Self::Terminated],
            Self::Error => &[Self::Starting, Self::Running, Self::Error],
        }
    }

    pub fn can_transition_to(self, next: TerminalStatus) -> bool {
        next.allowed_from().contains(&self)
    }

    /// Session status for a pod phase. `Unknown` and unrecognised phases give `None`.
    pub fn from_pod_phase(phase: &str) -> Option<Self> {
        match phase {
            "Pending" => Some(Self::Starting),
            "Running" => Some(Self::Running),
            "Succeeded" | "Failed" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalStatus::Starting => write!(f, "Starting"),
            TerminalStatus::Running => write!(f, "Running"),
            TerminalStatus::Terminated => write!(f, "Terminated"),
            TerminalStatus::Error => write!(f, "Error"),
        }
    }
}

impl std::str::FromStr for TerminalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(TerminalStatus::Starting),
            "running" => Ok(TerminalStatus::Running),
            "terminated" => Ok(TerminalStatus::Terminated),
            "error" => Ok(TerminalStatus::Error),
            _ => Err(format!("unknown terminal status: {}", s)),
        }
    }
}

impl TryFrom<String> for TerminalStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

/// Settings stored with a session row as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TerminalMetadata {
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub shell_name: String,
    #[serde(default)]
    pub namespace: String,
}

/// A row of `user_terminal_access_data`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TerminalAccessData {
    pub id: i64,
    pub user_id: i64,
    pub cluster_id: i64,
    pub node_name: String,
    pub pod_name: String,
    /// JSON-encoded [`TerminalMetadata`].
    pub metadata: String,
    #[sqlx(try_from = "String")]
    pub status: TerminalStatus,
    pub status_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TerminalAccessData {
    /// Parsed metadata. A malformed column reads as empty settings.
    pub fn metadata(&self) -> TerminalMetadata {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }

    pub fn namespace_or(&self, default: &str) -> String {
        let ns = self.metadata().namespace;
        if ns.is_empty() { default.to_string() } else { ns }
    }

    /// `pod-terminated(<reason>)`, used when a sunk session is asked for pod details.
    pub fn terminated_reason(&self) -> String {
        format!(
            "pod-terminated({})",
            self.status_reason.as_deref().unwrap_or_default()
        )
    }
}

/// Values written by `save`.
#[derive(Debug, Clone)]
pub struct NewTerminalAccess {
    pub user_id: i64,
    pub cluster_id: i64,
    pub node_name: String,
    pub pod_name: String,
    pub metadata: TerminalMetadata,
}

/// Body of start, update and retry requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTerminalSessionRequest {
    /// Existing session id, required by update.
    #[serde(default)]
    pub id: Option<i64>,
    /// Ignored; the caller's identity comes from the gateway.
    #[serde(default)]
    pub user_id: Option<i64>,
    pub cluster_id: i64,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub shell_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub node_taints: Vec<NodeTaint>,
}

/// Body of `PUT /user/terminal/update/shell`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTerminalShellSessionRequest {
    pub terminal_access_id: i64,
    pub shell_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub container_name: Option<String>,
}

/// Session state returned by every terminal endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTerminalSessionResponse {
    /// Exec session id to bind to, empty until the pod runs.
    #[serde(default)]
    pub user_terminal_session_id: String,
    pub user_id: i64,
    pub terminal_access_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TerminalStatus>,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub shell_name: String,
    #[serde(default)]
    pub is_valid_shell: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_reason: String,
}

impl UserTerminalSessionResponse {
    pub fn from_data(data: &TerminalAccessData) -> Self {
        Self {
            user_id: data.user_id,
            terminal_access_id: data.id,
            status: Some(data.status),
            pod_name: data.pod_name.clone(),
            node_name: data.node_name.clone(),
            shell_name: data.metadata().shell_name,
            ..Default::default()
        }
    }
}

/// Result of probing a shell inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidShellResponse {
    pub is_valid_shell: bool,
    #[serde(default)]
    pub error_reason: String,
    #[serde(default)]
    pub shell_name: String,
}

/// Query of `GET /user/terminal/validateShell`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateShellQuery {
    pub pod_name: String,
    #[serde(default)]
    pub namespace: String,
    pub shell_name: String,
    pub cluster_id: i64,
    #[serde(default)]
    pub container_name: Option<String>,
}

/// Body of `PUT /user/terminal/edit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEditRequest {
    /// Pod manifest, YAML or JSON.
    pub manifest: String,
    pub user_terminal_request: UserTerminalSessionRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEditResponse {
    pub manifest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_terminal_response: Option<UserTerminalSessionResponse>,
}
