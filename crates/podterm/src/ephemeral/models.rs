//! Ephemeral container models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// What happened to an ephemeral container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EphemeralAction {
    Create,
    Terminate,
    /// A terminal was opened into the container.
    Accessed,
}

impl std::fmt::Display for EphemeralAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EphemeralAction::Create => write!(f, "Create"),
            EphemeralAction::Terminate => write!(f, "Terminate"),
            EphemeralAction::Accessed => write!(f, "Accessed"),
        }
    }
}

impl std::str::FromStr for EphemeralAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(EphemeralAction::Create),
            "terminate" => Ok(EphemeralAction::Terminate),
            "accessed" => Ok(EphemeralAction::Accessed),
            _ => Err(format!("unknown ephemeral container action: {}", s)),
        }
    }
}

impl TryFrom<String> for EphemeralAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Audit row of `ephemeral_container_actions`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EphemeralContainerRecord {
    pub id: i64,
    pub cluster_id: i64,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub target_container: String,
    pub image: String,
    /// Final container spec as submitted, JSON.
    pub manifest: Option<String>,
    #[sqlx(try_from = "String")]
    pub action: EphemeralAction,
    pub user_id: i64,
    pub created_at: String,
}

/// Values written by [`super::EphemeralContainerRepository::record`].
#[derive(Debug, Clone)]
pub struct NewEphemeralRecord {
    pub cluster_id: i64,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    pub target_container: String,
    pub image: String,
    pub manifest: Option<String>,
    pub action: EphemeralAction,
    pub user_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralContainerBasicData {
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub target_container_name: String,
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralContainerAdvancedData {
    /// Raw ephemeral container spec, JSON.
    pub manifest: String,
}

/// Body of the ephemeral container create and terminate endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralContainerRequest {
    pub cluster_id: i64,
    pub namespace: String,
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_data: Option<EphemeralContainerBasicData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_data: Option<EphemeralContainerAdvancedData>,
}

/// Container names of one pod. Only running ephemeral containers are listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodContainerList {
    pub containers: Vec<String>,
    pub init_containers: Vec<String>,
    pub ephemeral_containers: Vec<String>,
}
