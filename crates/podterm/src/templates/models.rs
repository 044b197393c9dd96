//! Template models.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::cluster::KindDescriptor;

pub const SERVICE_ACCOUNT_TEMPLATE: &str = "terminal-access-service-account";
pub const ROLE_BINDING_TEMPLATE: &str = "terminal-access-role-binding";
pub const POD_TEMPLATE: &str = "terminal-access-pod";

/// A stored template.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TerminalTemplate {
    pub id: i64,
    /// Unique template name.
    pub template_name: String,
    /// YAML (or JSON) manifest with `${var}` placeholders.
    pub template_data: String,
    /// JSON-encoded `{group, version, kind}`.
    pub gvk: String,
    /// Position in the apply plan.
    pub apply_order: i64,
    pub updated_at: String,
}

impl TerminalTemplate {
    pub fn kind_descriptor(&self) -> Result<KindDescriptor> {
        serde_json::from_str(&self.gvk)
            .with_context(|| format!("decoding kind of template {}", self.template_name))
    }
}
