//! Variable substitution and per-kind manifest edits.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::models::TerminalTemplate;
use crate::cluster::KindDescriptor;

/// Node or shell value that lets the system choose.
pub const AUTO_SELECT: &str = "autoSelect";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid placeholder pattern")
});

/// A taint on the target node. The debug pod tolerates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTaint {
    pub key: String,
    #[serde(default)]
    pub effect: String,
}

/// Values substituted into templates.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub pod_name: String,
    pub cluster_id: i64,
    pub user_id: i64,
    pub base_image: String,
    pub default_namespace: String,
    pub node_name: String,
    pub node_taints: Vec<NodeTaint>,
    /// Replace every container image with `base_image`.
    pub rewrite_images: bool,
}

impl TemplateVars {
    pub fn auto_select_node(&self) -> bool {
        self.node_name == AUTO_SELECT || self.node_name.is_empty()
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "pod_name" => Some(self.pod_name.clone()),
            "cluster_id" => Some(self.cluster_id.to_string()),
            "user_id" => Some(self.user_id.to_string()),
            "base_image" => Some(self.base_image.clone()),
            "default_namespace" => Some(self.default_namespace.clone()),
            "node_name" => Some(self.node_name.clone()),
            _ => None,
        }
    }

    pub fn service_account_name(&self) -> String {
        format!("{}-sa", self.pod_name)
    }

    pub fn role_binding_name(&self) -> String {
        format!("{}-crb", self.pod_name)
    }
}

/// One manifest ready to submit.
#[derive(Debug, Clone)]
pub struct RenderedResource {
    pub template_name: String,
    pub kind: KindDescriptor,
    pub name: String,
    pub manifest: Value,
}

/// Replace `${var}` placeholders. Unknown placeholders are left as they are.
pub fn substitute(text: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            vars.lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Substitute, parse and apply the structural edits for the template's kind.
pub fn render(template: &TerminalTemplate, vars: &TemplateVars) -> Result<RenderedResource> {
    let kind = template.kind_descriptor()?;
    let text = substitute(&template.template_data, vars);
    let manifest: Value = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing template {}", template.template_name))?;
    render_value(&template.template_name, kind, manifest, vars)
}

pub(super) fn render_value(
    template_name: &str,
    kind: KindDescriptor,
    mut manifest: Value,
    vars: &TemplateVars,
) -> Result<RenderedResource> {
    if !manifest.is_object() {
        bail!("template {template_name} is not a mapping");
    }
    manifest["apiVersion"] = json!(kind.api_version());
    manifest["kind"] = json!(kind.kind);

    let name = match kind.kind.as_str() {
        "ServiceAccount" => {
            let name = vars.service_account_name();
            set_metadata(&mut manifest, &name, Some(&vars.default_namespace));
            name
        }
        "ClusterRoleBinding" | "RoleBinding" => {
            let name = vars.role_binding_name();
            let namespace = (kind.kind == "RoleBinding").then_some(vars.default_namespace.as_str());
            set_metadata(&mut manifest, &name, namespace);
            manifest["subjects"] = json!([{
                "kind": "ServiceAccount",
                "name": vars.service_account_name(),
                "namespace": vars.default_namespace,
            }]);
            name
        }
        "Pod" => {
            let name = vars.pod_name.clone();
            set_metadata(&mut manifest, &name, Some(&vars.default_namespace));
            edit_pod_spec(&mut manifest, vars);
            name
        }
        _ => manifest["metadata"]["name"]
            .as_str()
            .map(str::to_string)
            .with_context(|| format!("template {template_name} has no metadata.name"))?,
    };

    Ok(RenderedResource {
        template_name: template_name.to_string(),
        kind,
        name,
        manifest,
    })
}

fn set_metadata(manifest: &mut Value, name: &str, namespace: Option<&str>) {
    if !manifest["metadata"].is_object() {
        manifest["metadata"] = json!({});
    }
    let metadata = &mut manifest["metadata"];
    metadata["name"] = json!(name);
    match namespace {
        Some(namespace) => metadata["namespace"] = json!(namespace),
        None => {
            if let Some(map) = metadata.as_object_mut() {
                map.remove("namespace");
            }
        }
    }
}

fn edit_pod_spec(manifest: &mut Value, vars: &TemplateVars) {
    if !manifest["spec"].is_object() {
        manifest["spec"] = json!({});
    }
    let spec = &mut manifest["spec"];
    spec["serviceAccountName"] = json!(vars.service_account_name());

    if vars.auto_select_node() {
        if let Some(map) = spec.as_object_mut() {
            map.remove("nodeName");
        }
    } else {
        spec["nodeName"] = json!(vars.node_name);
        if !vars.node_taints.is_empty() {
            let tolerations: Vec<Value> = vars
                .node_taints
                .iter()
                .map(|taint| {
                    json!({
                        "key": taint.key,
                        "operator": "Exists",
                        "effect": taint.effect,
                    })
                })
                .collect();
            spec["tolerations"] = Value::Array(tolerations);
        }
    }

    if vars.rewrite_images && !vars.base_image.is_empty() {
        if let Some(containers) = spec["containers"].as_array_mut() {
            for container in containers {
                container["image"] = json!(vars.base_image);
            }
        }
    }
}
