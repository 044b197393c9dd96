//! Ordered, idempotent application of rendered templates.

use anyhow::Result;
use log::{debug, info};

use super::models::TerminalTemplate;
use super::render::{RenderedResource, TemplateVars, render, render_value};
use crate::cluster::{ClusterApi, ClusterResult, KindDescriptor};

/// Resources to create, in order. Deletion walks the same list backwards.
#[derive(Debug, Clone, Default)]
pub struct ApplyPlan {
    steps: Vec<RenderedResource>,
}

impl ApplyPlan {
    /// Render `templates` (already in apply order). When two templates declare the same kind,
    /// the later one wins and takes the earlier one's place in the order.
    pub fn build(templates: &[TerminalTemplate], vars: &TemplateVars) -> Result<Self> {
        let mut steps: Vec<RenderedResource> = Vec::with_capacity(templates.len());
        for template in templates {
            let rendered = render(template, vars)?;
            match steps.iter_mut().find(|s| s.kind == rendered.kind) {
                Some(existing) => *existing = rendered,
                None => steps.push(rendered),
            }
        }
        Ok(Self { steps })
    }

    /// A plan holding only the pod built from a caller-supplied manifest.
    pub fn from_pod_manifest(manifest: serde_json::Value, vars: &TemplateVars) -> Result<Self> {
        let kind = KindDescriptor::new("", "v1", "Pod");
        let rendered = render_value("edited-pod-manifest", kind, manifest, vars)?;
        Ok(Self {
            steps: vec![rendered],
        })
    }

    /// Keep only the pod step.
    pub fn pod_only(mut self) -> Self {
        self.steps.retain(|s| s.kind.kind == "Pod");
        self
    }

    /// Replace the pod step's manifest, keeping every other step.
    pub fn with_pod(mut self, pod: RenderedResource) -> Self {
        match self.steps.iter_mut().find(|s| s.kind.kind == "Pod") {
            Some(existing) => *existing = pod,
            None => self.steps.push(pod),
        }
        self
    }

    pub fn steps(&self) -> &[RenderedResource] {
        &self.steps
    }

    pub fn pod(&self) -> Option<&RenderedResource> {
        self.steps.iter().find(|s| s.kind.kind == "Pod")
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Create every resource in order. `AlreadyExists` counts as success; the first other
    /// failure stops the plan and leaves the applied prefix in place.
    pub async fn apply(&self, cluster: &dyn ClusterApi, namespace: &str) -> ClusterResult<()> {
        for step in &self.steps {
            match cluster
                .create_resource(&step.kind, namespace, &step.manifest)
                .await
            {
                Ok(()) => debug!("created {} {}", step.kind.kind, step.name),
                Err(e) if e.is_already_exists() => {
                    debug!("{} {} already exists", step.kind.kind, step.name)
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "applied {} resources in namespace {}",
            self.steps.len(),
            namespace
        );
        Ok(())
    }

    /// Delete every resource in reverse order. `NotFound` counts as success.
    pub async fn delete(&self, cluster: &dyn ClusterApi, namespace: &str) -> ClusterResult<()> {
        for step in self.steps.iter().rev() {
            match cluster
                .delete_resource(&step.kind, namespace, &step.name)
                .await
            {
                Ok(()) => debug!("deleted {} {}", step.kind.kind, step.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
