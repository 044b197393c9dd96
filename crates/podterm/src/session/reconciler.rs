//! Periodic pod status reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::models::TerminalStatus;
use super::registry::LiveSession;
use super::service::{TerminalService, pod_end_reason};
use crate::cluster::{ClusterApi, ClusterError};
use crate::templates::POD_TEMPLATE;

/// Outcome of a single reconciler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    pub terminated: usize,
    /// Entries left alone because the cluster could not be asked.
    pub skipped: usize,
    /// Registry entries dropped at the end of the tick.
    pub evicted: usize,
}

enum Observation {
    Pod(Box<Pod>),
    Gone(String),
    Skip,
}

/// Refreshes stored status from the pods the registry points at.
pub struct StatusReconciler {
    service: Arc<TerminalService>,
    in_flight: Mutex<()>,
}

impl StatusReconciler {
    pub fn new(service: Arc<TerminalService>) -> Self {
        Self {
            service,
            in_flight: Mutex::new(()),
        }
    }

    /// Run one tick. Returns `None` when another tick is still running.
    pub async fn run_once(&self) -> Option<ReconcileReport> {
        let _guard = self.in_flight.try_lock().ok()?;
        let mut report = ReconcileReport::default();

        match self.service.templates.fetch_by_name(POD_TEMPLATE).await {
            Ok(Some(template)) => match template.kind_descriptor() {
                Ok(kind) if kind.kind == "Pod" => {}
                Ok(kind) => {
                    warn!("pod template declares kind {}, skipping reconcile", kind.kind);
                    return Some(report);
                }
                Err(e) => {
                    warn!("pod template is unusable, skipping reconcile: {:#}", e);
                    return Some(report);
                }
            },
            Ok(None) => {
                warn!("pod template {} is missing, skipping reconcile", POD_TEMPLATE);
                return Some(report);
            }
            Err(e) => {
                warn!("loading pod template failed: {:#}", e);
                return Some(report);
            }
        }

        let snapshot = self.service.registry.snapshot().await;
        let mut clusters: HashMap<i64, Option<Arc<dyn ClusterApi>>> = HashMap::new();
        let batch_size = self.service.settings.batch_size.max(1);

        for batch in snapshot.chunks(batch_size) {
            for session in batch {
                if let std::collections::hash_map::Entry::Vacant(slot) =
                    clusters.entry(session.data.cluster_id)
                {
                    let connected = match self.service.connector.connect(session.data.cluster_id).await {
                        Ok(cluster) => Some(cluster),
                        Err(e) => {
                            warn!("reconcile: cluster {} unavailable: {}", session.data.cluster_id, e);
                            None
                        }
                    };
                    slot.insert(connected);
                }
            }

            // Each lookup ends at its own timeout or the batch deadline, whichever comes first.
            let batch_deadline = Instant::now() + self.service.settings.batch_timeout;
            let lookups = batch.iter().map(|session| {
                let cluster = clusters.get(&session.data.cluster_id).cloned().flatten();
                self.observe(session, cluster, batch_deadline)
            });
            let observations = join_all(lookups).await;

            for (session, observation) in batch.iter().zip(observations) {
                report.checked += 1;
                self.apply(session, observation, &mut report).await;
            }
        }

        report.evicted = self.service.registry.remove_terminal().await.len();
        if report.updated > 0 || report.evicted > 0 {
            info!(
                "reconciled {} session(s): {} updated, {} terminated, {} evicted",
                report.checked, report.updated, report.terminated, report.evicted
            );
        }
        Some(report)
    }

    async fn observe(
        &self,
        session: &LiveSession,
        cluster: Option<Arc<dyn ClusterApi>>,
        batch_deadline: Instant,
    ) -> Observation {
        let Some(cluster) = cluster else {
            return Observation::Skip;
        };
        let namespace = session
            .data
            .namespace_or(&self.service.settings.default_namespace);
        let lookup = cluster.get_pod(&namespace, &session.data.pod_name);
        let deadline = batch_deadline.min(Instant::now() + self.service.settings.cluster_timeout);
        match tokio::time::timeout_at(deadline, lookup).await {
            Ok(Ok(pod)) => Observation::Pod(Box::new(pod)),
            Ok(Err(e)) if e.is_not_found() => Observation::Gone(e.to_string()),
            Ok(Err(e)) => {
                log_skip(session.data.id, &e);
                Observation::Skip
            }
            Err(_) => {
                debug!("reconcile: pod of session {} timed out", session.data.id);
                Observation::Skip
            }
        }
    }

    async fn apply(&self, session: &LiveSession, observation: Observation, report: &mut ReconcileReport) {
        let id = session.data.id;
        let (next, reason, node) = match observation {
            Observation::Skip => {
                report.skipped += 1;
                return;
            }
            Observation::Gone(reason) => (TerminalStatus::Terminated, Some(reason), None),
            Observation::Pod(pod) => {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
                match TerminalStatus::from_pod_phase(&phase) {
                    Some(TerminalStatus::Terminated) => (
                        TerminalStatus::Terminated,
                        Some(pod_end_reason(&pod, &phase)),
                        node,
                    ),
                    Some(status) => (status, None, node),
                    None => (session.status(), None, node),
                }
            }
        };

        if let Some(node) = node.filter(|n| *n != session.data.node_name) {
            match self.service.repo.update_node_name(id, &node).await {
                Ok(()) => {
                    self.service
                        .registry
                        .update(id, |s| s.data.node_name = node)
                        .await;
                }
                Err(e) => warn!("reconcile: storing node of session {} failed: {:#}", id, e),
            }
        }

        if next == session.status() {
            return;
        }

        let stored = match self
            .service
            .repo
            .update_status(id, next, reason.as_deref())
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                warn!("reconcile: storing status of session {} failed: {:#}", id, e);
                return;
            }
        };

        // A refused write means the row moved on without us; adopt what is stored.
        let current = if stored {
            Some((next, reason))
        } else {
            match self.service.repo.get(id).await {
                Ok(row) => row.map(|r| (r.status, r.status_reason)),
                Err(e) => {
                    warn!("reconcile: reloading session {} failed: {:#}", id, e);
                    None
                }
            }
        };
        let Some((current, reason)) = current else {
            return;
        };

        if current.is_terminal() {
            self.service.close_exec(id).await;
            report.terminated += 1;
            info!(
                "session {} ({}) is {}: {}",
                id,
                session.data.pod_name,
                current,
                reason.as_deref().unwrap_or("")
            );
        }
        self.service
            .registry
            .update(id, |s| {
                s.data.status = current;
                s.data.status_reason = reason;
            })
            .await;
        report.updated += 1;
    }

    /// Tick every `status_sync_interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.service.settings.status_sync_interval;
        info!("starting status reconciler (every {:?})", period);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }
            info!("status reconciler stopped");
        })
    }
}

fn log_skip(id: i64, error: &ClusterError) {
    if error.is_transient() {
        debug!("reconcile: skipping session {}: {}", id, error);
    } else {
        warn!("reconcile: skipping session {}: {}", id, error);
    }
}
