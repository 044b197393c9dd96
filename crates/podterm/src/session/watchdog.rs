//! Idle session reclamation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::models::TerminalStatus;
use super::registry::LiveSession;
use super::service::TerminalService;

pub const IDLE_TIMEOUT_REASON: &str = "idle timeout";

/// Sessions idle for longer than `budget` at `now`. Starting sessions registered less than
/// `grace` ago are left out.
pub fn select_idle(
    sessions: &[LiveSession],
    now: DateTime<Utc>,
    budget: Duration,
    grace: Duration,
) -> Vec<LiveSession> {
    let budget = chrono::Duration::from_std(budget).unwrap_or(chrono::Duration::MAX);
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);

    sessions
        .iter()
        .filter(|s| s.status().is_live())
        .filter(|s| s.status() != TerminalStatus::Starting || now - s.registered_at >= grace)
        .filter(|s| s.activity.idle_for(now) > budget)
        .cloned()
        .collect()
}

/// Periodically disconnects sessions that stopped moving bytes.
pub struct IdleWatchdog {
    service: Arc<TerminalService>,
}

impl IdleWatchdog {
    pub fn new(service: Arc<TerminalService>) -> Self {
        Self { service }
    }

    /// Disconnect every idle session. Returns how many were stopped.
    pub async fn sweep(&self) -> usize {
        let settings = self.service.settings();
        let snapshot = self.service.registry().snapshot().await;
        let idle = select_idle(
            &snapshot,
            Utc::now(),
            settings.idle_budget,
            settings.status_sync_interval,
        );

        let mut stopped = 0;
        for session in idle {
            info!(
                "Stopping idle terminal session {} ({}, last activity: {})",
                session.data.id,
                session.data.pod_name,
                session.activity.last().to_rfc3339()
            );
            if let Err(e) = self.service.terminate(&session.data, IDLE_TIMEOUT_REASON).await {
                warn!("Failed to stop idle session {}: {}", session.data.id, e);
            } else {
                stopped += 1;
            }
        }

        if stopped > 0 {
            info!("Stopped {} idle terminal session(s)", stopped);
        }
        stopped
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(
            "Starting idle terminal watchdog (check every {}s, budget {}min)",
            interval.as_secs(),
            self.service.settings().idle_budget.as_secs() / 60
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            info!("idle terminal watchdog stopped");
        })
    }
}
