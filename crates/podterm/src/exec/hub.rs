//! Pending bindings and bound sessions.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::ActivityClock;
use super::channel::TerminalChannel;
use super::message::Op;
use super::pump::{self, CLOSE_BAD_BIND, CLOSE_UNKNOWN_SESSION};
use crate::cluster::ClusterApi;

/// What to run once a browser binds.
#[derive(Clone)]
pub struct ExecTarget {
    pub cluster: Arc<dyn ClusterApi>,
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub shell: String,
    /// Touched whenever bytes flow, if the session is watched for idleness.
    pub activity: Option<Arc<ActivityClock>>,
}

struct Pending {
    ready: oneshot::Sender<TerminalChannel>,
    cancel: CancellationToken,
}

/// Process-wide map of exec sessions waiting for, or attached to, a browser channel.
pub struct TerminalHub {
    pending: DashMap<String, Pending>,
    bound: DashMap<String, CancellationToken>,
    bind_timeout: Duration,
}

fn new_session_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

impl TerminalHub {
    pub fn new(bind_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            bound: DashMap::new(),
            bind_timeout,
        }
    }

    /// Register a session and spawn the task that waits for its browser channel.
    pub fn open(self: &Arc<Self>, target: ExecTarget) -> String {
        let session_id = new_session_id();
        let (ready, attached) = oneshot::channel();
        let cancel = CancellationToken::new();
        self.pending.insert(
            session_id.clone(),
            Pending {
                ready,
                cancel: cancel.clone(),
            },
        );

        let hub = Arc::clone(self);
        let id = session_id.clone();
        tokio::spawn(async move {
            let channel = tokio::select! {
                channel = attached => channel.ok(),
                _ = tokio::time::sleep(hub.bind_timeout) => None,
                _ = cancel.cancelled() => None,
            };
            let Some(channel) = channel else {
                hub.forget_pending(&id);
                debug!("exec session {} expired before bind", id);
                return;
            };

            info!("exec session {} bound to {}/{}", id, target.namespace, target.pod);
            pump::run(target, channel, cancel).await;
            hub.bound.remove(&id);
            debug!("exec session {} finished", id);
        });

        session_id
    }

    /// Attach a channel to a pending session. The channel is handed back if the id is
    /// unknown, already bound or expired.
    pub fn bind(&self, session_id: &str, channel: TerminalChannel) -> Result<(), TerminalChannel> {
        let Some((_, pending)) = self.pending.remove(session_id) else {
            return Err(channel);
        };
        self.bound.insert(session_id.to_string(), pending.cancel.clone());
        pending.ready.send(channel).inspect_err(|_| {
            self.bound.remove(session_id);
        })
    }

    /// Read the bind frame from a freshly opened channel and attach it, closing the channel
    /// with a distinguished code when the frame is wrong or the session unknown.
    pub async fn accept(&self, mut channel: TerminalChannel) {
        let first = channel.source.recv().await;
        let session_id = match first {
            Some(Ok(msg)) if msg.op == Op::Bind && !msg.session_id.is_empty() => msg.session_id,
            Some(Ok(_)) | Some(Err(_)) => {
                let _ = channel.sink.close(CLOSE_BAD_BIND, "first frame must bind a session").await;
                return;
            }
            None => return,
        };

        if let Err(mut channel) = self.bind(&session_id, channel) {
            debug!("bind to unknown exec session {}", session_id);
            let _ = channel.sink.close(CLOSE_UNKNOWN_SESSION, "session not found").await;
        }
    }

    /// Cancel a pending or bound session. Returns false if the id is unknown.
    pub fn close(&self, session_id: &str) -> bool {
        if let Some((_, pending)) = self.pending.remove(session_id) {
            pending.cancel.cancel();
            return true;
        }
        match self.bound.remove(session_id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the id is waiting for a bind or attached to a channel.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.pending.contains_key(session_id) || self.bound.contains_key(session_id)
    }

    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        let pending: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in pending {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.cancel.cancel();
                closed += 1;
            }
        }
        let bound: Vec<String> = self.bound.iter().map(|e| e.key().clone()).collect();
        for id in bound {
            if let Some((_, cancel)) = self.bound.remove(&id) {
                cancel.cancel();
                closed += 1;
            }
        }
        closed
    }

    fn forget_pending(&self, session_id: &str) {
        self.pending.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::FakeCluster;
    use crate::exec::channel::{Outbound, memory_channel};
    use crate::exec::message::TerminalMessage;
    use crate::exec::pump::CLOSE_PROCESS_EXITED;

    fn hub(timeout: Duration) -> Arc<TerminalHub> {
        Arc::new(TerminalHub::new(timeout))
    }

    fn target() -> ExecTarget {
        let cluster = FakeCluster::new();
        cluster.insert_pod("default", "dbg", "Running");
        ExecTarget {
            cluster,
            namespace: "default".to_string(),
            pod: "dbg".to_string(),
            container: None,
            shell: "sh".to_string(),
            activity: None,
        }
    }

    #[test]
    fn session_ids_are_32_hex_chars() {
        let id = new_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_session_id());
    }

    #[tokio::test]
    async fn bind_starts_the_shell() {
        let hub = hub(Duration::from_secs(60));
        let id = hub.open(target());
        assert!(hub.is_active(&id));

        let (channel, mut peer) = memory_channel();
        peer.send(TerminalMessage::bind(id.clone()));
        hub.accept(channel).await;

        peer.send(TerminalMessage::stdin("echo ok\n"));
        loop {
            if let Some(Outbound::Frame(msg)) = peer.recv().await {
                if msg.op == Op::Stdout {
                    assert_eq!(msg.data, "ok\n");
                    break;
                }
            }
        }
        assert!(hub.is_active(&id));

        assert!(hub.close(&id));
        assert_eq!(peer.recv_close().await.map(|(c, _)| c), Some(CLOSE_PROCESS_EXITED));
    }

    #[tokio::test]
    async fn unknown_session_is_closed_with_410() {
        let hub = hub(Duration::from_secs(60));
        let (channel, mut peer) = memory_channel();
        peer.send(TerminalMessage::bind("deadbeef"));
        hub.accept(channel).await;
        assert_eq!(peer.recv_close().await.map(|(c, _)| c), Some(CLOSE_UNKNOWN_SESSION));
    }

    #[tokio::test]
    async fn non_bind_first_frame_is_closed_with_400() {
        let hub = hub(Duration::from_secs(60));
        let id = hub.open(target());
        let (channel, mut peer) = memory_channel();
        peer.send(TerminalMessage::stdin("ls\n"));
        hub.accept(channel).await;

        assert_eq!(peer.recv_close().await.map(|(c, _)| c), Some(CLOSE_BAD_BIND));
        assert!(hub.is_active(&id));
    }

    #[tokio::test]
    async fn unbound_sessions_expire() {
        let hub = hub(Duration::from_millis(50));
        let id = hub.open(target());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!hub.is_active(&id));

        let (channel, _peer) = memory_channel();
        assert!(hub.bind(&id, channel).is_err());
    }

    #[tokio::test]
    async fn concurrent_opens_are_all_registered() {
        let hub = hub(Duration::from_secs(60));
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move { hub.open(target()) })
            })
            .collect();
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        assert!(ids.iter().all(|id| hub.is_active(id)));

        let (channel, _peer) = memory_channel();
        assert!(hub.bind(&ids[0], channel).is_ok());
        let (channel, _peer) = memory_channel();
        assert!(hub.bind(&ids[0], channel).is_err());
        assert_eq!(hub.close_all(), 32);
    }

    #[tokio::test]
    async fn close_all_cancels_everything() {
        let hub = hub(Duration::from_secs(60));
        let a = hub.open(target());
        let b = hub.open(target());
        assert_eq!(hub.close_all(), 2);
        assert!(!hub.is_active(&a));
        assert!(!hub.is_active(&b));
    }
}
