//! Local port forwarders and the stop-channel map that shuts them down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{ClusterApi, ClusterError, ClusterResult};

/// Local port → cancellation handle of the task serving it.
#[derive(Debug, Default)]
pub struct StopChannelMap {
    inner: Mutex<HashMap<u16, CancellationToken>>,
}

impl StopChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<u16, CancellationToken>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, port: u16, token: CancellationToken) {
        if let Some(previous) = self.map().insert(port, token) {
            previous.cancel();
        }
    }

    /// Cancel and forget the handle for `port`. Returns false if none was registered.
    pub fn stop(&self, port: u16) -> bool {
        match self.map().remove(&port) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) -> usize {
        let mut map = self.map();
        let count = map.len();
        for (_, token) in map.drain() {
            token.cancel();
        }
        count
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.map().keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

/// Starts forwarders that accept local TCP connections and pipe each one into a pod port.
#[derive(Debug, Clone)]
pub struct PortForwardRegistry {
    stops: Arc<StopChannelMap>,
    bind_host: String,
}

impl PortForwardRegistry {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            stops: Arc::new(StopChannelMap::new()),
            bind_host: bind_host.into(),
        }
    }

    pub fn stops(&self) -> &StopChannelMap {
        &self.stops
    }

    /// Bind an ephemeral local port and forward it to `pod:port`. Returns the local port.
    pub async fn start(
        &self,
        cluster: Arc<dyn ClusterApi>,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> ClusterResult<u16> {
        let listener = TcpListener::bind((self.bind_host.as_str(), 0)).await?;
        let local_port = listener.local_addr()?.port();
        if local_port == 0 {
            return Err(ClusterError::Unreachable("no local port allocated".to_string()));
        }

        let token = CancellationToken::new();
        self.stops.insert(local_port, token.clone());
        info!(
            "forwarding local port {} to {}/{}:{}",
            local_port, namespace, pod, port
        );

        let namespace = namespace.to_string();
        let pod = pod.to_string();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (mut inbound, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("port-forward {} accept failed: {}", local_port, e);
                        continue;
                    }
                };

                let cluster = Arc::clone(&cluster);
                let token = token.child_token();
                let (namespace, pod) = (namespace.clone(), pod.clone());
                tokio::spawn(async move {
                    let mut upstream = match cluster.port_forward(&namespace, &pod, port).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("port-forward to {}/{}:{} failed: {}", namespace, pod, port, e);
                            return;
                        }
                    };
                    tokio::select! {
                        _ = token.cancelled() => {}
                        result = tokio::io::copy_bidirectional(&mut inbound, &mut upstream) => {
                            if let Err(e) = result {
                                debug!("port-forward connection from {} ended: {}", peer, e);
                            }
                        }
                    }
                });
            }
            debug!("port-forward on {} stopped", local_port);
        });

        Ok(local_port)
    }

    pub fn stop(&self, local_port: u16) -> bool {
        self.stops.stop(local_port)
    }

    pub fn stop_all(&self) -> usize {
        self.stops.stop_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::FakeCluster;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn stop_cancels_and_removes_the_entry() {
        let map = StopChannelMap::new();
        let token = CancellationToken::new();
        map.insert(4000, token.clone());
        assert_eq!(map.ports(), vec![4000]);

        assert!(map.stop(4000));
        assert!(token.is_cancelled());
        assert!(map.ports().is_empty());
        assert!(!map.stop(4000));
    }

    #[test]
    fn replacing_a_port_cancels_the_old_handle() {
        let map = StopChannelMap::new();
        let first = CancellationToken::new();
        map.insert(4001, first.clone());
        map.insert(4001, CancellationToken::new());
        assert!(first.is_cancelled());
        assert_eq!(map.stop_all(), 1);
    }

    #[test]
    fn keeps_working_after_a_panicking_holder() {
        let map = Arc::new(StopChannelMap::new());
        let holder = Arc::clone(&map);
        let _ = std::thread::spawn(move || {
            let _guard = holder.inner.lock().unwrap();
            panic!("holder died");
        })
        .join();
        assert!(map.inner.is_poisoned());

        let token = CancellationToken::new();
        map.insert(4002, token.clone());
        assert_eq!(map.ports(), vec![4002]);
        assert!(map.stop(4002));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn forwards_bytes_until_stopped() {
        let cluster = FakeCluster::new();
        let registry = PortForwardRegistry::new("127.0.0.1");
        let port = registry
            .start(cluster, "default", "web-0", 8080)
            .await
            .unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(registry.stop(port));
        assert!(registry.stops().ports().is_empty());
    }
}
