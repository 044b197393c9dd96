//! Application state shared across handlers.

use std::sync::Arc;

use crate::cluster::{ClusterConnector, PortForwardRegistry};
use crate::ephemeral::EphemeralContainerService;
use crate::exec::TerminalHub;
use crate::logs::LogStreamer;
use crate::session::TerminalService;

#[derive(Clone)]
pub struct AppState {
    pub terminal: Arc<TerminalService>,
    pub ephemeral: Arc<EphemeralContainerService>,
    pub logs: Arc<LogStreamer>,
    pub connector: Arc<dyn ClusterConnector>,
    /// Local listeners forwarding into pods, keyed by local port.
    pub port_forwards: PortForwardRegistry,
}

impl AppState {
    pub fn new(
        terminal: Arc<TerminalService>,
        ephemeral: Arc<EphemeralContainerService>,
        connector: Arc<dyn ClusterConnector>,
        port_forwards: PortForwardRegistry,
    ) -> Self {
        Self {
            terminal,
            ephemeral,
            logs: Arc::new(LogStreamer::new(Arc::clone(&connector))),
            connector,
            port_forwards,
        }
    }

    pub fn hub(&self) -> &Arc<TerminalHub> {
        self.terminal.hub()
    }
}
