//! Exec-stream multiplexer.
//!
//! A session id is handed out before any browser connects. The browser then opens a
//! websocket, sends a `bind` frame carrying that id, and the hub starts the remote shell and
//! pumps frames both ways until either side closes.

mod channel;
mod hub;
mod message;
mod pump;
mod shell;

pub use channel::{
    ChannelError, FrameSink, FrameSource, MemoryPeer, Outbound, TerminalChannel, memory_channel,
};
pub use hub::{ExecTarget, TerminalHub};
pub use message::{Op, TerminalMessage};
pub use pump::{
    CLOSE_BAD_BIND, CLOSE_PROCESS_EXITED, CLOSE_START_FAILED, CLOSE_UNKNOWN_SESSION, open_exec,
};
pub use shell::{
    COMMAND_EXECUTION_FAILED, NO_SHELL_SUPPORTED, POD_NOT_FOUND, SUPPORTED_SHELLS,
    auto_select_shell, is_supported_shell, check_shell,
};

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

/// Last time bytes moved through a session, shared between the pump and the watchdog.
#[derive(Debug)]
pub struct ActivityClock {
    last_millis: AtomicI64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last_millis: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn touch(&self) {
        self.last_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Set the clock to an explicit instant.
    pub fn set(&self, at: DateTime<Utc>) {
        self.last_millis
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_millis.load(Ordering::Relaxed))
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}
