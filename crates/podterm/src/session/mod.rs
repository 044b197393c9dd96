//! Terminal sessions: debug pods owned by a user.
//!
//! A session row is written in `Starting` once its templates are applied. The reconciler
//! follows the pod phase from there, the watchdog reclaims sessions nobody types into, and
//! the service handles every request-driven transition.

mod error;
mod models;
mod reconciler;
mod registry;
mod repository;
mod service;
mod watchdog;

pub use error::{TerminalError, TerminalResult};
pub use models::{
    ManifestEditRequest, ManifestEditResponse, NewTerminalAccess, TerminalAccessData,
    TerminalMetadata, TerminalStatus, UserTerminalSessionRequest, UserTerminalSessionResponse,
    UserTerminalShellSessionRequest, ValidShellResponse, ValidateShellQuery,
};
pub use reconciler::{ReconcileReport, StatusReconciler};
pub use registry::{LiveSession, SessionRegistry};
pub use repository::TerminalAccessRepository;
pub use service::{
    TerminalService, TerminalSettings, TerminalStatusQuery, pod_name, validate_shell_in,
};
pub use watchdog::{IDLE_TIMEOUT_REASON, IdleWatchdog, select_idle};
