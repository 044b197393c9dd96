//! HTTP API module.
//!
//! Terminal session endpoints under `/user/terminal`, pod-level endpoints under `/k8s`.

mod error;
mod extract;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResponse, ApiResult, ErrorDetail};
pub use extract::{ApiJson, ApiPath, ApiQuery, USER_ID_HEADER, UserId};
pub use routes::create_router;
pub use state::AppState;
