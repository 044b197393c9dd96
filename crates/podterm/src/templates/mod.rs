//! Debug pod templates.
//!
//! Templates are YAML blobs stored in the database together with the kind they create. They are
//! read on every operation so operators can edit them while the server runs.

mod models;
mod plan;
mod render;
mod repository;

pub use models::{
    POD_TEMPLATE, ROLE_BINDING_TEMPLATE, SERVICE_ACCOUNT_TEMPLATE, TerminalTemplate,
};
pub use plan::ApplyPlan;
pub use render::{AUTO_SELECT, NodeTaint, RenderedResource, TemplateVars, render, substitute};
pub use repository::TemplateRepository;
