//! Podterm library
//!
//! Per-user debug pods, ephemeral debug containers, exec terminals and log streaming
//! against many Kubernetes clusters.

pub mod api;
pub mod cluster;
pub mod db;
pub mod ephemeral;
pub mod exec;
pub mod logs;
pub mod session;
pub mod templates;
