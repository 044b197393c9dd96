//! Ephemeral debug containers injected into running pods.
//!
//! Kubernetes cannot remove an ephemeral container once added. Every container created here
//! runs a keep-alive script named after the container, and termination kills that script
//! from inside the container.

mod models;
mod repository;
mod service;

pub use models::{
    EphemeralAction, EphemeralContainerAdvancedData, EphemeralContainerBasicData,
    EphemeralContainerRecord, EphemeralContainerRequest, NewEphemeralRecord, PodContainerList,
};
pub use repository::EphemeralContainerRepository;
pub use service::{
    DEFAULT_SERVER_VERSION_REGEX, EphemeralContainerService, build_container, container_list,
    kill_command, script_name, start_command,
};
