//! Ports to external collaborators, per hexagonal architecture.

pub mod container_engine;
pub mod image_scanner;
pub mod job_queue;
pub mod secret_vault;

pub use container_engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerStats, EndpointSpec, ExecOutput,
    NetworkSpec, UpdateLimits,
};
pub use image_scanner::{ImageScanner, ScanFinding, ScanReport, SeverityCounts};
pub use job_queue::{JobQueue, QueueMessage, QueueName};
pub use secret_vault::{SecretMaterial, SecretVault};
