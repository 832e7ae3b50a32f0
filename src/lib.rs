//! RunnerHub - Self-hosted GitHub Actions runner orchestrator
//!
//! Receives workflow-job webhooks, places each job on an ephemeral
//! isolated container runner, and manages the full container lifecycle:
//! - Job router, load balancer, resource scheduler, dependency manager,
//!   and parallel executor (the distribution core)
//! - Security orchestrator: RBAC, image scanning, resource quotas,
//!   network isolation, secret injection, and runtime monitoring
//! - Tamper-evident hash-chained audit log with rotation and retention

pub mod adapters;
pub mod application;
pub mod audit;
pub mod domain;
pub mod infrastructure;
pub mod security;
pub mod services;

// Re-export key types for convenience
pub use application::ParallelExecutor;
pub use audit::AuditLog;
pub use domain::models::Config;
pub use security::SecurityOrchestrator;
