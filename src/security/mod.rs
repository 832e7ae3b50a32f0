//! Security pipeline: per-job contexts and their subsystems.

pub mod monitor;
pub mod network;
pub mod orchestrator;
pub mod quotas;
pub mod rbac;
pub mod scanner;
pub mod secrets;

pub use monitor::{MonitorRules, RuntimeMonitor};
pub use network::NetworkIsolation;
pub use orchestrator::{OpenOutcome, SecurityEvent, SecurityOrchestrator};
pub use quotas::{QuotaLimits, ResourceQuotas, ScopeUsage};
pub use rbac::{AccessContext, AssignmentScope, Permission, Rbac, Role, RoleAssignment};
pub use scanner::{ScanOutcome, ScanPolicy, ScanVerdict};
pub use secrets::SecretManager;
