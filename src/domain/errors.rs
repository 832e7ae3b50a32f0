//! Domain errors for the RunnerHub orchestrator.

use thiserror::Error;
use uuid::Uuid;

/// Orchestration errors surfaced across the job distribution pipeline.
///
/// Input errors are returned to the caller immediately; resource errors are
/// retried by the executor with exponential backoff; security errors either
/// block or alert; system errors are bug indicators and are never retried
/// silently.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    // Input errors
    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Webhook signature invalid")]
    SignatureInvalid,

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Throttled: rate limit exceeded for {0}")]
    Throttled(String),

    #[error("Circuit open for runner {0}")]
    CircuitOpen(String),

    #[error("Permission denied: {actor} lacks {permission}")]
    PermissionDenied { actor: String, permission: String },

    #[error("Dependency cycle detected involving job {0}")]
    CyclicDependency(Uuid),

    // Resource errors
    #[error("No candidate runners supplied")]
    NoCandidates,

    #[error("No eligible runner for job {0}")]
    NoEligibleRunner(Uuid),

    #[error("No eligible pool for job {0}")]
    NoEligiblePool(Uuid),

    #[error("Allocation refused by pool {pool}: {reason}")]
    AllocationRefused { pool: String, reason: String },

    #[error("Preemption failed in pool {0}")]
    PreemptionFailed(String),

    #[error("Quota violation for {scope}: {reason}")]
    QuotaViolation { scope: String, reason: String },

    // Security errors
    #[error("Image scan failed for {image}: {reason}")]
    ScanFailed { image: String, reason: String },

    #[error("Security policy violation: {0}")]
    PolicyViolation(String),

    #[error("Audit integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Secret unavailable: {0}")]
    SecretUnavailable(String),

    // Runtime errors
    #[error("Timed out: {0}")]
    TimeoutError(String),

    #[error("Container engine error: {0}")]
    ContainerEngineError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Dependency timed out: edge {source_id} -> {target}")]
    DependencyTimeout { source_id: Uuid, target: Uuid },

    // System errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Whether the executor may retry the failed operation.
    ///
    /// Input and security errors are final; resource and runtime errors are
    /// transient. Messages mentioning validation, authentication, or
    /// authorization are never retried regardless of kind.
    pub fn is_retryable(&self) -> bool {
        let non_retryable_marker = {
            let msg = self.to_string().to_lowercase();
            msg.contains("validation")
                || msg.contains("authentication")
                || msg.contains("authorization")
        };
        if non_retryable_marker {
            return false;
        }

        matches!(
            self,
            Self::NoEligibleRunner(_)
                | Self::NoEligiblePool(_)
                | Self::AllocationRefused { .. }
                | Self::PreemptionFailed(_)
                | Self::Throttled(_)
                | Self::CircuitOpen(_)
                | Self::TimeoutError(_)
                | Self::ContainerEngineError(_)
                | Self::NetworkError(_)
        )
    }

    /// Coarse classification used by the executor's attempt ledger.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::NoCandidates | Self::NoEligibleRunner(_) => ErrorClass::Routing,
            Self::NoEligiblePool(_) | Self::PreemptionFailed(_) => ErrorClass::Scheduling,
            Self::AllocationRefused { .. } | Self::QuotaViolation { .. } => ErrorClass::Resource,
            Self::CyclicDependency(_) | Self::DependencyTimeout { .. } => ErrorClass::Dependency,
            Self::TimeoutError(_) => ErrorClass::Timeout,
            _ => ErrorClass::System,
        }
    }
}

/// Error classification recorded per execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Routing,
    Scheduling,
    Resource,
    Dependency,
    Timeout,
    System,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routing => "routing_error",
            Self::Scheduling => "scheduling_error",
            Self::Resource => "resource_error",
            Self::Dependency => "dependency_error",
            Self::Timeout => "timeout_error",
            Self::System => "system_error",
        }
    }
}
