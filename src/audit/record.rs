//! Audit record model.
//!
//! Records are append-only and, when chaining is enabled, tamper-evident:
//! every record carries the SHA-256 of its predecessor, and its own hash is
//! computed over its serialised form with the `hash` field empty.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Category of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Job,
    Scheduler,
    Security,
    Network,
    Secret,
    Webhook,
    System,
    Compliance,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Scheduler => "scheduler",
            Self::Security => "security",
            Self::Network => "network",
            Self::Secret => "secret",
            Self::Webhook => "webhook",
            Self::System => "system",
            Self::Compliance => "compliance",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "job" => Some(Self::Job),
            "scheduler" => Some(Self::Scheduler),
            "security" => Some(Self::Security),
            "network" => Some(Self::Network),
            "secret" => Some(Self::Secret),
            "webhook" => Some(Self::Webhook),
            "system" => Some(Self::System),
            "compliance" => Some(Self::Compliance),
            _ => None,
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Job lifecycle
    JobSubmitted,
    JobScheduled,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    JobRetried,
    JobPreempted,

    // Plans
    PlanCreated,
    PlanCompleted,
    PlanCancelled,

    // Scheduling and balancing
    RunnerScaledUp,
    RunnerScaledDown,
    CircuitBreakerOpened,
    SubmissionRejected,

    // Security pipeline
    ContextOpened,
    ContextBlocked,
    ContextClosed,
    ThreatDetected,
    AccessGranted,
    AccessDenied,
    ImageScanned,
    SecretInjected,
    SecretRevoked,
    NetworkCreated,
    NetworkRemoved,
    QuotaAllocated,
    QuotaReleased,

    // Housekeeping
    WebhookReceived,
    ConfigChanged,
    RetentionSweep,
    IntegrityCheck,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobSubmitted => "job_submitted",
            Self::JobScheduled => "job_scheduled",
            Self::JobStarted => "job_started",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::JobRetried => "job_retried",
            Self::JobPreempted => "job_preempted",
            Self::PlanCreated => "plan_created",
            Self::PlanCompleted => "plan_completed",
            Self::PlanCancelled => "plan_cancelled",
            Self::RunnerScaledUp => "runner_scaled_up",
            Self::RunnerScaledDown => "runner_scaled_down",
            Self::CircuitBreakerOpened => "circuit_breaker_opened",
            Self::SubmissionRejected => "submission_rejected",
            Self::ContextOpened => "context_opened",
            Self::ContextBlocked => "context_blocked",
            Self::ContextClosed => "context_closed",
            Self::ThreatDetected => "threat_detected",
            Self::AccessGranted => "access_granted",
            Self::AccessDenied => "access_denied",
            Self::ImageScanned => "image_scanned",
            Self::SecretInjected => "secret_injected",
            Self::SecretRevoked => "secret_revoked",
            Self::NetworkCreated => "network_created",
            Self::NetworkRemoved => "network_removed",
            Self::QuotaAllocated => "quota_allocated",
            Self::QuotaReleased => "quota_released",
            Self::WebhookReceived => "webhook_received",
            Self::ConfigChanged => "config_changed",
            Self::RetentionSweep => "retention_sweep",
            Self::IntegrityCheck => "integrity_check",
        }
    }
}

/// Severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Outcome the record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

/// Who caused the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AuditActor {
    System,
    User { id: String },
    Service { name: String },
    Webhook { delivery_id: String },
}

impl AuditActor {
    /// Flat identifier used by index files and search filters.
    pub fn identifier(&self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::User { id } => id.clone(),
            Self::Service { name } => name.clone(),
            Self::Webhook { delivery_id } => delivery_id.clone(),
        }
    }
}

/// The entity the event concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResource {
    pub resource_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AuditResource {
    pub fn job(id: Uuid) -> Self {
        Self {
            resource_type: "job".to_string(),
            id: id.to_string(),
            name: None,
        }
    }

    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            name: None,
        }
    }
}

/// Compliance tagging for regulated deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceBlock {
    pub standards: Vec<String>,
}

/// Tamper-evidence block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityBlock {
    pub algo: String,
    pub hash: String,
    pub prev_hash: String,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Milliseconds since the epoch; strictly monotonic per log.
    pub timestamp_ms: i64,
    pub category: AuditCategory,
    pub action: AuditAction,
    pub result: AuditOutcome,
    pub level: AuditLevel,
    pub actor: AuditActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub resource: AuditResource,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<ComplianceBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityBlock>,
}

impl AuditRecord {
    pub fn new(
        category: AuditCategory,
        action: AuditAction,
        result: AuditOutcome,
        actor: AuditActor,
        resource: AuditResource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_ms: Utc::now().timestamp_millis(),
            category,
            action,
            result,
            level: AuditLevel::Info,
            actor,
            session: None,
            source_ip: None,
            user_agent: None,
            resource,
            details: serde_json::Value::Null,
            compliance: None,
            integrity: None,
        }
    }

    pub fn with_level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_source(
        mut self,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        self.source_ip = Some(ip.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_compliance(mut self, standards: Vec<String>) -> Self {
        self.compliance = Some(ComplianceBlock { standards });
        self
    }

    /// Hash of this record: SHA-256 over its serialised form with the
    /// integrity `hash` field emptied. `prev_hash` must already be set.
    pub fn compute_hash(&self) -> String {
        let mut hashable = self.clone();
        if let Some(integrity) = &mut hashable.integrity {
            integrity.hash = String::new();
        }
        let serialised =
            serde_json::to_string(&hashable).unwrap_or_else(|_| format!("{hashable:?}"));
        hex::encode(Sha256::digest(serialised.as_bytes()))
    }

    /// Chain this record to its predecessor's hash and seal it.
    pub fn seal(&mut self, prev_hash: &str) {
        self.integrity = Some(IntegrityBlock {
            algo: "sha256".to_string(),
            hash: String::new(),
            prev_hash: prev_hash.to_string(),
        });
        let hash = self.compute_hash();
        if let Some(integrity) = &mut self.integrity {
            integrity.hash = hash;
        }
    }

    /// Verify this record's own hash under the sealing rule.
    pub fn hash_valid(&self) -> bool {
        match &self.integrity {
            Some(integrity) => integrity.hash == self.compute_hash(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> AuditRecord {
        AuditRecord::new(
            AuditCategory::Security,
            AuditAction::ThreatDetected,
            AuditOutcome::Failure,
            AuditActor::System,
            AuditResource::job(Uuid::new_v4()),
        )
        .with_level(AuditLevel::Critical)
        .with_details(json!({"kind": "cryptomining"}))
    }

    #[test]
    fn test_seal_and_verify() {
        let mut rec = record();
        rec.seal("genesis");
        assert!(rec.hash_valid());
        let integrity = rec.integrity.as_ref().unwrap();
        assert_eq!(integrity.prev_hash, "genesis");
        assert_eq!(integrity.algo, "sha256");
        assert_eq!(integrity.hash.len(), 64);
    }

    #[test]
    fn test_tampered_record_fails_verification() {
        let mut rec = record();
        rec.seal("genesis");
        rec.details = json!({"kind": "benign"});
        assert!(!rec.hash_valid());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut rec = record();
        rec.seal("prev");
        let line = serde_json::to_string(&rec).unwrap();
        let parsed: AuditRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, rec);
        assert!(parsed.hash_valid());
    }

    #[test]
    fn test_hash_depends_on_prev() {
        let mut a = record();
        let mut b = a.clone();
        a.seal("one");
        b.seal("two");
        assert_ne!(
            a.integrity.as_ref().unwrap().hash,
            b.integrity.as_ref().unwrap().hash
        );
    }

    #[test]
    fn test_unchained_record_verifies() {
        let rec = record();
        assert!(rec.hash_valid());
    }
}
