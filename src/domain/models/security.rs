//! Security context domain model.
//!
//! Every job is wrapped in a security context before its container starts.
//! The context records the outcome of each pipeline check, the resources it
//! holds, and every threat observed while the job runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pool::ResourceAllocation;

/// Outcome of the per-job security checks, in pipeline order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityChecks {
    pub auth: bool,
    pub authz: bool,
    pub scan: bool,
    pub quota: bool,
    pub network: bool,
}

impl SecurityChecks {
    pub fn all_passed(&self) -> bool {
        self.auth && self.authz && self.scan && self.quota && self.network
    }
}

/// Lifecycle of a security context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Checks still in flight.
    Pending,
    /// All checks passed; container may start.
    Ready,
    /// Job container is running under monitoring.
    Running,
    /// A check failed; the job must not start.
    Blocked,
    /// Torn down.
    Closed,
}

impl ContextState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }
}

/// Severity of an observed threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// What kind of rule produced a threat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    SuspiciousProcess,
    Cryptomining,
    SuspiciousPort,
    FileIntegrity,
    ResourceAbuse,
    PolicyBreach,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuspiciousProcess => "suspicious_process",
            Self::Cryptomining => "cryptomining",
            Self::SuspiciousPort => "suspicious_port",
            Self::FileIntegrity => "file_integrity",
            Self::ResourceAbuse => "resource_abuse",
            Self::PolicyBreach => "policy_breach",
        }
    }
}

/// A threat observed while the job ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub job_id: Uuid,
    pub kind: ThreatKind,
    pub severity: ThreatSeverity,
    pub detail: String,
    pub observed_at: DateTime<Utc>,
}

impl ThreatEvent {
    pub fn new(
        job_id: Uuid,
        kind: ThreatKind,
        severity: ThreatSeverity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            kind,
            severity,
            detail: detail.into(),
            observed_at: Utc::now(),
        }
    }
}

/// A policy violation recorded against the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub policy: String,
    pub detail: String,
}

/// A secret injected into the job, tracked for revocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedSecret {
    pub name: String,
    /// Short-lived token handed to the job for re-reads.
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Per-job security context. Owned by the security orchestrator; other
/// subsystems hold borrowed references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub job_id: Uuid,
    pub state: ContextState,
    pub checks: SecurityChecks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_allocation: Option<ResourceAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default)]
    pub secrets_injected: Vec<InjectedSecret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_handle: Option<Uuid>,
    #[serde(default)]
    pub threats: Vec<ThreatEvent>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    /// Starts at 100; decremented by failed checks and threats.
    pub security_score: u8,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    /// Reason the context was blocked, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl SecurityContext {
    /// Score penalty for a failed check.
    pub const PENALTY_FAILED_CHECK: u8 = 10;
    /// Score penalty for an ordinary threat.
    pub const PENALTY_THREAT: u8 = 5;
    /// Score penalty for a critical threat.
    pub const PENALTY_CRITICAL_THREAT: u8 = 15;

    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            state: ContextState::Pending,
            checks: SecurityChecks::default(),
            resource_allocation: None,
            network_id: None,
            secrets_injected: Vec::new(),
            monitoring_handle: None,
            threats: Vec::new(),
            violations: Vec::new(),
            security_score: 100,
            opened_at: Utc::now(),
            closed_at: None,
            blocked_reason: None,
        }
    }

    pub fn penalize_failed_check(&mut self) {
        self.security_score = self.security_score.saturating_sub(Self::PENALTY_FAILED_CHECK);
    }

    /// Record a threat and apply its score penalty.
    pub fn record_threat(&mut self, threat: ThreatEvent) {
        let penalty = if threat.severity == ThreatSeverity::Critical {
            Self::PENALTY_CRITICAL_THREAT
        } else {
            Self::PENALTY_THREAT
        };
        self.security_score = self.security_score.saturating_sub(penalty);
        self.threats.push(threat);
    }

    pub fn record_violation(&mut self, policy: impl Into<String>, detail: impl Into<String>) {
        self.violations.push(Violation {
            policy: policy.into(),
            detail: detail.into(),
        });
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.state = ContextState::Blocked;
        self.blocked_reason = Some(reason.into());
        self.penalize_failed_check();
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ContextState::Ready | ContextState::Running)
    }

    /// Build the per-job report emitted on close.
    pub fn report(&self) -> SecurityReport {
        let mut recommendations = Vec::new();
        if !self.checks.scan {
            recommendations.push("rebuild the image against a patched base".to_string());
        }
        if self
            .threats
            .iter()
            .any(|t| t.kind == ThreatKind::Cryptomining)
        {
            recommendations.push("review workflow steps for injected mining payloads".to_string());
        }
        if self
            .threats
            .iter()
            .any(|t| t.kind == ThreatKind::SuspiciousPort)
        {
            recommendations.push("restrict egress for this repository's jobs".to_string());
        }
        if self.security_score < 50 {
            recommendations
                .push("quarantine this repository pending manual review".to_string());
        }
        SecurityReport {
            job_id: self.job_id,
            checks: self.checks,
            threats: self.threats.clone(),
            violations: self.violations.clone(),
            score: self.security_score,
            recommendations,
        }
    }
}

/// Report emitted when a context closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub job_id: Uuid,
    pub checks: SecurityChecks,
    pub threats: Vec<ThreatEvent>,
    pub violations: Vec<Violation>,
    pub score: u8,
    pub recommendations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_decrements() {
        let mut ctx = SecurityContext::new(Uuid::new_v4());
        assert_eq!(ctx.security_score, 100);

        ctx.penalize_failed_check();
        assert_eq!(ctx.security_score, 90);

        ctx.record_threat(ThreatEvent::new(
            ctx.job_id,
            ThreatKind::SuspiciousPort,
            ThreatSeverity::Medium,
            "port 4444 listening",
        ));
        assert_eq!(ctx.security_score, 85);

        ctx.record_threat(ThreatEvent::new(
            ctx.job_id,
            ThreatKind::Cryptomining,
            ThreatSeverity::Critical,
            "xmrig process",
        ));
        assert_eq!(ctx.security_score, 70);
    }

    #[test]
    fn test_score_saturates_at_zero() {
        let mut ctx = SecurityContext::new(Uuid::new_v4());
        for _ in 0..20 {
            ctx.record_threat(ThreatEvent::new(
                ctx.job_id,
                ThreatKind::PolicyBreach,
                ThreatSeverity::Critical,
                "x",
            ));
        }
        assert_eq!(ctx.security_score, 0);
    }

    #[test]
    fn test_block_sets_state_and_penalty() {
        let mut ctx = SecurityContext::new(Uuid::new_v4());
        ctx.block("image scan failed");
        assert_eq!(ctx.state, ContextState::Blocked);
        assert_eq!(ctx.security_score, 90);
        assert!(!ctx.is_active());
    }

    #[test]
    fn test_report_recommendations() {
        let mut ctx = SecurityContext::new(Uuid::new_v4());
        ctx.checks = SecurityChecks {
            auth: true,
            authz: true,
            scan: false,
            quota: true,
            network: true,
        };
        ctx.record_threat(ThreatEvent::new(
            ctx.job_id,
            ThreatKind::Cryptomining,
            ThreatSeverity::Critical,
            "xmrig",
        ));
        let report = ctx.report();
        assert_eq!(report.recommendations.len(), 2);
        assert!(report.recommendations[0].contains("patched base"));
    }

    #[test]
    fn test_checks_all_passed() {
        let mut checks = SecurityChecks::default();
        assert!(!checks.all_passed());
        checks = SecurityChecks {
            auth: true,
            authz: true,
            scan: true,
            quota: true,
            network: true,
        };
        assert!(checks.all_passed());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ThreatSeverity::Low < ThreatSeverity::Medium);
        assert!(ThreatSeverity::High < ThreatSeverity::Critical);
    }
}
