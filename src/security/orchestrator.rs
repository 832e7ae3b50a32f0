//! Security orchestrator.
//!
//! Wraps every job in a security context. Checks run in a fixed order and
//! short-circuit on the first block: auth/authz, image scan, quota
//! allocation, network creation, secret injection. Runtime monitoring
//! begins once the container starts; threats feed back through a channel
//! and are handled by severity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{
    AuditAction, AuditActor, AuditCategory, AuditLevel, AuditLog, AuditOutcome, AuditRecord,
    AuditResource,
};
use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{
    ContextState, Job, ResourceAllocation, SecurityConfig, SecurityContext, SecurityReport,
    ThreatEvent, ThreatSeverity,
};
use crate::domain::ports::{ContainerEngine, ContainerSpec, ImageScanner};

use super::monitor::{MonitorRules, RuntimeMonitor};
use super::network::NetworkIsolation;
use super::quotas::ResourceQuotas;
use super::rbac::{AccessContext, Rbac};
use super::scanner::{ScanPolicy, ScanVerdict};
use super::secrets::SecretManager;

/// Events other components subscribe to.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    ContextBlocked { job_id: Uuid, reason: String },
    ThreatDetected { threat: ThreatEvent },
    NetworkRestricted { job_id: Uuid },
    JobTerminated { job_id: Uuid },
}

/// Result of opening a context: the sealed check outcomes plus the
/// container spec the executor should launch.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub context: SecurityContext,
    pub container_spec: ContainerSpec,
}

struct ContextRecord {
    ctx: SecurityContext,
    container_id: Option<String>,
    report: Option<SecurityReport>,
}

/// Owns per-job security contexts and the security subsystems.
pub struct SecurityOrchestrator {
    config: SecurityConfig,
    engine: Arc<dyn ContainerEngine>,
    rbac: Arc<Rbac>,
    scan: ScanPolicy,
    quotas: Arc<ResourceQuotas>,
    network: NetworkIsolation,
    secrets: Arc<SecretManager>,
    monitor: RuntimeMonitor,
    audit: Arc<AuditLog>,
    contexts: Mutex<HashMap<Uuid, ContextRecord>>,
    threat_rx: Mutex<Option<mpsc::Receiver<ThreatEvent>>>,
    events_tx: broadcast::Sender<SecurityEvent>,
}

impl SecurityOrchestrator {
    pub fn new(
        config: SecurityConfig,
        engine: Arc<dyn ContainerEngine>,
        scanner: Arc<dyn ImageScanner>,
        audit: Arc<AuditLog>,
        cluster_capacity: ResourceAllocation,
    ) -> Self {
        let (threat_tx, threat_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(256);

        let strict = matches!(
            config.security_level,
            crate::domain::models::SecurityHardening::High
                | crate::domain::models::SecurityHardening::Paranoid
        );

        Self {
            rbac: Arc::new(Rbac::new(config.components.rbac)),
            scan: ScanPolicy::new(scanner, config.scanner.clone()),
            quotas: Arc::new(ResourceQuotas::new(
                config.components.quotas && config.policies.enforce_resource_limits,
                cluster_capacity,
                config.overcommit_ratio,
            )),
            network: NetworkIsolation::new(engine.clone(), strict, false),
            secrets: Arc::new(SecretManager::new(
                config.components.secrets,
                config.secret_passphrase.clone(),
            )),
            monitor: RuntimeMonitor::new(
                engine.clone(),
                MonitorRules::default(),
                Duration::from_secs(config.monitor_interval_secs),
                threat_tx,
            ),
            audit,
            engine,
            contexts: Mutex::new(HashMap::new()),
            threat_rx: Mutex::new(Some(threat_rx)),
            events_tx,
            config,
        }
    }

    pub fn rbac(&self) -> &Arc<Rbac> {
        &self.rbac
    }

    pub fn secrets(&self) -> &Arc<SecretManager> {
        &self.secrets
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events_tx.subscribe()
    }

    async fn record_audit(&self, record: AuditRecord) {
        if let Err(err) = self.audit.append(record).await {
            warn!(error = %err, "failed to append audit record");
        }
    }

    fn emit(&self, event: SecurityEvent) {
        // No subscribers is fine; send only fails then.
        let _ = self.events_tx.send(event);
    }

    /// Block the context, audit the decision, and store it.
    async fn block_context(
        &self,
        mut ctx: SecurityContext,
        job: &Job,
        reason: String,
        error: OrchestratorError,
    ) -> OrchestratorError {
        ctx.block(reason.clone());
        self.record_audit(
            AuditRecord::new(
                AuditCategory::Security,
                AuditAction::ContextBlocked,
                AuditOutcome::Denied,
                AuditActor::System,
                AuditResource::job(job.id),
            )
            .with_level(AuditLevel::Warning)
            .with_details(serde_json::json!({ "reason": reason })),
        )
        .await;
        self.emit(SecurityEvent::ContextBlocked {
            job_id: job.id,
            reason,
        });
        self.contexts.lock().await.insert(
            job.id,
            ContextRecord {
                ctx,
                container_id: None,
                report: None,
            },
        );
        error
    }

    /// Open a security context for a job. Runs the check pipeline in the
    /// fixed order and short-circuits on the first block.
    pub async fn open(&self, job: &Job, actor: &str) -> OrchestratorResult<OpenOutcome> {
        let mut ctx = SecurityContext::new(job.id);

        // 1. Authentication and authorization.
        ctx.checks.auth = !actor.is_empty();
        if self.config.components.rbac {
            let access = AccessContext::repository(job.repository.clone());
            if let Err(err) = self.rbac.check(actor, "jobs:create", &access).await {
                self.record_audit(
                    AuditRecord::new(
                        AuditCategory::Security,
                        AuditAction::AccessDenied,
                        AuditOutcome::Denied,
                        AuditActor::User {
                            id: actor.to_string(),
                        },
                        AuditResource::job(job.id),
                    )
                    .with_level(AuditLevel::Warning),
                )
                .await;
                return Err(self
                    .block_context(ctx, job, format!("authorization denied for {actor}"), err)
                    .await);
            }
        }
        ctx.checks.authz = true;

        // 2. Image scan.
        if self.config.components.scanner && self.config.policies.require_container_scanning {
            let outcome = match self.scan.evaluate(&job.image).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    return Err(self
                        .block_context(ctx, job, format!("image scan failed: {err}"), err)
                        .await);
                }
            };
            self.record_audit(
                AuditRecord::new(
                    AuditCategory::Security,
                    AuditAction::ImageScanned,
                    if outcome.verdict.is_blocked() {
                        AuditOutcome::Failure
                    } else {
                        AuditOutcome::Success
                    },
                    AuditActor::System,
                    AuditResource::new("image", job.image.clone()),
                )
                .with_details(serde_json::json!({
                    "digest": outcome.report.image_digest,
                    "critical": outcome.report.counts.critical,
                    "high": outcome.report.counts.high,
                    "medium": outcome.report.counts.medium,
                    "cache_hit": outcome.cache_hit,
                })),
            )
            .await;

            if let ScanVerdict::Blocked { reason } = outcome.verdict {
                ctx.record_violation("container_scanning", reason.clone());
                self.record_audit(
                    AuditRecord::new(
                        AuditCategory::Security,
                        AuditAction::ThreatDetected,
                        AuditOutcome::Failure,
                        AuditActor::System,
                        AuditResource::job(job.id),
                    )
                    .with_level(AuditLevel::Critical)
                    .with_details(serde_json::json!({
                        "image": job.image,
                        "reason": reason,
                    })),
                )
                .await;
                if self.config.policies.block_on_security_failure {
                    let err = OrchestratorError::PolicyViolation(reason.clone());
                    return Err(self.block_context(ctx, job, reason, err).await);
                }
                // Alert-only mode: note the failed check and continue.
                ctx.penalize_failed_check();
            } else {
                ctx.checks.scan = true;
            }
        } else {
            ctx.checks.scan = true;
        }

        // 3. Resource quota allocation.
        match self.quotas.allocate(job).await {
            Ok(allocation) => {
                ctx.resource_allocation = Some(allocation);
                ctx.checks.quota = true;
                self.record_audit(
                    AuditRecord::new(
                        AuditCategory::Scheduler,
                        AuditAction::QuotaAllocated,
                        AuditOutcome::Success,
                        AuditActor::System,
                        AuditResource::job(job.id),
                    )
                    .with_level(AuditLevel::Debug),
                )
                .await;
            }
            Err(err) => {
                return Err(self
                    .block_context(ctx, job, format!("quota refused: {err}"), err)
                    .await);
            }
        }

        // 4. Network isolation.
        if self.config.components.network_isolation
            && self.config.policies.enforce_network_isolation
        {
            match self.network.create_for_job(job.id).await {
                Ok(network_id) => {
                    ctx.network_id = Some(network_id.clone());
                    ctx.checks.network = true;
                    self.record_audit(
                        AuditRecord::new(
                            AuditCategory::Network,
                            AuditAction::NetworkCreated,
                            AuditOutcome::Success,
                            AuditActor::System,
                            AuditResource::new("network", network_id),
                        )
                        .with_level(AuditLevel::Debug),
                    )
                    .await;
                }
                Err(err) => {
                    self.quotas.release(job.id).await;
                    return Err(self
                        .block_context(ctx, job, format!("network isolation failed: {err}"), err)
                        .await);
                }
            }
        } else {
            ctx.checks.network = true;
        }

        // 5. Secret injection into the container spec.
        let mut container_spec = ContainerSpec {
            image: job.image.clone(),
            name: format!("runnerhub-job-{}", job.id),
            labels: HashMap::from([
                ("runnerhub.job".to_string(), job.id.to_string()),
                ("runnerhub.repository".to_string(), job.repository.clone()),
            ]),
            ..Default::default()
        };
        match self
            .secrets
            .inject(job.id, &job.secret_needs, &mut container_spec)
            .await
        {
            Ok(injected) => {
                for secret in &injected {
                    self.record_audit(
                        AuditRecord::new(
                            AuditCategory::Secret,
                            AuditAction::SecretInjected,
                            AuditOutcome::Success,
                            AuditActor::System,
                            AuditResource::new("secret", secret.name.clone()),
                        )
                        .with_level(AuditLevel::Debug),
                    )
                    .await;
                }
                ctx.secrets_injected = injected;
            }
            Err(err) => {
                self.quotas.release(job.id).await;
                let _ = self.network.remove_for_job(job.id).await;
                return Err(self
                    .block_context(ctx, job, format!("secret injection failed: {err}"), err)
                    .await);
            }
        }

        ctx.state = ContextState::Ready;
        self.record_audit(
            AuditRecord::new(
                AuditCategory::Security,
                AuditAction::ContextOpened,
                AuditOutcome::Success,
                AuditActor::System,
                AuditResource::job(job.id),
            )
            .with_details(serde_json::json!({ "score": ctx.security_score })),
        )
        .await;
        info!(job_id = %job.id, score = ctx.security_score, "security context opened");

        let snapshot = ctx.clone();
        self.contexts.lock().await.insert(
            job.id,
            ContextRecord {
                ctx,
                container_id: None,
                report: None,
            },
        );
        Ok(OpenOutcome {
            context: snapshot,
            container_spec,
        })
    }

    /// Attach the started container to its isolated network and begin
    /// runtime monitoring. The context moves to Running.
    pub async fn begin_monitoring(
        &self,
        job_id: Uuid,
        container_id: &str,
    ) -> OrchestratorResult<()> {
        if self.config.components.network_isolation
            && self.config.policies.enforce_network_isolation
        {
            self.network.attach(job_id, container_id).await?;
        }

        let handle = if self.config.components.runtime_monitor {
            Some(self.monitor.start(job_id, container_id).await)
        } else {
            None
        };

        let mut contexts = self.contexts.lock().await;
        let record = contexts
            .get_mut(&job_id)
            .ok_or_else(|| OrchestratorError::InternalError(format!("no context for {job_id}")))?;
        record.container_id = Some(container_id.to_string());
        record.ctx.monitoring_handle = handle;
        record.ctx.state = ContextState::Running;
        Ok(())
    }

    /// Handle one threat event by severity: critical isolates (and
    /// terminates when the policy says so), high restricts network access,
    /// the rest are recorded and alerted.
    pub async fn handle_threat(&self, threat: ThreatEvent) {
        let job_id = threat.job_id;
        let severity = threat.severity;

        self.record_audit(
            AuditRecord::new(
                AuditCategory::Security,
                AuditAction::ThreatDetected,
                AuditOutcome::Failure,
                AuditActor::System,
                AuditResource::job(job_id),
            )
            .with_level(match severity {
                ThreatSeverity::Critical => AuditLevel::Critical,
                ThreatSeverity::High => AuditLevel::Error,
                _ => AuditLevel::Warning,
            })
            .with_details(serde_json::json!({
                "kind": threat.kind.as_str(),
                "severity": severity.as_str(),
                "detail": threat.detail,
            })),
        )
        .await;

        let container_id = {
            let mut contexts = self.contexts.lock().await;
            let Some(record) = contexts.get_mut(&job_id) else {
                return;
            };
            record.ctx.record_threat(threat.clone());
            record.container_id.clone()
        };
        self.emit(SecurityEvent::ThreatDetected { threat });

        match severity {
            ThreatSeverity::Critical => {
                if let Some(container) = &container_id {
                    let _ = self.network.detach_all(job_id, container).await;
                    if self.config.policies.block_on_security_failure {
                        if let Err(err) = self.engine.stop(container, 0).await {
                            warn!(job_id = %job_id, error = %err, "failed to stop container");
                        }
                        self.emit(SecurityEvent::JobTerminated { job_id });
                        info!(job_id = %job_id, "job terminated after critical threat");
                    }
                }
            }
            ThreatSeverity::High => {
                if let Some(container) = &container_id {
                    let _ = self.network.detach_all(job_id, container).await;
                }
                self.emit(SecurityEvent::NetworkRestricted { job_id });
            }
            _ => {}
        }
    }

    /// Spawn the worker that drains the threat channel.
    pub fn spawn_threat_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let rx = orchestrator.threat_rx.lock().await.take();
            let Some(mut rx) = rx else {
                return;
            };
            while let Some(threat) = rx.recv().await {
                orchestrator.handle_threat(threat).await;
            }
        })
    }

    /// Close a job's context: stop monitoring, release quota, remove the
    /// network, revoke secrets, and emit the final report. Closing a
    /// context twice is a no-op that returns None.
    pub async fn close(&self, job_id: Uuid) -> Option<SecurityReport> {
        let (report, monitoring_handle) = {
            let mut contexts = self.contexts.lock().await;
            let record = contexts.get_mut(&job_id)?;
            if record.ctx.state == ContextState::Closed {
                return None;
            }
            record.ctx.state = ContextState::Closed;
            record.ctx.closed_at = Some(chrono::Utc::now());
            let report = record.ctx.report();
            record.report = Some(report.clone());
            (report, record.ctx.monitoring_handle.take())
        };

        if let Some(handle) = monitoring_handle {
            self.monitor.stop(handle).await;
        }
        self.quotas.release(job_id).await;
        if let Err(err) = self.network.remove_for_job(job_id).await {
            warn!(job_id = %job_id, error = %err, "network removal failed during close");
        }
        self.secrets.revoke_job_tokens(job_id).await;

        self.record_audit(
            AuditRecord::new(
                AuditCategory::Security,
                AuditAction::ContextClosed,
                AuditOutcome::Success,
                AuditActor::System,
                AuditResource::job(job_id),
            )
            .with_details(serde_json::json!({
                "score": report.score,
                "threats": report.threats.len(),
            })),
        )
        .await;
        info!(job_id = %job_id, score = report.score, "security context closed");
        Some(report)
    }

    /// Current context snapshot for a job.
    pub async fn context(&self, job_id: Uuid) -> Option<SecurityContext> {
        self.contexts.lock().await.get(&job_id).map(|r| r.ctx.clone())
    }

    /// Final report for a closed job.
    pub async fn report(&self, job_id: Uuid) -> Option<SecurityReport> {
        self.contexts
            .lock()
            .await
            .get(&job_id)
            .and_then(|r| r.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockContainerEngine, MockImageScanner};
    use crate::domain::models::{SecretInjectionMode, SecretNeed, ThreatKind};
    use crate::domain::ports::SeverityCounts;
    use tempfile::TempDir;

    async fn orchestrator_with(
        config: SecurityConfig,
        scanner: Arc<MockImageScanner>,
    ) -> (Arc<SecurityOrchestrator>, Arc<MockContainerEngine>, TempDir) {
        let temp = TempDir::new().unwrap();
        let audit = Arc::new(
            AuditLog::open(crate::domain::models::AuditConfig {
                base_path: temp.path().display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let engine = Arc::new(MockContainerEngine::new());
        let orchestrator = Arc::new(SecurityOrchestrator::new(
            config,
            engine.clone(),
            scanner,
            audit,
            ResourceAllocation::new(64.0, 131_072.0, 1_000_000.0),
        ));
        (orchestrator, engine, temp)
    }

    fn open_config() -> SecurityConfig {
        SecurityConfig {
            components: crate::domain::models::config::SecurityComponents {
                rbac: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn job() -> Job {
        Job::new("acme/web", "build")
    }

    #[tokio::test]
    async fn test_open_happy_path_all_checks_pass() {
        let (orchestrator, _, _tmp) =
            orchestrator_with(open_config(), Arc::new(MockImageScanner::new())).await;
        let outcome = orchestrator.open(&job(), "ci-bot").await.unwrap();

        assert_eq!(outcome.context.state, ContextState::Ready);
        assert!(outcome.context.checks.all_passed());
        assert_eq!(outcome.context.security_score, 100);
        assert!(outcome.context.network_id.is_some());
        assert_eq!(outcome.container_spec.image, "ubuntu:22.04");
    }

    #[tokio::test]
    async fn test_rbac_denies_fail_closed() {
        let mut config = open_config();
        config.components.rbac = true;
        let (orchestrator, _, _tmp) =
            orchestrator_with(config, Arc::new(MockImageScanner::new())).await;

        let j = job();
        let err = orchestrator.open(&j, "stranger").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PermissionDenied { .. }));

        let ctx = orchestrator.context(j.id).await.unwrap();
        assert_eq!(ctx.state, ContextState::Blocked);
        assert!(!ctx.checks.authz);
    }

    #[tokio::test]
    async fn test_failed_scan_blocks_at_stage_two() {
        let scanner = Arc::new(MockImageScanner::new());
        scanner
            .script_counts(
                "bad:latest",
                SeverityCounts {
                    critical: 3,
                    ..Default::default()
                },
            )
            .await;
        let (orchestrator, _, _tmp) = orchestrator_with(open_config(), scanner).await;

        let job = job().with_image("bad:latest");
        let err = orchestrator.open(&job, "ci-bot").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PolicyViolation(_)));

        let ctx = orchestrator.context(job.id).await.unwrap();
        assert_eq!(ctx.state, ContextState::Blocked);
        assert!(!ctx.checks.scan);
        // No quota or network was taken before the block.
        assert!(ctx.resource_allocation.is_none());
        assert!(ctx.network_id.is_none());
        assert!(!ctx.violations.is_empty());
    }

    #[tokio::test]
    async fn test_missing_secret_blocks_and_rolls_back() {
        let (orchestrator, _, _tmp) =
            orchestrator_with(open_config(), Arc::new(MockImageScanner::new())).await;

        let job = job().with_secret_need(SecretNeed {
            name: "ghost".to_string(),
            mode: SecretInjectionMode::Env,
            target: None,
        });
        let err = orchestrator.open(&job, "ci-bot").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SecretUnavailable(_)));

        let ctx = orchestrator.context(job.id).await.unwrap();
        assert_eq!(ctx.state, ContextState::Blocked);
        // The network created in step 4 was torn down on the step-5 block.
        assert!(orchestrator.network.network_id(job.id).await.is_none());
    }

    #[tokio::test]
    async fn test_begin_monitoring_moves_to_running() {
        let (orchestrator, engine, _tmp) =
            orchestrator_with(open_config(), Arc::new(MockImageScanner::new())).await;
        let job = job();
        let outcome = orchestrator.open(&job, "ci-bot").await.unwrap();

        let container = engine.create(outcome.container_spec).await.unwrap();
        engine.start(&container).await.unwrap();
        orchestrator
            .begin_monitoring(job.id, &container)
            .await
            .unwrap();

        let ctx = orchestrator.context(job.id).await.unwrap();
        assert_eq!(ctx.state, ContextState::Running);
        assert!(ctx.monitoring_handle.is_some());
        assert!(ctx.is_active());
    }

    #[tokio::test]
    async fn test_critical_threat_terminates_job() {
        let (orchestrator, engine, _tmp) =
            orchestrator_with(open_config(), Arc::new(MockImageScanner::new())).await;
        let job = job();
        let outcome = orchestrator.open(&job, "ci-bot").await.unwrap();
        let container = engine.create(outcome.container_spec).await.unwrap();
        engine.start(&container).await.unwrap();
        orchestrator
            .begin_monitoring(job.id, &container)
            .await
            .unwrap();

        let mut events = orchestrator.subscribe();
        orchestrator
            .handle_threat(ThreatEvent::new(
                job.id,
                ThreatKind::Cryptomining,
                ThreatSeverity::Critical,
                "xmrig",
            ))
            .await;

        assert!(!engine.is_running(&container).await);
        let ctx = orchestrator.context(job.id).await.unwrap();
        assert_eq!(ctx.security_score, 100 - 15);
        assert_eq!(ctx.threats.len(), 1);

        // Both the threat and the termination were broadcast.
        let mut saw_termination = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SecurityEvent::JobTerminated { .. }) {
                saw_termination = true;
            }
        }
        assert!(saw_termination);
    }

    #[tokio::test]
    async fn test_high_threat_restricts_network_only() {
        let (orchestrator, engine, _tmp) =
            orchestrator_with(open_config(), Arc::new(MockImageScanner::new())).await;
        let job = job();
        let outcome = orchestrator.open(&job, "ci-bot").await.unwrap();
        let network_id = outcome.context.network_id.clone().unwrap();
        let container = engine.create(outcome.container_spec).await.unwrap();
        engine.start(&container).await.unwrap();
        orchestrator
            .begin_monitoring(job.id, &container)
            .await
            .unwrap();

        orchestrator
            .handle_threat(ThreatEvent::new(
                job.id,
                ThreatKind::SuspiciousPort,
                ThreatSeverity::High,
                "port 4444",
            ))
            .await;

        // Still running, but detached from its network.
        assert!(engine.is_running(&container).await);
        assert!(engine.network_members(&network_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reports() {
        let (orchestrator, engine, _tmp) =
            orchestrator_with(open_config(), Arc::new(MockImageScanner::new())).await;
        let job = job();
        let outcome = orchestrator.open(&job, "ci-bot").await.unwrap();
        let container = engine.create(outcome.container_spec).await.unwrap();
        engine.start(&container).await.unwrap();
        orchestrator
            .begin_monitoring(job.id, &container)
            .await
            .unwrap();

        let report = orchestrator.close(job.id).await.unwrap();
        assert_eq!(report.score, 100);
        assert!(report.checks.all_passed());

        // Second close is a no-op.
        assert!(orchestrator.close(job.id).await.is_none());
        // The report remains retrievable.
        assert!(orchestrator.report(job.id).await.is_some());
        // The isolated network is gone.
        assert!(orchestrator.network.network_id(job.id).await.is_none());
    }
}
