//! Configuration structures.
//!
//! Every recognised option is an enumerated field; unknown keys are
//! rejected at load time by `deny_unknown_fields`, so configuration
//! mistakes fail closed instead of silently applying defaults.

use serde::{Deserialize, Serialize};

/// Scheduling policy selector. Exactly one policy is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    Fifo,
    FairShare,
    Priority,
    ShortestJobFirst,
    Backfill,
    DeadlineAware,
    MultiObjective,
}

impl Default for SchedulingAlgorithm {
    fn default() -> Self {
        Self::Fifo
    }
}

/// Main configuration structure for RunnerHub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub scheduling_algorithm: SchedulingAlgorithm,

    /// Seconds between scheduling passes.
    #[serde(default = "default_scheduling_interval")]
    pub scheduling_interval_secs: u64,

    #[serde(default)]
    pub preemption_enabled: bool,

    #[serde(default)]
    pub fair_share_enabled: bool,

    #[serde(default)]
    pub backfill_enabled: bool,

    /// Whether reservations are held for scheduled jobs before start.
    #[serde(default = "default_true")]
    pub resource_reservation: bool,

    #[serde(default)]
    pub auto_scaling: AutoScalingConfig,
}

const fn default_scheduling_interval() -> u64 {
    5
}

const fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduling_algorithm: SchedulingAlgorithm::default(),
            scheduling_interval_secs: default_scheduling_interval(),
            preemption_enabled: false,
            fair_share_enabled: false,
            backfill_enabled: false,
            resource_reservation: true,
            auto_scaling: AutoScalingConfig::default(),
        }
    }
}

/// Auto-scaling configuration for pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AutoScalingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_min_runners")]
    pub min_runners: u32,

    #[serde(default = "default_max_runners")]
    pub max_runners: u32,

    /// Scale up above this utilization.
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,

    /// Scale down below this utilization.
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,

    #[serde(default = "default_scale_up_cooldown")]
    pub scale_up_cooldown_secs: u64,

    #[serde(default = "default_scale_down_cooldown")]
    pub scale_down_cooldown_secs: u64,

    #[serde(default = "default_scale_steps")]
    pub scale_up_steps: u32,

    #[serde(default = "default_scale_steps")]
    pub scale_down_steps: u32,
}

const fn default_min_runners() -> u32 {
    1
}

const fn default_max_runners() -> u32 {
    10
}

const fn default_scale_up_threshold() -> f64 {
    0.8
}

const fn default_scale_down_threshold() -> f64 {
    0.3
}

const fn default_scale_up_cooldown() -> u64 {
    120
}

const fn default_scale_down_cooldown() -> u64 {
    600
}

const fn default_scale_steps() -> u32 {
    1
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_runners: default_min_runners(),
            max_runners: default_max_runners(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            scale_up_cooldown_secs: default_scale_up_cooldown(),
            scale_down_cooldown_secs: default_scale_down_cooldown(),
            scale_up_steps: default_scale_steps(),
            scale_down_steps: default_scale_steps(),
        }
    }
}

/// Which submission attribute sticky sessions pin on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyKey {
    Repository,
    Workflow,
    User,
}

impl Default for StickyKey {
    fn default() -> Self {
        Self::Repository
    }
}

/// Sticky-session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct StickyConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub key: StickyKey,

    #[serde(default = "default_sticky_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

const fn default_sticky_ttl() -> u64 {
    1800
}

const fn default_max_sessions() -> usize {
    10_000
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key: StickyKey::default(),
            ttl_secs: default_sticky_ttl(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Submission throttling configuration, keyed by `repo:workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ThrottlingConfig {
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,

    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

const fn default_rps() -> u32 {
    10
}

const fn default_rpm() -> u32 {
    300
}

const fn default_burst() -> u32 {
    20
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            requests_per_minute: default_rpm(),
            burst: default_burst(),
        }
    }
}

/// How the load balancer picks runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbAlgorithm {
    /// Delegate to the router's per-job algorithm selection.
    RouterDelegate,
    /// Pin by consistent hash of the session key.
    ConsistentHash,
}

impl Default for LbAlgorithm {
    fn default() -> Self {
        Self::RouterDelegate
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub algorithm: LbAlgorithm,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Total queued jobs across all priority queues.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_priority_queues")]
    pub priority_queues: usize,

    /// Failure rate at which a runner's breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: f64,

    /// Seconds an open breaker waits before probing half-open.
    #[serde(default = "default_half_open_timeout")]
    pub half_open_timeout_secs: u64,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default)]
    pub throttling: ThrottlingConfig,

    #[serde(default)]
    pub sticky: StickyConfig,
}

const fn default_max_concurrent_jobs() -> usize {
    50
}

const fn default_max_queue_size() -> usize {
    500
}

const fn default_priority_queues() -> usize {
    5
}

const fn default_breaker_threshold() -> f64 {
    0.5
}

const fn default_half_open_timeout() -> u64 {
    60
}

const fn default_health_check_interval() -> u64 {
    30
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: LbAlgorithm::default(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_size: default_max_queue_size(),
            priority_queues: default_priority_queues(),
            circuit_breaker_threshold: default_breaker_threshold(),
            half_open_timeout_secs: default_half_open_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            throttling: ThrottlingConfig::default(),
            sticky: StickyConfig::default(),
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay; attempt `n` waits `base * multiplier^(n-1)`.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Seconds between dispatch ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Soft-stop window for cancelled containers.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    #[serde(default = "default_true")]
    pub load_balancing_enabled: bool,

    #[serde(default = "default_true")]
    pub resource_aware: bool,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

const fn default_retry_multiplier() -> f64 {
    2.0
}

const fn default_tick_interval() -> u64 {
    1
}

const fn default_grace_period() -> u64 {
    30
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent_jobs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
            tick_interval_secs: default_tick_interval(),
            grace_period_secs: default_grace_period(),
            load_balancing_enabled: true,
            resource_aware: true,
        }
    }
}

/// Overall hardening posture; selects component defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityHardening {
    Low,
    Medium,
    High,
    Paranoid,
}

impl Default for SecurityHardening {
    fn default() -> Self {
        Self::High
    }
}

/// Enforcement policies applied by the security orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SecurityPolicies {
    #[serde(default = "default_true")]
    pub enforce_network_isolation: bool,

    #[serde(default = "default_true")]
    pub enforce_resource_limits: bool,

    #[serde(default = "default_true")]
    pub require_container_scanning: bool,

    #[serde(default = "default_true")]
    pub block_on_security_failure: bool,

    #[serde(default = "default_true")]
    pub enforce_secret_encryption: bool,
}

impl Default for SecurityPolicies {
    fn default() -> Self {
        Self {
            enforce_network_isolation: true,
            enforce_resource_limits: true,
            require_container_scanning: true,
            block_on_security_failure: true,
            enforce_secret_encryption: true,
        }
    }
}

/// Image scanner policy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ScannerPolicyConfig {
    #[serde(default)]
    pub max_critical: u32,

    #[serde(default = "default_max_high")]
    pub max_high: u32,

    #[serde(default = "default_max_medium")]
    pub max_medium: u32,

    /// Licenses allowed in scanned images; empty allows all.
    #[serde(default)]
    pub allowed_licenses: Vec<String>,

    #[serde(default)]
    pub banned_packages: Vec<String>,
}

const fn default_max_high() -> u32 {
    5
}

const fn default_max_medium() -> u32 {
    20
}

impl Default for ScannerPolicyConfig {
    fn default() -> Self {
        Self {
            max_critical: 0,
            max_high: default_max_high(),
            max_medium: default_max_medium(),
            allowed_licenses: Vec::new(),
            banned_packages: Vec::new(),
        }
    }
}

/// Per-component enable flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SecurityComponents {
    #[serde(default = "default_true")]
    pub rbac: bool,

    #[serde(default = "default_true")]
    pub scanner: bool,

    #[serde(default = "default_true")]
    pub quotas: bool,

    #[serde(default = "default_true")]
    pub network_isolation: bool,

    #[serde(default = "default_true")]
    pub secrets: bool,

    #[serde(default = "default_true")]
    pub runtime_monitor: bool,
}

impl Default for SecurityComponents {
    fn default() -> Self {
        Self {
            rbac: true,
            scanner: true,
            quotas: true,
            network_isolation: true,
            secrets: true,
            runtime_monitor: true,
        }
    }
}

/// Security orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default)]
    pub security_level: SecurityHardening,

    #[serde(default)]
    pub components: SecurityComponents,

    #[serde(default)]
    pub policies: SecurityPolicies,

    #[serde(default)]
    pub scanner: ScannerPolicyConfig,

    /// Sampling interval of the runtime monitor.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Quota overcommit: cluster capacity multiplier for allocations.
    #[serde(default = "default_overcommit")]
    pub overcommit_ratio: f64,

    /// Master passphrase for the encrypted secret store. Production
    /// deployments set this through `RUNNERHUB_SECURITY__SECRET_PASSPHRASE`.
    #[serde(default)]
    pub secret_passphrase: String,
}

const fn default_monitor_interval() -> u64 {
    5
}

const fn default_overcommit() -> f64 {
    1.0
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityHardening::default(),
            components: SecurityComponents::default(),
            policies: SecurityPolicies::default(),
            scanner: ScannerPolicyConfig::default(),
            monitor_interval_secs: default_monitor_interval(),
            overcommit_ratio: default_overcommit(),
            secret_passphrase: String::new(),
        }
    }
}

/// On-disk audit record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditFormat {
    Json,
    Csv,
}

impl Default for AuditFormat {
    fn default() -> Self {
        Self::Json
    }
}

/// Audit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub base_path: String,

    #[serde(default)]
    pub format: AuditFormat,

    #[serde(default)]
    pub compression: bool,

    #[serde(default)]
    pub encryption: bool,

    /// Bytes before the active file rotates.
    #[serde(default = "default_audit_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_audit_max_files")]
    pub max_files: u32,

    #[serde(default = "default_audit_retention")]
    pub retention_days: u32,

    #[serde(default = "default_true")]
    pub chain_hashes: bool,

    /// Compliance standards tagged onto exported records.
    #[serde(default)]
    pub standards: Vec<String>,

    /// Records buffered before a flush is forced.
    #[serde(default = "default_audit_batch")]
    pub buffer_batch_size: usize,

    /// Seconds between interval flushes.
    #[serde(default = "default_audit_flush_interval")]
    pub flush_interval_secs: u64,

    /// Fields indexed per archive file.
    #[serde(default = "default_indexed_fields")]
    pub indexed_fields: Vec<String>,
}

fn default_audit_path() -> String {
    ".runnerhub/audit".to_string()
}

const fn default_audit_max_file_size() -> u64 {
    50 * 1024 * 1024
}

const fn default_audit_max_files() -> u32 {
    100
}

const fn default_audit_retention() -> u32 {
    365
}

const fn default_audit_batch() -> usize {
    64
}

const fn default_audit_flush_interval() -> u64 {
    5
}

fn default_indexed_fields() -> Vec<String> {
    vec![
        "category".to_string(),
        "action".to_string(),
        "actor".to_string(),
        "resource_id".to_string(),
    ]
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            base_path: default_audit_path(),
            format: AuditFormat::default(),
            compression: false,
            encryption: false,
            max_file_size: default_audit_max_file_size(),
            max_files: default_audit_max_files(),
            retention_days: default_audit_retention(),
            chain_hashes: true,
            standards: Vec::new(),
            buffer_batch_size: default_audit_batch(),
            flush_interval_secs: default_audit_flush_interval(),
            indexed_fields: default_indexed_fields(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for daily-rolled log files; stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
        }
    }
}

/// Webhook ingress configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct WebhookConfig {
    /// Shared HMAC secret; empty disables signature verification, which is
    /// only acceptable in tests.
    #[serde(default)]
    pub secret: String,
}
