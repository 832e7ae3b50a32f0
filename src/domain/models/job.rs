//! Job domain model.
//!
//! A job is a single workflow-job execution request received from a webhook.
//! Jobs are immutable once submitted; all lifecycle state lives in the
//! execution plan that wraps them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority level for jobs. Lower numeric value means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            "background" => Some(Self::Background),
            _ => None,
        }
    }

    /// Numeric rank; 1 is most urgent.
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// True when this priority is at least as urgent as `other`.
    pub fn at_least(&self, other: Self) -> bool {
        self.rank() <= other.rank()
    }
}

impl Ord for JobPriority {
    /// Orders by urgency: `Critical < High < ... < Background`.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for JobPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Security classification of a job's workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        Self::Internal
    }
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

/// A min/preferred/max envelope for one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub min: f64,
    pub preferred: f64,
    pub max: f64,
}

impl Requirement {
    pub fn new(min: f64, preferred: f64, max: f64) -> Self {
        Self { min, preferred, max }
    }

    /// A flat requirement where min = preferred = max.
    pub fn exact(value: f64) -> Self {
        Self::new(value, value, value)
    }

    pub fn is_valid(&self) -> bool {
        self.min >= 0.0 && self.min <= self.preferred && self.preferred <= self.max
    }
}

impl Default for Requirement {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

/// GPU requirement: a type label and a count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRequirement {
    pub gpu_type: String,
    pub count: u32,
}

/// Declared resource needs of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU cores.
    pub cpu: Requirement,
    /// Memory in MiB.
    pub memory_mb: Requirement,
    /// Disk in MiB.
    pub disk_mb: Requirement,
    /// Optional GPU needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuRequirement>,
    /// Specialized hardware labels (e.g. "fpga", "arm64-builder").
    #[serde(default)]
    pub specialized: Vec<String>,
}

impl ResourceRequirements {
    pub fn is_valid(&self) -> bool {
        self.cpu.is_valid() && self.memory_mb.is_valid() && self.disk_mb.is_valid()
    }
}

/// Whether an affinity rule must hold or merely should.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityStrength {
    Hard,
    Soft,
}

/// A positive selector drawing a job toward runners with matching labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRule {
    /// Label or capability the runner must (or should) carry.
    pub label: String,
    pub strength: AffinityStrength,
    /// Weight applied when the rule is soft; hard rules score a fixed 0.5.
    #[serde(default = "default_soft_weight")]
    pub weight: f64,
}

fn default_soft_weight() -> f64 {
    0.25
}

/// A negative selector pushing a job away from runners with matching labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiAffinityRule {
    pub label: String,
    pub strength: AffinityStrength,
}

/// Placement constraints filtered before any scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementConstraints {
    /// When non-empty, only these runner ids are eligible. Mandatory for
    /// `SecurityLevel::Restricted` jobs.
    #[serde(default)]
    pub allowed_runners: Vec<String>,
    /// Runner ids that are never eligible.
    #[serde(default)]
    pub blocked_runners: Vec<String>,
    /// Capabilities every candidate must carry.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Minimum security level of the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_security_level: Option<SecurityLevel>,
}

/// How a secret is made available inside the job container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretInjectionMode {
    Env,
    File,
    Memory,
}

/// A secret the job declares it needs at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretNeed {
    /// Name under which the secret is stored.
    pub name: String,
    pub mode: SecretInjectionMode,
    /// Env var name or mount path, depending on mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A single workflow-job execution request. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable identifier.
    pub id: Uuid,
    /// Owning repository, `owner/name`.
    pub repository: String,
    /// Workflow name within the repository.
    pub workflow: String,
    /// Labels the job requires of a runner (e.g. `self-hosted`, `linux`).
    pub labels: Vec<String>,
    /// Container image the job runs in.
    pub image: String,
    /// Declared resource needs.
    pub requirements: ResourceRequirements,
    pub priority: JobPriority,
    /// Estimated duration, used by scheduling policies and the critical path.
    pub estimated_duration_secs: u64,
    /// Optional deadline for deadline-aware scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Predecessor job ids within the same submission batch.
    #[serde(default)]
    pub needs: Vec<Uuid>,
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub affinity: Vec<AffinityRule>,
    #[serde(default)]
    pub anti_affinity: Vec<AntiAffinityRule>,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    /// Secrets to inject before the container starts.
    #[serde(default)]
    pub secret_needs: Vec<SecretNeed>,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(repository: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            repository: repository.into(),
            workflow: workflow.into(),
            labels: Vec::new(),
            image: "ubuntu:22.04".to_string(),
            requirements: ResourceRequirements::default(),
            priority: JobPriority::default(),
            estimated_duration_secs: 300,
            deadline: None,
            needs: Vec::new(),
            security_level: SecurityLevel::default(),
            affinity: Vec::new(),
            anti_affinity: Vec::new(),
            constraints: PlacementConstraints::default(),
            secret_needs: Vec::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_estimated_duration(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Add a dependency on another job in the same batch.
    pub fn with_need(mut self, job_id: Uuid) -> Self {
        if !self.needs.contains(&job_id) && job_id != self.id {
            self.needs.push(job_id);
        }
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn with_constraints(mut self, constraints: PlacementConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_affinity(mut self, rule: AffinityRule) -> Self {
        self.affinity.push(rule);
        self
    }

    pub fn with_anti_affinity(mut self, rule: AntiAffinityRule) -> Self {
        self.anti_affinity.push(rule);
        self
    }

    pub fn with_secret_need(mut self, need: SecretNeed) -> Self {
        self.secret_needs.push(need);
        self
    }

    /// Rate-limiter key: jobs throttle per `(repository, workflow)`.
    pub fn throttle_key(&self) -> String {
        format!("{}:{}", self.repository, self.workflow)
    }

    /// Validate the submission before it enters any queue.
    pub fn validate(&self) -> Result<(), String> {
        if self.repository.is_empty() || !self.repository.contains('/') {
            return Err("repository must be owner/name".to_string());
        }
        if self.workflow.is_empty() {
            return Err("workflow cannot be empty".to_string());
        }
        if self.image.is_empty() {
            return Err("image cannot be empty".to_string());
        }
        if !self.requirements.is_valid() {
            return Err("resource requirements must satisfy min <= preferred <= max".to_string());
        }
        if self.needs.contains(&self.id) {
            return Err("job cannot depend on itself".to_string());
        }
        if self.security_level == SecurityLevel::Restricted
            && self.constraints.allowed_runners.is_empty()
        {
            return Err("restricted jobs require an explicit runner allowlist".to_string());
        }
        Ok(())
    }
}

/// Outcome of a finished job, consumed by dependency conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub exit_code: i32,
}

impl JobResult {
    pub fn succeeded() -> Self {
        Self { success: true, exit_code: 0 }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self { success: false, exit_code }
    }
}
