//! Resource pool domain model.
//!
//! Pools own aggregate capacity counters for their member runners. The
//! counter invariant `reserved + available == total` holds for every
//! resource class at all times; `reserve` and `release` are the only
//! mutators and refuse to drive any counter negative.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobPriority;

/// One resource class counter. All units are class-specific (cores, MiB).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceCounter {
    pub total: f64,
    pub available: f64,
    pub reserved: f64,
}

impl ResourceCounter {
    pub fn new(total: f64) -> Self {
        Self { total, available: total, reserved: 0.0 }
    }

    /// Reserve `amount`; fails without mutating when insufficient.
    pub fn reserve(&mut self, amount: f64) -> Result<(), f64> {
        if amount < 0.0 || amount > self.available + f64::EPSILON {
            return Err(self.available);
        }
        self.available -= amount;
        self.reserved += amount;
        debug_assert!(self.holds_invariant());
        Ok(())
    }

    /// Release `amount`, clamped so reserved never goes negative.
    pub fn release(&mut self, amount: f64) {
        let amount = amount.max(0.0).min(self.reserved);
        self.reserved -= amount;
        self.available += amount;
        debug_assert!(self.holds_invariant());
    }

    pub fn holds_invariant(&self) -> bool {
        (self.reserved + self.available - self.total).abs() < 1e-6
            && self.reserved >= -1e-9
            && self.available >= -1e-9
    }

    /// Utilization fraction in [0, 1].
    pub fn utilization(&self) -> f64 {
        if self.total <= 0.0 {
            0.0
        } else {
            (self.reserved / self.total).clamp(0.0, 1.0)
        }
    }
}

/// A concrete amount reserved for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu_cores: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub gpu_count: u32,
}

impl ResourceAllocation {
    pub fn new(cpu_cores: f64, memory_mb: f64, disk_mb: f64) -> Self {
        Self { cpu_cores, memory_mb, disk_mb, gpu_count: 0 }
    }
}

/// Strategy for choosing a preemption victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionStrategy {
    LowestPriority,
    ShortestRemaining,
    LeastProgress,
    NewestJob,
}

impl Default for PreemptionStrategy {
    fn default() -> Self {
        Self::LowestPriority
    }
}

/// Pool preemption policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreemptionPolicy {
    pub enabled: bool,
    /// Incoming jobs at least this urgent may preempt.
    pub priority_threshold: JobPriority,
    /// Soft-stop window before the victim is terminated.
    pub grace_period_secs: u64,
    pub strategy: PreemptionStrategy,
}

impl Default for PreemptionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            priority_threshold: JobPriority::High,
            grace_period_secs: 300,
            strategy: PreemptionStrategy::default(),
        }
    }
}

/// A recurring daily interval during which the pool accepts jobs of at
/// least a given priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingWindow {
    /// Inclusive start hour (0-23, UTC).
    pub start_hour: u32,
    /// Exclusive end hour (1-24, UTC). A window may wrap midnight.
    pub end_hour: u32,
    /// Only jobs at least this urgent are admitted during the window.
    pub min_priority: JobPriority,
}

impl SchedulingWindow {
    /// Whether `at` falls inside the window and `priority` is urgent enough.
    pub fn admits(&self, at: DateTime<Utc>, priority: JobPriority) -> bool {
        let hour = at.hour();
        let inside = if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Wraps midnight
            hour >= self.start_hour || hour < self.end_hour
        };
        inside && priority.at_least(self.min_priority)
    }
}

/// Per-pool scheduling policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolPolicies {
    pub max_jobs_per_runner: u32,
    pub max_cpu_utilization: f64,
    pub max_memory_utilization: f64,
    pub preemption: PreemptionPolicy,
    /// Per-job ceiling; jobs asking more are ineligible for the pool.
    pub max_job_cpu_cores: f64,
    pub max_job_memory_mb: f64,
    /// Job workflow names explicitly allowed. Empty means allow all.
    pub allowed_job_types: Vec<String>,
    pub blocked_job_types: Vec<String>,
    /// When empty, the pool is always open.
    pub scheduling_windows: Vec<SchedulingWindow>,
}

impl Default for PoolPolicies {
    fn default() -> Self {
        Self {
            max_jobs_per_runner: 4,
            max_cpu_utilization: 0.9,
            max_memory_utilization: 0.9,
            preemption: PreemptionPolicy::default(),
            max_job_cpu_cores: 16.0,
            max_job_memory_mb: 65536.0,
            allowed_job_types: Vec::new(),
            blocked_job_types: Vec::new(),
            scheduling_windows: Vec::new(),
        }
    }
}

impl PoolPolicies {
    /// Whether the workflow name passes the allow/block lists.
    pub fn admits_job_type(&self, workflow: &str) -> bool {
        if self.blocked_job_types.iter().any(|b| b == workflow) {
            return false;
        }
        self.allowed_job_types.is_empty() || self.allowed_job_types.iter().any(|a| a == workflow)
    }

    /// Whether any scheduling window admits the job now. An empty window
    /// list always admits.
    pub fn window_admits(&self, at: DateTime<Utc>, priority: JobPriority) -> bool {
        self.scheduling_windows.is_empty()
            || self.scheduling_windows.iter().any(|w| w.admits(at, priority))
    }
}

/// Pool lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Active,
    Draining,
    Disabled,
}

impl Default for PoolStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Aggregate capacity for a pool, one counter per resource class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCapacity {
    pub cpu_cores: ResourceCounter,
    pub memory_mb: ResourceCounter,
    pub disk_mb: ResourceCounter,
    pub bandwidth_mbps: ResourceCounter,
    pub gpus: ResourceCounter,
}

impl PoolCapacity {
    pub fn new(cpu_cores: f64, memory_mb: f64, disk_mb: f64) -> Self {
        Self {
            cpu_cores: ResourceCounter::new(cpu_cores),
            memory_mb: ResourceCounter::new(memory_mb),
            disk_mb: ResourceCounter::new(disk_mb),
            bandwidth_mbps: ResourceCounter::new(10_000.0),
            gpus: ResourceCounter::new(0.0),
        }
    }

    /// Reserve across all classes atomically: either every class reserves
    /// or none does.
    pub fn reserve(&mut self, alloc: &ResourceAllocation) -> Result<(), String> {
        if self.cpu_cores.reserve(alloc.cpu_cores).is_err() {
            return Err(format!(
                "insufficient cpu: requested {} available {}",
                alloc.cpu_cores, self.cpu_cores.available
            ));
        }
        if self.memory_mb.reserve(alloc.memory_mb).is_err() {
            self.cpu_cores.release(alloc.cpu_cores);
            return Err(format!(
                "insufficient memory: requested {} available {}",
                alloc.memory_mb, self.memory_mb.available
            ));
        }
        if self.disk_mb.reserve(alloc.disk_mb).is_err() {
            self.cpu_cores.release(alloc.cpu_cores);
            self.memory_mb.release(alloc.memory_mb);
            return Err(format!(
                "insufficient disk: requested {} available {}",
                alloc.disk_mb, self.disk_mb.available
            ));
        }
        if alloc.gpu_count > 0 {
            if self.gpus.reserve(f64::from(alloc.gpu_count)).is_err() {
                self.cpu_cores.release(alloc.cpu_cores);
                self.memory_mb.release(alloc.memory_mb);
                self.disk_mb.release(alloc.disk_mb);
                return Err("insufficient gpus".to_string());
            }
        }
        Ok(())
    }

    /// Return a previous reservation in full.
    pub fn release(&mut self, alloc: &ResourceAllocation) {
        self.cpu_cores.release(alloc.cpu_cores);
        self.memory_mb.release(alloc.memory_mb);
        self.disk_mb.release(alloc.disk_mb);
        if alloc.gpu_count > 0 {
            self.gpus.release(f64::from(alloc.gpu_count));
        }
    }

    pub fn holds_invariant(&self) -> bool {
        self.cpu_cores.holds_invariant()
            && self.memory_mb.holds_invariant()
            && self.disk_mb.holds_invariant()
            && self.bandwidth_mbps.holds_invariant()
            && self.gpus.holds_invariant()
    }

    /// Highest utilization across cpu and memory, the classes auto-scaling
    /// watches.
    pub fn pressure(&self) -> f64 {
        self.cpu_cores.utilization().max(self.memory_mb.utilization())
    }
}

/// A pool of runners with shared capacity accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: String,
    pub capacity: PoolCapacity,
    /// Member runner ids.
    pub runners: Vec<String>,
    pub policies: PoolPolicies,
    pub status: PoolStatus,
}

impl ResourcePool {
    pub fn new(id: impl Into<String>, capacity: PoolCapacity) -> Self {
        Self {
            id: id.into(),
            capacity,
            runners: Vec::new(),
            policies: PoolPolicies::default(),
            status: PoolStatus::Active,
        }
    }

    pub fn with_runners(mut self, runners: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.runners = runners.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policies(mut self, policies: PoolPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Public invariant check: `reserved + available == total` per class.
    pub fn verify_invariant(&self) -> bool {
        self.capacity.holds_invariant()
    }
}
