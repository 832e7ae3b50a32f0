//! Resource quotas.
//!
//! Tracks resource usage per repository and organization, applies
//! scope-level overrides, and bounds total allocation by cluster capacity
//! times the configured overcommit ratio. Releases are idempotent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{Job, ResourceAllocation};

/// Limits applicable to one scope (repository or organization).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_cpu_cores: f64,
    pub max_memory_mb: f64,
    pub max_concurrent_jobs: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_cpu_cores: 32.0,
            max_memory_mb: 65_536.0,
            max_concurrent_jobs: 20,
        }
    }
}

/// Current usage within a scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeUsage {
    pub cpu_cores: f64,
    pub memory_mb: f64,
    pub jobs: u32,
}

impl ScopeUsage {
    fn add(&mut self, alloc: &ResourceAllocation) {
        self.cpu_cores += alloc.cpu_cores;
        self.memory_mb += alloc.memory_mb;
        self.jobs += 1;
    }

    fn sub(&mut self, alloc: &ResourceAllocation) {
        self.cpu_cores = (self.cpu_cores - alloc.cpu_cores).max(0.0);
        self.memory_mb = (self.memory_mb - alloc.memory_mb).max(0.0);
        self.jobs = self.jobs.saturating_sub(1);
    }
}

#[derive(Debug, Clone)]
struct QuotaLease {
    repo: String,
    org: String,
    allocation: ResourceAllocation,
}

struct QuotaState {
    repo_usage: HashMap<String, ScopeUsage>,
    org_usage: HashMap<String, ScopeUsage>,
    repo_overrides: HashMap<String, QuotaLimits>,
    org_overrides: HashMap<String, QuotaLimits>,
    leases: HashMap<Uuid, QuotaLease>,
    total_used: ResourceAllocation,
}

/// Quota accounting across repositories and organizations.
pub struct ResourceQuotas {
    enabled: bool,
    /// Cluster capacity multiplier; 1.0 means no overcommit.
    overcommit_ratio: f64,
    /// Physical cluster capacity.
    cluster: ResourceAllocation,
    defaults: QuotaLimits,
    state: Mutex<QuotaState>,
}

impl ResourceQuotas {
    pub fn new(enabled: bool, cluster: ResourceAllocation, overcommit_ratio: f64) -> Self {
        Self {
            enabled,
            overcommit_ratio: overcommit_ratio.max(1.0),
            cluster,
            defaults: QuotaLimits::default(),
            state: Mutex::new(QuotaState {
                repo_usage: HashMap::new(),
                org_usage: HashMap::new(),
                repo_overrides: HashMap::new(),
                org_overrides: HashMap::new(),
                leases: HashMap::new(),
                total_used: ResourceAllocation::default(),
            }),
        }
    }

    pub fn with_defaults(mut self, defaults: QuotaLimits) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn set_repo_override(&self, repo: impl Into<String>, limits: QuotaLimits) {
        self.state
            .lock()
            .await
            .repo_overrides
            .insert(repo.into(), limits);
    }

    pub async fn set_org_override(&self, org: impl Into<String>, limits: QuotaLimits) {
        self.state
            .lock()
            .await
            .org_overrides
            .insert(org.into(), limits);
    }

    fn org_of(repo: &str) -> String {
        repo.split('/').next().unwrap_or(repo).to_string()
    }

    /// Allocate quota for a job. Checks, in order: repository limits,
    /// organization limits, overcommitted cluster capacity.
    pub async fn allocate(&self, job: &Job) -> OrchestratorResult<ResourceAllocation> {
        let alloc = ResourceAllocation {
            cpu_cores: job.requirements.cpu.preferred,
            memory_mb: job.requirements.memory_mb.preferred,
            disk_mb: job.requirements.disk_mb.preferred,
            gpu_count: job.requirements.gpu.as_ref().map_or(0, |g| g.count),
        };
        if !self.enabled {
            return Ok(alloc);
        }

        let org = Self::org_of(&job.repository);
        let mut state = self.state.lock().await;
        if state.leases.contains_key(&job.id) {
            // A second allocation for the same job reuses the lease.
            return Ok(state.leases[&job.id].allocation);
        }

        let repo_limits = state
            .repo_overrides
            .get(&job.repository)
            .copied()
            .unwrap_or(self.defaults);
        let repo_usage = state
            .repo_usage
            .get(&job.repository)
            .copied()
            .unwrap_or_default();
        Self::check_scope(&job.repository, &repo_usage, &repo_limits, &alloc)?;

        let org_limits = state.org_overrides.get(&org).copied().unwrap_or(QuotaLimits {
            // Org defaults are four repos' worth unless overridden.
            max_cpu_cores: self.defaults.max_cpu_cores * 4.0,
            max_memory_mb: self.defaults.max_memory_mb * 4.0,
            max_concurrent_jobs: self.defaults.max_concurrent_jobs * 4,
        });
        let org_usage = state.org_usage.get(&org).copied().unwrap_or_default();
        Self::check_scope(&org, &org_usage, &org_limits, &alloc)?;

        let cpu_ceiling = self.cluster.cpu_cores * self.overcommit_ratio;
        let mem_ceiling = self.cluster.memory_mb * self.overcommit_ratio;
        if state.total_used.cpu_cores + alloc.cpu_cores > cpu_ceiling
            || state.total_used.memory_mb + alloc.memory_mb > mem_ceiling
        {
            return Err(OrchestratorError::QuotaViolation {
                scope: "cluster".to_string(),
                reason: format!(
                    "cluster capacity exhausted (overcommit x{:.1})",
                    self.overcommit_ratio
                ),
            });
        }

        state.repo_usage.entry(job.repository.clone()).or_default().add(&alloc);
        state.org_usage.entry(org.clone()).or_default().add(&alloc);
        state.total_used.cpu_cores += alloc.cpu_cores;
        state.total_used.memory_mb += alloc.memory_mb;
        state.leases.insert(
            job.id,
            QuotaLease {
                repo: job.repository.clone(),
                org,
                allocation: alloc,
            },
        );
        debug!(job_id = %job.id, repo = %job.repository, "quota allocated");
        Ok(alloc)
    }

    fn check_scope(
        scope: &str,
        usage: &ScopeUsage,
        limits: &QuotaLimits,
        alloc: &ResourceAllocation,
    ) -> OrchestratorResult<()> {
        if usage.cpu_cores + alloc.cpu_cores > limits.max_cpu_cores {
            return Err(OrchestratorError::QuotaViolation {
                scope: scope.to_string(),
                reason: format!(
                    "cpu quota exceeded: {:.1} + {:.1} > {:.1}",
                    usage.cpu_cores, alloc.cpu_cores, limits.max_cpu_cores
                ),
            });
        }
        if usage.memory_mb + alloc.memory_mb > limits.max_memory_mb {
            return Err(OrchestratorError::QuotaViolation {
                scope: scope.to_string(),
                reason: "memory quota exceeded".to_string(),
            });
        }
        if usage.jobs + 1 > limits.max_concurrent_jobs {
            return Err(OrchestratorError::QuotaViolation {
                scope: scope.to_string(),
                reason: "concurrent job quota exceeded".to_string(),
            });
        }
        Ok(())
    }

    /// Release a job's quota. Releasing twice is a no-op.
    pub async fn release(&self, job_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let Some(lease) = state.leases.remove(&job_id) else {
            return false;
        };
        if let Some(usage) = state.repo_usage.get_mut(&lease.repo) {
            usage.sub(&lease.allocation);
        }
        if let Some(usage) = state.org_usage.get_mut(&lease.org) {
            usage.sub(&lease.allocation);
        }
        state.total_used.cpu_cores =
            (state.total_used.cpu_cores - lease.allocation.cpu_cores).max(0.0);
        state.total_used.memory_mb =
            (state.total_used.memory_mb - lease.allocation.memory_mb).max(0.0);
        debug!(job_id = %job_id, "quota released");
        true
    }

    pub async fn usage(&self, repo: &str) -> ScopeUsage {
        self.state
            .lock()
            .await
            .repo_usage
            .get(repo)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Requirement;

    fn cluster() -> ResourceAllocation {
        ResourceAllocation::new(64.0, 131_072.0, 1_000_000.0)
    }

    fn job_asking(repo: &str, cpu: f64, memory_mb: f64) -> Job {
        let mut job = Job::new(repo, "build");
        job.requirements.cpu = Requirement::exact(cpu);
        job.requirements.memory_mb = Requirement::exact(memory_mb);
        job
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let quotas = ResourceQuotas::new(true, cluster(), 1.0);
        let job = job_asking("acme/web", 2.0, 4096.0);

        let alloc = quotas.allocate(&job).await.unwrap();
        assert!((alloc.cpu_cores - 2.0).abs() < 1e-9);

        let usage = quotas.usage("acme/web").await;
        assert!((usage.cpu_cores - 2.0).abs() < 1e-9);
        assert_eq!(usage.jobs, 1);

        assert!(quotas.release(job.id).await);
        let usage = quotas.usage("acme/web").await;
        assert_eq!(usage.jobs, 0);

        // Second release is a no-op.
        assert!(!quotas.release(job.id).await);
    }

    #[tokio::test]
    async fn test_repo_override_enforced() {
        let quotas = ResourceQuotas::new(true, cluster(), 1.0);
        quotas
            .set_repo_override(
                "acme/web",
                QuotaLimits {
                    max_cpu_cores: 2.0,
                    max_memory_mb: 4096.0,
                    max_concurrent_jobs: 10,
                },
            )
            .await;

        let first = job_asking("acme/web", 2.0, 2048.0);
        quotas.allocate(&first).await.unwrap();

        let second = job_asking("acme/web", 1.0, 1024.0);
        let err = quotas.allocate(&second).await.unwrap_err();
        match err {
            OrchestratorError::QuotaViolation { scope, .. } => assert_eq!(scope, "acme/web"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_org_limits_span_repos() {
        let quotas = ResourceQuotas::new(true, cluster(), 1.0);
        quotas
            .set_org_override(
                "acme",
                QuotaLimits {
                    max_cpu_cores: 3.0,
                    max_memory_mb: 65_536.0,
                    max_concurrent_jobs: 100,
                },
            )
            .await;

        quotas
            .allocate(&job_asking("acme/web", 2.0, 1024.0))
            .await
            .unwrap();
        let err = quotas
            .allocate(&job_asking("acme/api", 2.0, 1024.0))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::QuotaViolation { scope, .. } => assert_eq!(scope, "acme"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overcommit_ceiling() {
        let small = ResourceAllocation::new(4.0, 8192.0, 100_000.0);
        let quotas = ResourceQuotas::new(true, small, 1.5);

        // 1.5x overcommit on 4 cores allows 6 cores of allocations.
        quotas
            .allocate(&job_asking("a/1", 3.0, 1024.0))
            .await
            .unwrap();
        quotas
            .allocate(&job_asking("b/2", 3.0, 1024.0))
            .await
            .unwrap();
        let err = quotas
            .allocate(&job_asking("c/3", 1.0, 1024.0))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::QuotaViolation { scope, .. } => assert_eq!(scope, "cluster"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_always_allocates() {
        let quotas = ResourceQuotas::new(false, ResourceAllocation::default(), 1.0);
        let job = job_asking("acme/web", 99.0, 999_999.0);
        assert!(quotas.allocate(&job).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_allocate_reuses_lease() {
        let quotas = ResourceQuotas::new(true, cluster(), 1.0);
        let job = job_asking("acme/web", 2.0, 1024.0);
        quotas.allocate(&job).await.unwrap();
        quotas.allocate(&job).await.unwrap();
        // Usage counted once.
        assert_eq!(quotas.usage("acme/web").await.jobs, 1);
    }
}
