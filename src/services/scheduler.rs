//! Resource scheduler.
//!
//! Owns the resource pools. For each job it picks a pool and a runner
//! inside it under the configured policy, then reserves capacity on both.
//! Reservations and releases are atomic with respect to other scheduler
//! passes; the pool counter invariant `reserved + available == total` is
//! maintained by construction.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{
    Job, JobPriority, PoolCapacity, PoolStatus, PreemptionStrategy, ResourceAllocation,
    ResourcePool, RunnerCandidate, SchedulerConfig, SchedulingAlgorithm,
};

/// A reservation binding a job to a pool and runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: Uuid,
    pub pool_id: String,
    pub runner_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub est_start: DateTime<Utc>,
    pub est_end: DateTime<Utc>,
    pub allocation: ResourceAllocation,
    pub priority: JobPriority,
    pub preemptible: bool,
}

/// Result of a successful scheduling call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleOutcome {
    pub scheduled: ScheduledJob,
    /// Job evicted to make room, if preemption fired.
    pub preempted: Option<Uuid>,
}

/// Scaling decision emitted by an auto-scaling evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDecision {
    /// Add this many runners to the pool.
    Up { pool_id: String, count: u32 },
    /// Remove these idle runners from the pool.
    Down { pool_id: String, runner_ids: Vec<String> },
}

/// Runner bookkeeping inside the scheduler.
#[derive(Debug, Clone)]
struct SchedulerRunner {
    candidate: RunnerCandidate,
    pool_id: String,
    /// Per-runner counters mirroring the pool's classes.
    capacity: PoolCapacity,
    active_jobs: u32,
}

struct SchedulerState {
    pools: HashMap<String, ResourcePool>,
    /// Pool insertion order, for FIFO pool selection.
    pool_order: Vec<String>,
    runners: HashMap<String, SchedulerRunner>,
    scheduled: HashMap<Uuid, ScheduledJob>,
    /// Per-pool (last scale up, last scale down).
    scale_marks: HashMap<String, (Option<Instant>, Option<Instant>)>,
}

/// Picks (pool, runner) and reserves capacity.
pub struct Scheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState {
                pools: HashMap::new(),
                pool_order: Vec::new(),
                runners: HashMap::new(),
                scheduled: HashMap::new(),
                scale_marks: HashMap::new(),
            }),
        }
    }

    pub async fn add_pool(&self, pool: ResourcePool) {
        let mut state = self.state.lock().await;
        if !state.pools.contains_key(&pool.id) {
            state.pool_order.push(pool.id.clone());
        }
        state.pools.insert(pool.id.clone(), pool);
    }

    /// Register a runner into a pool. The runner's declared capacity seeds
    /// its own counters.
    pub async fn add_runner(&self, pool_id: &str, candidate: RunnerCandidate) {
        let mut state = self.state.lock().await;
        let capacity = PoolCapacity::new(
            candidate.capacity.cpu_cores,
            candidate.capacity.memory_mb,
            candidate.capacity.disk_mb,
        );
        if let Some(pool) = state.pools.get_mut(pool_id) {
            if !pool.runners.contains(&candidate.id) {
                pool.runners.push(candidate.id.clone());
            }
        }
        state.runners.insert(
            candidate.id.clone(),
            SchedulerRunner {
                pool_id: pool_id.to_string(),
                capacity,
                active_jobs: 0,
                candidate,
            },
        );
    }

    pub async fn remove_runner(&self, runner_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(runner) = state.runners.remove(runner_id) {
            if let Some(pool) = state.pools.get_mut(&runner.pool_id) {
                pool.runners.retain(|r| r != runner_id);
            }
        }
    }

    /// Allocation derived from a job's preferred ask.
    fn allocation_for(job: &Job) -> ResourceAllocation {
        ResourceAllocation {
            cpu_cores: job.requirements.cpu.preferred,
            memory_mb: job.requirements.memory_mb.preferred,
            disk_mb: job.requirements.disk_mb.preferred,
            gpu_count: job.requirements.gpu.as_ref().map_or(0, |g| g.count),
        }
    }

    /// Whether a pool can take this job at all.
    fn pool_eligible(pool: &ResourcePool, job: &Job, alloc: &ResourceAllocation) -> bool {
        if pool.status != PoolStatus::Active {
            return false;
        }
        if !pool.policies.admits_job_type(&job.workflow) {
            return false;
        }
        if !pool.policies.window_admits(Utc::now(), job.priority) {
            return false;
        }
        if alloc.cpu_cores > pool.policies.max_job_cpu_cores
            || alloc.memory_mb > pool.policies.max_job_memory_mb
        {
            return false;
        }
        pool.capacity.cpu_cores.available + 1e-9 >= alloc.cpu_cores
            && pool.capacity.memory_mb.available + 1e-9 >= alloc.memory_mb
            && pool.capacity.disk_mb.available + 1e-9 >= alloc.disk_mb
            && (alloc.gpu_count == 0
                || pool.capacity.gpus.available + 1e-9 >= f64::from(alloc.gpu_count))
    }

    /// Whether a runner can take this job.
    fn runner_eligible(
        runner: &SchedulerRunner,
        pool: &ResourcePool,
        job: &Job,
        alloc: &ResourceAllocation,
    ) -> bool {
        if !runner.candidate.status.is_schedulable() {
            return false;
        }
        if runner.active_jobs >= pool.policies.max_jobs_per_runner {
            return false;
        }
        if let Some(gpu) = &job.requirements.gpu {
            match &runner.candidate.capacity.gpu_type {
                Some(t) if t == &gpu.gpu_type => {}
                _ => return false,
            }
        }
        runner.capacity.cpu_cores.available + 1e-9 >= alloc.cpu_cores
            && runner.capacity.memory_mb.available + 1e-9 >= alloc.memory_mb
            && runner.capacity.disk_mb.available + 1e-9 >= alloc.disk_mb
    }

    /// Schedule a job: choose (pool, runner) under the active policy and
    /// reserve capacity on both. At most one reservation may exist per job.
    pub async fn schedule(&self, job: &Job) -> OrchestratorResult<ScheduleOutcome> {
        let mut state = self.state.lock().await;
        if state.scheduled.contains_key(&job.id) {
            return Err(OrchestratorError::AllocationRefused {
                pool: "-".to_string(),
                reason: format!("job {} is already scheduled", job.id),
            });
        }

        let alloc = Self::allocation_for(job);
        let algorithm = self.config.scheduling_algorithm;

        let pool_id = match self.pick_pool(&state, job, &alloc, algorithm) {
            Some(id) => id,
            None => {
                // Priority policy may free room by evicting a victim.
                if self.config.preemption_enabled
                    && algorithm == SchedulingAlgorithm::Priority
                {
                    return self.schedule_with_preemption(&mut state, job, alloc);
                }
                return Err(OrchestratorError::NoEligiblePool(job.id));
            }
        };

        let runner_id = match self.pick_runner(&state, &pool_id, job, &alloc, algorithm) {
            Some(id) => id,
            None => {
                if self.config.preemption_enabled
                    && job
                        .priority
                        .at_least(self.preemption_threshold(&state, &pool_id))
                {
                    return self.schedule_with_preemption(&mut state, job, alloc);
                }
                return Err(OrchestratorError::NoEligibleRunner(job.id));
            }
        };

        let scheduled = Self::reserve(&mut state, job, &pool_id, &runner_id, alloc)?;
        Ok(ScheduleOutcome {
            scheduled,
            preempted: None,
        })
    }

    fn preemption_threshold(&self, state: &SchedulerState, pool_id: &str) -> JobPriority {
        state
            .pools
            .get(pool_id)
            .map_or(JobPriority::High, |p| p.policies.preemption.priority_threshold)
    }

    /// Reserve on pool and runner; both or neither.
    fn reserve(
        state: &mut SchedulerState,
        job: &Job,
        pool_id: &str,
        runner_id: &str,
        alloc: ResourceAllocation,
    ) -> OrchestratorResult<ScheduledJob> {
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| OrchestratorError::NoEligiblePool(job.id))?;
        pool.capacity
            .reserve(&alloc)
            .map_err(|reason| OrchestratorError::AllocationRefused {
                pool: pool_id.to_string(),
                reason,
            })?;
        let preemptible = pool.policies.preemption.enabled;

        let runner = match state.runners.get_mut(runner_id) {
            Some(r) => r,
            None => {
                // Roll the pool reservation back before failing.
                if let Some(pool) = state.pools.get_mut(pool_id) {
                    pool.capacity.release(&alloc);
                }
                return Err(OrchestratorError::NoEligibleRunner(job.id));
            }
        };
        if let Err(reason) = runner.capacity.reserve(&alloc) {
            if let Some(pool) = state.pools.get_mut(pool_id) {
                pool.capacity.release(&alloc);
            }
            return Err(OrchestratorError::AllocationRefused {
                pool: pool_id.to_string(),
                reason,
            });
        }
        runner.active_jobs += 1;

        let now = Utc::now();
        let est_end = now + ChronoDuration::seconds(job.estimated_duration_secs as i64);
        let scheduled = ScheduledJob {
            job_id: job.id,
            pool_id: pool_id.to_string(),
            runner_id: runner_id.to_string(),
            scheduled_at: now,
            est_start: now,
            est_end,
            allocation: alloc,
            priority: job.priority,
            preemptible,
        };
        state.scheduled.insert(job.id, scheduled.clone());
        debug!(job_id = %job.id, pool = pool_id, runner = runner_id, "reserved resources");
        Ok(scheduled)
    }

    /// Release a reservation in full. Releasing twice is a no-op.
    pub async fn release(&self, job_id: Uuid) -> Option<ResourceAllocation> {
        let mut state = self.state.lock().await;
        let scheduled = state.scheduled.remove(&job_id)?;
        if let Some(pool) = state.pools.get_mut(&scheduled.pool_id) {
            pool.capacity.release(&scheduled.allocation);
        }
        if let Some(runner) = state.runners.get_mut(&scheduled.runner_id) {
            runner.capacity.release(&scheduled.allocation);
            runner.active_jobs = runner.active_jobs.saturating_sub(1);
        }
        debug!(job_id = %job_id, pool = %scheduled.pool_id, "released reservation");
        Some(scheduled.allocation)
    }

    /// Pool selection under the active policy.
    fn pick_pool(
        &self,
        state: &SchedulerState,
        job: &Job,
        alloc: &ResourceAllocation,
        algorithm: SchedulingAlgorithm,
    ) -> Option<String> {
        let eligible: Vec<&ResourcePool> = state
            .pool_order
            .iter()
            .filter_map(|id| state.pools.get(id))
            .filter(|p| Self::pool_eligible(p, job, alloc))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match algorithm {
            SchedulingAlgorithm::FairShare => {
                // Equal share per pool: prefer the pool with the lowest
                // usage relative to its share.
                eligible.iter().min_by(|a, b| {
                    a.capacity
                        .pressure()
                        .partial_cmp(&b.capacity.pressure())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })?
            }
            _ => eligible.first()?,
        };
        Some(chosen.id.clone())
    }

    /// Runner selection inside the chosen pool.
    fn pick_runner(
        &self,
        state: &SchedulerState,
        pool_id: &str,
        job: &Job,
        alloc: &ResourceAllocation,
        algorithm: SchedulingAlgorithm,
    ) -> Option<String> {
        let pool = state.pools.get(pool_id)?;
        let eligible: Vec<&SchedulerRunner> = pool
            .runners
            .iter()
            .filter_map(|id| state.runners.get(id))
            .filter(|r| Self::runner_eligible(r, pool, job, alloc))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match algorithm {
            SchedulingAlgorithm::DeadlineAware => {
                // A runner qualifies when its projected duration fits the
                // remaining deadline budget.
                let budget = job
                    .deadline
                    .map(|d| (d - Utc::now()).num_seconds().max(0) as f64);
                let mut best: Option<(&&SchedulerRunner, f64)> = None;
                for runner in &eligible {
                    let projected = job.estimated_duration_secs as f64
                        * (1.0 + runner.candidate.current_load)
                        / runner.candidate.benchmark_score.max(0.01);
                    let fits = budget.map_or(true, |b| projected <= b);
                    if fits && best.map_or(true, |(_, p)| projected < p) {
                        best = Some((runner, projected));
                    }
                }
                *best?.0
            }
            SchedulingAlgorithm::Backfill => {
                // Prefer a runner whose idle window fits this job before
                // its next reservation begins.
                let now = Utc::now();
                let est_end =
                    now + ChronoDuration::seconds(job.estimated_duration_secs as i64);
                let fits_window = |runner: &&&SchedulerRunner| {
                    state
                        .scheduled
                        .values()
                        .filter(|s| s.runner_id == runner.candidate.id && s.est_start > now)
                        .all(|s| est_end <= s.est_start)
                };
                *eligible.iter().find(fits_window).or_else(|| eligible.first())?
            }
            SchedulingAlgorithm::ShortestJobFirst => {
                // Place the job where its projected completion is soonest.
                // Runners whose history shows estimates drifting from
                // actuals rank later than runners that track them.
                let mut best: Option<(&&SchedulerRunner, f64)> = None;
                for runner in &eligible {
                    let projected = job.estimated_duration_secs as f64
                        * (1.0 + runner.candidate.current_load)
                        / runner.candidate.benchmark_score.max(0.01);
                    let accuracy = runner
                        .candidate
                        .history
                        .duration_accuracy()
                        .unwrap_or(0.5);
                    let adjusted = projected * (2.0 - accuracy);
                    if best.map_or(true, |(_, p)| adjusted < p) {
                        best = Some((runner, adjusted));
                    }
                }
                *best?.0
            }
            SchedulingAlgorithm::MultiObjective => {
                let mut best: Option<(&&SchedulerRunner, f64)> = None;
                for runner in &eligible {
                    let perf = (runner.candidate.benchmark_score / 2.0).clamp(0.0, 1.0);
                    let fit = Self::runner_fit(runner, alloc);
                    let reliability =
                        runner.candidate.history.success_rate().unwrap_or(0.5);
                    let load = 1.0 - runner.candidate.current_load;
                    let locality = if runner.candidate.location.region.is_empty() {
                        0.5
                    } else {
                        1.0
                    };
                    let score = 0.30 * perf
                        + 0.25 * fit
                        + 0.20 * reliability
                        + 0.15 * load
                        + 0.10 * locality;
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((runner, score));
                    }
                }
                *best?.0
            }
            // FIFO, FairShare, Priority: least-loaded eligible runner.
            _ => *eligible.iter().min_by(|a, b| {
                a.candidate
                    .current_load
                    .partial_cmp(&b.candidate.current_load)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.candidate.id.cmp(&b.candidate.id))
            })?,
        };
        Some(chosen.candidate.id.clone())
    }

    /// Fraction of a runner's free capacity the allocation would use; a
    /// snug fit scores high.
    fn runner_fit(runner: &SchedulerRunner, alloc: &ResourceAllocation) -> f64 {
        let cpu = if runner.capacity.cpu_cores.available > 0.0 {
            (alloc.cpu_cores / runner.capacity.cpu_cores.available).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mem = if runner.capacity.memory_mb.available > 0.0 {
            (alloc.memory_mb / runner.capacity.memory_mb.available).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (cpu + mem) / 2.0
    }

    /// Try to free room by evicting one running job, then schedule.
    fn schedule_with_preemption(
        &self,
        state: &mut SchedulerState,
        job: &Job,
        alloc: ResourceAllocation,
    ) -> OrchestratorResult<ScheduleOutcome> {
        // Find a pool whose preemption policy admits this job.
        let pool_id = state
            .pool_order
            .iter()
            .find(|id| {
                state.pools.get(*id).is_some_and(|p| {
                    p.status == PoolStatus::Active
                        && p.policies.preemption.enabled
                        && job.priority.at_least(p.policies.preemption.priority_threshold)
                        && p.policies.admits_job_type(&job.workflow)
                })
            })
            .cloned()
            .ok_or(OrchestratorError::NoEligiblePool(job.id))?;

        let strategy = state
            .pools
            .get(&pool_id)
            .map(|p| p.policies.preemption.strategy)
            .unwrap_or_default();

        let victim = Self::pick_victim(state, &pool_id, job, strategy)
            .ok_or_else(|| OrchestratorError::PreemptionFailed(pool_id.clone()))?;

        info!(
            victim = %victim,
            job_id = %job.id,
            pool = %pool_id,
            "preempting running job"
        );

        // Release the victim's reservation inline (same pass).
        if let Some(prev) = state.scheduled.remove(&victim) {
            if let Some(pool) = state.pools.get_mut(&prev.pool_id) {
                pool.capacity.release(&prev.allocation);
            }
            if let Some(runner) = state.runners.get_mut(&prev.runner_id) {
                runner.capacity.release(&prev.allocation);
                runner.active_jobs = runner.active_jobs.saturating_sub(1);
            }
        }

        let runner_id = self
            .pick_runner(state, &pool_id, job, &alloc, SchedulingAlgorithm::Priority)
            .ok_or_else(|| OrchestratorError::PreemptionFailed(pool_id.clone()))?;
        let scheduled = Self::reserve(state, job, &pool_id, &runner_id, alloc)?;
        Ok(ScheduleOutcome {
            scheduled,
            preempted: Some(victim),
        })
    }

    /// Choose a preemption victim among running reservations in the pool.
    fn pick_victim(
        state: &SchedulerState,
        pool_id: &str,
        incoming: &Job,
        strategy: PreemptionStrategy,
    ) -> Option<Uuid> {
        let now = Utc::now();
        let candidates: Vec<&ScheduledJob> = state
            .scheduled
            .values()
            .filter(|s| s.pool_id == pool_id && s.preemptible)
            // Never evict a job at least as urgent as the incoming one.
            .filter(|s| incoming.priority < s.priority)
            .collect();

        let victim = match strategy {
            PreemptionStrategy::LowestPriority => candidates
                .iter()
                .max_by_key(|s| (s.priority.rank(), s.scheduled_at))?,
            PreemptionStrategy::ShortestRemaining => candidates
                .iter()
                .min_by_key(|s| (s.est_end - now).num_seconds())?,
            PreemptionStrategy::LeastProgress => candidates
                .iter()
                .min_by_key(|s| (now - s.est_start).num_seconds())?,
            PreemptionStrategy::NewestJob => {
                candidates.iter().max_by_key(|s| s.scheduled_at)?
            }
        };
        Some(victim.job_id)
    }

    /// Evaluate auto-scaling for every pool. Cool-down timers suppress
    /// flapping; decisions are returned for the infrastructure layer to
    /// enact.
    pub async fn evaluate_scaling(&self) -> Vec<ScaleDecision> {
        let auto = &self.config.auto_scaling;
        if !auto.enabled {
            return Vec::new();
        }
        let now = Instant::now();
        let mut decisions = Vec::new();
        let mut state = self.state.lock().await;

        let pool_ids: Vec<String> = state.pool_order.clone();
        for pool_id in pool_ids {
            let Some(pool) = state.pools.get(&pool_id) else {
                continue;
            };
            let utilization = pool.capacity.pressure();
            let active = pool.runners.len() as u32;
            let (last_up, last_down) = state
                .scale_marks
                .get(&pool_id)
                .copied()
                .unwrap_or((None, None));

            if utilization > auto.scale_up_threshold && active < auto.max_runners {
                let cooled = last_up.map_or(true, |at| {
                    now.duration_since(at).as_secs() >= auto.scale_up_cooldown_secs
                });
                if cooled {
                    let count = auto.scale_up_steps.min(auto.max_runners - active);
                    decisions.push(ScaleDecision::Up {
                        pool_id: pool_id.clone(),
                        count,
                    });
                    state
                        .scale_marks
                        .insert(pool_id.clone(), (Some(now), last_down));
                }
            } else if utilization < auto.scale_down_threshold && active > auto.min_runners {
                let cooled = last_down.map_or(true, |at| {
                    now.duration_since(at).as_secs() >= auto.scale_down_cooldown_secs
                });
                if cooled {
                    let removable = (active - auto.min_runners).min(auto.scale_down_steps);
                    let idle: Vec<String> = pool
                        .runners
                        .iter()
                        .filter(|id| {
                            state
                                .runners
                                .get(*id)
                                .is_some_and(|r| r.active_jobs == 0)
                        })
                        .take(removable as usize)
                        .cloned()
                        .collect();
                    if !idle.is_empty() {
                        decisions.push(ScaleDecision::Down {
                            pool_id: pool_id.clone(),
                            runner_ids: idle,
                        });
                        state
                            .scale_marks
                            .insert(pool_id.clone(), (last_up, Some(now)));
                    }
                }
            }
        }
        if !decisions.is_empty() {
            info!(count = decisions.len(), "auto-scaling decisions emitted");
        }
        decisions
    }

    /// Current reservation for a job, if any.
    pub async fn reservation(&self, job_id: Uuid) -> Option<ScheduledJob> {
        self.state.lock().await.scheduled.get(&job_id).cloned()
    }

    /// Snapshot of a pool for reporting and invariant checks.
    pub async fn pool(&self, pool_id: &str) -> Option<ResourcePool> {
        self.state.lock().await.pools.get(pool_id).cloned()
    }

    /// Verify the counter invariant across every pool and runner.
    pub async fn verify_invariants(&self) -> bool {
        let state = self.state.lock().await;
        let pools_ok = state.pools.values().all(ResourcePool::verify_invariant);
        let runners_ok = state.runners.values().all(|r| r.capacity.holds_invariant());
        if !pools_ok || !runners_ok {
            warn!("resource counter invariant violated");
        }
        pools_ok && runners_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        CompletionRecord, PerformanceHistory, PoolPolicies, PreemptionPolicy, Requirement,
        SchedulingWindow,
    };

    fn sched(algorithm: SchedulingAlgorithm) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            scheduling_algorithm: algorithm,
            ..Default::default()
        })
    }

    async fn pool_with_runner(scheduler: &Scheduler, pool_id: &str, runner_id: &str) {
        let pool = ResourcePool::new(pool_id, PoolCapacity::new(16.0, 32_768.0, 500_000.0));
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner(pool_id, RunnerCandidate::new(runner_id))
            .await;
    }

    fn job_asking(cpu: f64, memory_mb: f64) -> Job {
        let mut job = Job::new("acme/web", "build");
        job.requirements.cpu = Requirement::exact(cpu);
        job.requirements.memory_mb = Requirement::exact(memory_mb);
        job.requirements.disk_mb = Requirement::exact(1024.0);
        job
    }

    #[tokio::test]
    async fn test_schedule_reserves_and_release_restores() {
        let scheduler = sched(SchedulingAlgorithm::Fifo);
        pool_with_runner(&scheduler, "default", "r1").await;

        let job = job_asking(2.0, 4096.0);
        let outcome = scheduler.schedule(&job).await.unwrap();
        assert_eq!(outcome.scheduled.runner_id, "r1");
        assert_eq!(outcome.scheduled.pool_id, "default");

        let pool = scheduler.pool("default").await.unwrap();
        assert!((pool.capacity.cpu_cores.reserved - 2.0).abs() < 1e-9);
        assert!((pool.capacity.cpu_cores.available - 14.0).abs() < 1e-9);
        assert!(scheduler.verify_invariants().await);

        scheduler.release(job.id).await.unwrap();
        let pool = scheduler.pool("default").await.unwrap();
        assert!((pool.capacity.cpu_cores.available - 16.0).abs() < 1e-9);
        assert!(scheduler.verify_invariants().await);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let scheduler = sched(SchedulingAlgorithm::Fifo);
        pool_with_runner(&scheduler, "default", "r1").await;

        let job = job_asking(1.0, 1024.0);
        scheduler.schedule(&job).await.unwrap();
        assert!(scheduler.release(job.id).await.is_some());
        assert!(scheduler.release(job.id).await.is_none());

        let pool = scheduler.pool("default").await.unwrap();
        assert!((pool.capacity.cpu_cores.available - 16.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_double_booking() {
        let scheduler = sched(SchedulingAlgorithm::Fifo);
        pool_with_runner(&scheduler, "default", "r1").await;

        let job = job_asking(1.0, 1024.0);
        scheduler.schedule(&job).await.unwrap();
        let err = scheduler.schedule(&job).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AllocationRefused { .. }));
    }

    #[tokio::test]
    async fn test_no_eligible_pool_when_drained() {
        let scheduler = sched(SchedulingAlgorithm::Fifo);
        let mut pool = ResourcePool::new("default", PoolCapacity::new(16.0, 32_768.0, 500_000.0));
        pool.status = PoolStatus::Draining;
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r1"))
            .await;

        let err = scheduler.schedule(&job_asking(1.0, 1024.0)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoEligiblePool(_)));
    }

    #[tokio::test]
    async fn test_insufficient_capacity_rejected() {
        let scheduler = sched(SchedulingAlgorithm::Fifo);
        pool_with_runner(&scheduler, "default", "r1").await;

        let err = scheduler
            .schedule(&job_asking(64.0, 1024.0))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoEligiblePool(_)));
    }

    #[tokio::test]
    async fn test_job_type_blocklist() {
        let scheduler = sched(SchedulingAlgorithm::Fifo);
        let pool = ResourcePool::new("default", PoolCapacity::new(16.0, 32_768.0, 500_000.0))
            .with_policies(PoolPolicies {
                blocked_job_types: vec!["build".to_string()],
                ..Default::default()
            });
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r1"))
            .await;

        let err = scheduler.schedule(&job_asking(1.0, 1024.0)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoEligiblePool(_)));
    }

    #[tokio::test]
    async fn test_scheduling_window_blocks_low_priority() {
        let scheduler = sched(SchedulingAlgorithm::Fifo);
        // A window that never admits anything below Critical.
        let pool = ResourcePool::new("default", PoolCapacity::new(16.0, 32_768.0, 500_000.0))
            .with_policies(PoolPolicies {
                scheduling_windows: vec![SchedulingWindow {
                    start_hour: 0,
                    end_hour: 24,
                    min_priority: JobPriority::Critical,
                }],
                ..Default::default()
            });
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r1"))
            .await;

        let err = scheduler.schedule(&job_asking(1.0, 1024.0)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoEligiblePool(_)));

        let critical = job_asking(1.0, 1024.0).with_priority(JobPriority::Critical);
        assert!(scheduler.schedule(&critical).await.is_ok());
    }

    #[tokio::test]
    async fn test_fair_share_prefers_emptier_pool() {
        let scheduler = sched(SchedulingAlgorithm::FairShare);
        pool_with_runner(&scheduler, "pool-a", "ra").await;
        pool_with_runner(&scheduler, "pool-b", "rb").await;

        // Load pool-a.
        let filler = job_asking(8.0, 16_384.0);
        let outcome = scheduler.schedule(&filler).await.unwrap();
        assert_eq!(outcome.scheduled.pool_id, "pool-a");

        // Next job lands on the emptier pool-b.
        let next = job_asking(2.0, 4096.0);
        let outcome = scheduler.schedule(&next).await.unwrap();
        assert_eq!(outcome.scheduled.pool_id, "pool-b");
    }

    #[tokio::test]
    async fn test_preemption_evicts_background_for_critical() {
        let scheduler = Scheduler::new(SchedulerConfig {
            scheduling_algorithm: SchedulingAlgorithm::Priority,
            preemption_enabled: true,
            ..Default::default()
        });
        let pool = ResourcePool::new("default", PoolCapacity::new(4.0, 8192.0, 100_000.0))
            .with_policies(PoolPolicies {
                preemption: PreemptionPolicy {
                    enabled: true,
                    priority_threshold: JobPriority::High,
                    grace_period_secs: 300,
                    strategy: PreemptionStrategy::LowestPriority,
                },
                ..Default::default()
            });
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r1"))
            .await;

        // Background job takes the whole runner.
        let background = job_asking(4.0, 8192.0).with_priority(JobPriority::Background);
        scheduler.schedule(&background).await.unwrap();

        // Critical job preempts it.
        let critical = job_asking(4.0, 8192.0).with_priority(JobPriority::Critical);
        let outcome = scheduler.schedule(&critical).await.unwrap();
        assert_eq!(outcome.preempted, Some(background.id));
        assert_eq!(outcome.scheduled.runner_id, "r1");

        // The victim's reservation is gone; invariants hold.
        assert!(scheduler.reservation(background.id).await.is_none());
        assert!(scheduler.verify_invariants().await);
    }

    #[tokio::test]
    async fn test_preemption_never_evicts_equal_or_higher() {
        let scheduler = Scheduler::new(SchedulerConfig {
            scheduling_algorithm: SchedulingAlgorithm::Priority,
            preemption_enabled: true,
            ..Default::default()
        });
        let pool = ResourcePool::new("default", PoolCapacity::new(4.0, 8192.0, 100_000.0))
            .with_policies(PoolPolicies {
                preemption: PreemptionPolicy {
                    enabled: true,
                    priority_threshold: JobPriority::High,
                    grace_period_secs: 300,
                    strategy: PreemptionStrategy::LowestPriority,
                },
                ..Default::default()
            });
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r1"))
            .await;

        let first = job_asking(4.0, 8192.0).with_priority(JobPriority::Critical);
        scheduler.schedule(&first).await.unwrap();

        let second = job_asking(4.0, 8192.0).with_priority(JobPriority::Critical);
        let err = scheduler.schedule(&second).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PreemptionFailed(_)));
    }

    #[tokio::test]
    async fn test_deadline_aware_requires_fitting_runner() {
        let scheduler = sched(SchedulingAlgorithm::DeadlineAware);
        pool_with_runner(&scheduler, "default", "r1").await;

        // Deadline far too tight for the estimated duration.
        let mut job = job_asking(1.0, 1024.0);
        job.estimated_duration_secs = 600;
        job.deadline = Some(Utc::now() + ChronoDuration::seconds(10));
        let err = scheduler.schedule(&job).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoEligibleRunner(_)));

        // A generous deadline schedules fine.
        let mut job = job_asking(1.0, 1024.0);
        job.estimated_duration_secs = 600;
        job.deadline = Some(Utc::now() + ChronoDuration::hours(2));
        assert!(scheduler.schedule(&job).await.is_ok());
    }

    #[tokio::test]
    async fn test_shortest_job_first_picks_soonest_completion() {
        let scheduler = sched(SchedulingAlgorithm::ShortestJobFirst);
        let pool = ResourcePool::new("default", PoolCapacity::new(32.0, 65_536.0, 500_000.0));
        scheduler.add_pool(pool).await;
        // Idle but slow: projected = d * 1.0 / 0.5 = 2d.
        scheduler
            .add_runner(
                "default",
                RunnerCandidate::new("idle-slow")
                    .with_load(0.0)
                    .with_benchmark_score(0.5),
            )
            .await;
        // Half loaded but fast: projected = d * 1.5 / 2.0 = 0.75d.
        scheduler
            .add_runner(
                "default",
                RunnerCandidate::new("busy-fast")
                    .with_load(0.5)
                    .with_benchmark_score(2.0),
            )
            .await;

        // Least-loaded selection would take idle-slow; shortest projected
        // completion takes busy-fast.
        let outcome = scheduler.schedule(&job_asking(1.0, 1024.0)).await.unwrap();
        assert_eq!(outcome.scheduled.runner_id, "busy-fast");
    }

    #[tokio::test]
    async fn test_shortest_job_first_penalizes_inaccurate_history() {
        let scheduler = sched(SchedulingAlgorithm::ShortestJobFirst);
        let pool = ResourcePool::new("default", PoolCapacity::new(32.0, 65_536.0, 500_000.0));
        scheduler.add_pool(pool).await;

        // Same projection on both runners, but one reliably tracks its
        // estimates and the other blows them badly.
        let mut accurate = RunnerCandidate::new("accurate");
        let mut drifting = RunnerCandidate::new("drifting");
        for _ in 0..PerformanceHistory::MIN_SAMPLES {
            accurate.history.record(CompletionRecord {
                success: true,
                predicted_duration_secs: 100,
                actual_duration_secs: 100,
                finished_at: Utc::now(),
            });
            drifting.history.record(CompletionRecord {
                success: true,
                predicted_duration_secs: 100,
                actual_duration_secs: 400,
                finished_at: Utc::now(),
            });
        }
        scheduler.add_runner("default", drifting).await;
        scheduler.add_runner("default", accurate).await;

        let outcome = scheduler.schedule(&job_asking(1.0, 1024.0)).await.unwrap();
        assert_eq!(outcome.scheduled.runner_id, "accurate");
    }

    #[tokio::test]
    async fn test_multi_objective_prefers_benchmark() {
        let scheduler = sched(SchedulingAlgorithm::MultiObjective);
        let pool = ResourcePool::new("default", PoolCapacity::new(32.0, 65_536.0, 500_000.0));
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner(
                "default",
                RunnerCandidate::new("slow").with_benchmark_score(0.5),
            )
            .await;
        scheduler
            .add_runner(
                "default",
                RunnerCandidate::new("fast").with_benchmark_score(2.0),
            )
            .await;

        let outcome = scheduler.schedule(&job_asking(1.0, 1024.0)).await.unwrap();
        assert_eq!(outcome.scheduled.runner_id, "fast");
    }

    #[tokio::test]
    async fn test_auto_scaling_up_and_cooldown() {
        let scheduler = Scheduler::new(SchedulerConfig {
            scheduling_algorithm: SchedulingAlgorithm::Fifo,
            auto_scaling: crate::domain::models::AutoScalingConfig {
                enabled: true,
                min_runners: 1,
                max_runners: 5,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.3,
                scale_up_cooldown_secs: 3600,
                scale_down_cooldown_secs: 3600,
                scale_up_steps: 2,
                scale_down_steps: 1,
            },
            ..Default::default()
        });
        let pool = ResourcePool::new("default", PoolCapacity::new(4.0, 8192.0, 100_000.0));
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r1"))
            .await;

        // Saturate the pool past the scale-up threshold.
        let job = job_asking(4.0, 8192.0);
        scheduler.schedule(&job).await.unwrap();

        let decisions = scheduler.evaluate_scaling().await;
        assert_eq!(
            decisions,
            vec![ScaleDecision::Up {
                pool_id: "default".to_string(),
                count: 2
            }]
        );

        // Cool-down suppresses an immediate repeat.
        assert!(scheduler.evaluate_scaling().await.is_empty());
    }

    #[tokio::test]
    async fn test_auto_scaling_down_removes_idle() {
        let scheduler = Scheduler::new(SchedulerConfig {
            scheduling_algorithm: SchedulingAlgorithm::Fifo,
            auto_scaling: crate::domain::models::AutoScalingConfig {
                enabled: true,
                min_runners: 1,
                max_runners: 5,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.3,
                scale_up_cooldown_secs: 0,
                scale_down_cooldown_secs: 0,
                scale_up_steps: 1,
                scale_down_steps: 1,
            },
            ..Default::default()
        });
        let pool = ResourcePool::new("default", PoolCapacity::new(16.0, 32_768.0, 500_000.0));
        scheduler.add_pool(pool).await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r1"))
            .await;
        scheduler
            .add_runner("default", RunnerCandidate::new("r2"))
            .await;

        let decisions = scheduler.evaluate_scaling().await;
        match &decisions[..] {
            [ScaleDecision::Down { pool_id, runner_ids }] => {
                assert_eq!(pool_id, "default");
                assert_eq!(runner_ids.len(), 1);
            }
            other => panic!("expected one scale-down, got {other:?}"),
        }
    }
}
