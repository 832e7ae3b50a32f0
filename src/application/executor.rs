//! Parallel executor.
//!
//! Owns the master execution queue and walks each job through routing,
//! load balancing, scheduling, and the security pipeline before its
//! container starts. Terminal results release every held resource; failed
//! jobs retry with exponential backoff until the retry budget runs out.
//!
//! Concurrency follows the worker model: one dispatch tick task, bounded
//! by `max_concurrent`, with shutdown over a broadcast channel.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{
    AuditAction, AuditActor, AuditCategory, AuditLevel, AuditLog, AuditOutcome, AuditRecord,
    AuditResource,
};
use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{
    EdgeOptions, ExecutionPlan, ExecutionStatus, ExecutorConfig, Job, JobResult, PlanStatus,
    RunnerCandidate, SecurityReport,
};
use crate::domain::ports::ContainerEngine;
use crate::security::{SecurityEvent, SecurityOrchestrator};
use crate::services::dependency_manager::DependencyManager;
use crate::services::load_balancer::{DispatchOutcome, LoadBalancer};
use crate::services::scheduler::Scheduler;

/// Executor lifecycle events for observers.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    JobQueued { plan_id: Uuid, job_id: Uuid },
    JobStarted { plan_id: Uuid, job_id: Uuid, runner_id: String },
    JobCompleted { plan_id: Uuid, job_id: Uuid },
    JobFailed { plan_id: Uuid, job_id: Uuid, reason: String },
    JobRetried { plan_id: Uuid, job_id: Uuid, retry: u32 },
    PlanFinished { plan_id: Uuid, status: PlanStatus },
}

/// A job waiting in the master queue.
#[derive(Debug, Clone)]
struct MasterEntry {
    plan_id: Uuid,
    job_id: Uuid,
    seq: u64,
    not_before: Instant,
}

/// A job currently executing.
#[derive(Debug, Clone)]
struct RunningJob {
    plan_id: Uuid,
    runner_id: String,
    container_id: String,
    /// Whether a load-balancer concurrency slot is held.
    lb_slot: bool,
}

struct ExecutorState {
    plans: HashMap<Uuid, ExecutionPlan>,
    /// Actor that submitted each plan, for authorization checks.
    plan_actors: HashMap<Uuid, String>,
    queue: Vec<MasterEntry>,
    running: HashMap<Uuid, RunningJob>,
    /// Registered runner candidates, mirrored into the balancer.
    runners: Vec<RunnerCandidate>,
    seq: u64,
}

/// Per-job execution + security report, retrievable by job id.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub runner_id: Option<String>,
    pub security: Option<SecurityReport>,
}

/// The orchestrator core.
pub struct ParallelExecutor {
    config: ExecutorConfig,
    load_balancer: Arc<LoadBalancer>,
    scheduler: Arc<Scheduler>,
    dependencies: Arc<DependencyManager>,
    security: Arc<SecurityOrchestrator>,
    engine: Arc<dyn ContainerEngine>,
    audit: Arc<AuditLog>,
    state: Mutex<ExecutorState>,
    events_tx: broadcast::Sender<ExecutorEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ParallelExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        load_balancer: Arc<LoadBalancer>,
        scheduler: Arc<Scheduler>,
        dependencies: Arc<DependencyManager>,
        security: Arc<SecurityOrchestrator>,
        engine: Arc<dyn ContainerEngine>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            load_balancer,
            scheduler,
            dependencies,
            security,
            engine,
            audit,
            state: Mutex::new(ExecutorState {
                plans: HashMap::new(),
                plan_actors: HashMap::new(),
                queue: Vec::new(),
                running: HashMap::new(),
                runners: Vec::new(),
                seq: 0,
            }),
            events_tx,
            shutdown_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: ExecutorEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn record_audit(&self, record: AuditRecord) {
        if let Err(err) = self.audit.append(record).await {
            warn!(error = %err, "failed to append audit record");
        }
    }

    /// Register a runner with both the scheduler and the balancer.
    pub async fn register_runner(&self, pool_id: &str, candidate: RunnerCandidate) {
        self.scheduler.add_runner(pool_id, candidate.clone()).await;
        let snapshot = {
            let mut state = self.state.lock().await;
            state.runners.retain(|r| r.id != candidate.id);
            state.runners.push(candidate);
            state.runners.clone()
        };
        self.load_balancer.update_runners(snapshot).await;
    }

    /// Deregister a runner everywhere.
    pub async fn deregister_runner(&self, runner_id: &str) {
        self.scheduler.remove_runner(runner_id).await;
        let snapshot = {
            let mut state = self.state.lock().await;
            state.runners.retain(|r| r.id != runner_id);
            state.runners.clone()
        };
        self.load_balancer.update_runners(snapshot).await;
    }

    /// Submit a batch of jobs as one execution plan. The dependency graph
    /// is validated (cycles rejected) before anything enters a queue.
    pub async fn submit_plan(
        &self,
        jobs: Vec<Job>,
        edge_options: Vec<EdgeOptions>,
        actor: impl Into<String>,
    ) -> OrchestratorResult<Uuid> {
        for job in &jobs {
            job.validate().map_err(OrchestratorError::ValidationError)?;
        }

        let plan = ExecutionPlan::new(jobs.clone());
        let plan_id = plan.id;
        let summary = self
            .dependencies
            .submit(plan_id, &jobs, &edge_options)
            .await?;
        debug!(
            plan_id = %plan_id,
            nodes = summary.nodes,
            layers = summary.layers,
            "plan graph accepted"
        );

        let ready = self.dependencies.ready_jobs(plan_id).await;
        {
            let mut state = self.state.lock().await;
            state.plans.insert(plan_id, plan);
            state.plan_actors.insert(plan_id, actor.into());
            for job_id in ready {
                Self::enqueue_locked(&mut state, plan_id, job_id, Instant::now());
                self.emit(ExecutorEvent::JobQueued { plan_id, job_id });
            }
        }

        self.record_audit(
            AuditRecord::new(
                AuditCategory::Job,
                AuditAction::PlanCreated,
                AuditOutcome::Success,
                AuditActor::System,
                AuditResource::new("plan", plan_id.to_string()),
            )
            .with_details(serde_json::json!({ "jobs": summary.nodes })),
        )
        .await;
        Ok(plan_id)
    }

    fn enqueue_locked(state: &mut ExecutorState, plan_id: Uuid, job_id: Uuid, not_before: Instant) {
        let seq = state.seq;
        state.seq += 1;
        let priority = state
            .plans
            .get(&plan_id)
            .and_then(|p| p.jobs.get(&job_id))
            .map(|e| e.job.priority.rank())
            .unwrap_or(3);
        let entry = MasterEntry {
            plan_id,
            job_id,
            seq,
            not_before,
        };
        // FIFO among equal priorities, most urgent first.
        let key = (priority, seq);
        let pos = state
            .queue
            .iter()
            .position(|e| {
                let p = state
                    .plans
                    .get(&e.plan_id)
                    .and_then(|plan| plan.jobs.get(&e.job_id))
                    .map(|x| x.job.priority.rank())
                    .unwrap_or(3);
                (p, e.seq) > key
            })
            .unwrap_or(state.queue.len());
        state.queue.insert(pos, entry);
    }

    /// One dispatch tick: launch queued jobs while concurrency allows.
    pub async fn tick(&self) {
        loop {
            let entry = {
                let mut state = self.state.lock().await;
                if state.running.len() >= self.config.max_concurrent {
                    return;
                }
                let now = Instant::now();
                let Some(pos) = state.queue.iter().position(|e| e.not_before <= now) else {
                    return;
                };
                state.queue.remove(pos)
            };
            self.launch(entry).await;
        }
    }

    /// Walk one job through the pipeline. Failures along the way either
    /// retry with backoff or fail the job terminally.
    async fn launch(&self, entry: MasterEntry) {
        let MasterEntry { plan_id, job_id, .. } = entry;
        let (job, actor) = {
            let mut state = self.state.lock().await;
            let Some(plan) = state.plans.get_mut(&plan_id) else {
                return;
            };
            let Some(exec) = plan.jobs.get_mut(&job_id) else {
                return;
            };
            if exec.status != ExecutionStatus::Pending
                && exec.status != ExecutionStatus::Retrying
            {
                return;
            }
            exec.record_attempt();
            let _ = exec.transition_to(ExecutionStatus::Routing);
            let actor = state
                .plan_actors
                .get(&plan_id)
                .cloned()
                .unwrap_or_else(|| "system".to_string());
            (
                state.plans[&plan_id].jobs[&job_id].job.clone(),
                actor,
            )
        };

        match self.run_pipeline(plan_id, &job, &actor).await {
            Ok(()) => {}
            Err(err) => {
                self.handle_launch_failure(plan_id, job_id, err).await;
            }
        }
    }

    /// Routing, balancing, scheduling, security, container start.
    async fn run_pipeline(
        &self,
        plan_id: Uuid,
        job: &Job,
        actor: &str,
    ) -> OrchestratorResult<()> {
        let job_id = job.id;

        // Load balancing: admission plus router delegation.
        let routing = if self.config.load_balancing_enabled {
            let submission = self.load_balancer.submit(job.clone(), None).await;
            if !submission.accepted {
                let cause = submission
                    .cause
                    .unwrap_or(crate::services::load_balancer::RejectCause::QueueFull);
                self.record_audit(
                    AuditRecord::new(
                        AuditCategory::Scheduler,
                        AuditAction::SubmissionRejected,
                        AuditOutcome::Failure,
                        AuditActor::System,
                        AuditResource::job(job_id),
                    )
                    .with_level(AuditLevel::Warning)
                    .with_details(serde_json::json!({ "cause": cause.as_str() })),
                )
                .await;
                return Err(match cause {
                    crate::services::load_balancer::RejectCause::Throttled => {
                        OrchestratorError::Throttled(job.throttle_key())
                    }
                    crate::services::load_balancer::RejectCause::CircuitOpen => {
                        OrchestratorError::CircuitOpen("all runners".to_string())
                    }
                    crate::services::load_balancer::RejectCause::QueueFull => {
                        OrchestratorError::QueueFull("load balancer".to_string())
                    }
                });
            }
            self.transition(plan_id, job_id, ExecutionStatus::Queued).await;

            match self.load_balancer.dispatch_next().await {
                DispatchOutcome::Dispatched { routing, .. } => Some(routing),
                DispatchOutcome::Requeued { .. } | DispatchOutcome::Idle => {
                    // The executor owns the retry; pull the balancer's copy
                    // so it cannot surface twice.
                    self.load_balancer.withdraw(job_id).await;
                    return Err(OrchestratorError::NoEligibleRunner(job_id));
                }
                DispatchOutcome::Failed { error, .. } => return Err(error),
            }
        } else {
            self.transition(plan_id, job_id, ExecutionStatus::Queued).await;
            None
        };
        // The runner holding the balancer slot, for surrender on failure.
        let lb_runner = routing.as_ref().map(|r| r.runner_id.clone());
        let lb_runner_held = lb_runner.is_some();

        // Resource-aware scheduling locks the runner.
        let (runner_id, scheduled) = if self.config.resource_aware {
            let outcome = match self.scheduler.schedule(job).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Some(runner) = &lb_runner {
                        self.load_balancer.complete(runner, false).await;
                    }
                    return Err(err);
                }
            };
            if let Some(victim) = outcome.preempted {
                self.record_audit(
                    AuditRecord::new(
                        AuditCategory::Scheduler,
                        AuditAction::JobPreempted,
                        AuditOutcome::Success,
                        AuditActor::System,
                        AuditResource::job(victim),
                    )
                    .with_level(AuditLevel::Warning),
                )
                .await;
                self.cancel_job(victim).await;
            }
            (outcome.scheduled.runner_id.clone(), Some(outcome.scheduled))
        } else {
            let runner = routing
                .as_ref()
                .map(|r| r.runner_id.clone())
                .ok_or(OrchestratorError::NoEligibleRunner(job_id))?;
            (runner, None)
        };
        self.transition(plan_id, job_id, ExecutionStatus::Scheduled).await;
        {
            let mut state = self.state.lock().await;
            if let Some(exec) = state
                .plans
                .get_mut(&plan_id)
                .and_then(|p| p.jobs.get_mut(&job_id))
            {
                exec.record_attempt_runner(&runner_id);
                exec.pool_id = scheduled.as_ref().map(|s| s.pool_id.clone());
                exec.allocation = scheduled.as_ref().map(|s| s.allocation);
            }
        }
        self.record_audit(
            AuditRecord::new(
                AuditCategory::Scheduler,
                AuditAction::JobScheduled,
                AuditOutcome::Success,
                AuditActor::System,
                AuditResource::job(job_id),
            )
            .with_details(serde_json::json!({ "runner": runner_id })),
        )
        .await;

        // Security context, then container start.
        let surrender = |runner: String| async move {
            self.scheduler.release(job_id).await;
            if lb_runner_held {
                self.load_balancer.complete(&runner, false).await;
            }
        };
        let open = match self.security.open(job, actor).await {
            Ok(open) => open,
            Err(err) => {
                surrender(runner_id.clone()).await;
                return Err(err);
            }
        };

        let container_id = match self.start_container(open.container_spec).await {
            Ok(id) => id,
            Err(err) => {
                self.security.close(job_id).await;
                surrender(runner_id.clone()).await;
                return Err(err);
            }
        };
        if let Err(err) = self.security.begin_monitoring(job_id, &container_id).await {
            let _ = self.engine.remove(&container_id, true).await;
            self.security.close(job_id).await;
            surrender(runner_id.clone()).await;
            return Err(err);
        }

        self.dependencies.mark_running(plan_id, job_id).await;
        self.transition(plan_id, job_id, ExecutionStatus::Running).await;
        {
            let mut state = self.state.lock().await;
            state.running.insert(
                job_id,
                RunningJob {
                    plan_id,
                    runner_id: runner_id.clone(),
                    container_id,
                    lb_slot: lb_runner_held,
                },
            );
        }
        self.record_audit(
            AuditRecord::new(
                AuditCategory::Job,
                AuditAction::JobStarted,
                AuditOutcome::Success,
                AuditActor::System,
                AuditResource::job(job_id),
            )
            .with_details(serde_json::json!({ "runner": runner_id })),
        )
        .await;
        self.emit(ExecutorEvent::JobStarted {
            plan_id,
            job_id,
            runner_id,
        });
        Ok(())
    }

    async fn start_container(&self, spec: crate::domain::ports::ContainerSpec) -> OrchestratorResult<String> {
        let container_id = self
            .engine
            .create(spec)
            .await
            .map_err(|e| OrchestratorError::ContainerEngineError(e.to_string()))?;
        self.engine
            .start(&container_id)
            .await
            .map_err(|e| OrchestratorError::ContainerEngineError(e.to_string()))?;
        Ok(container_id)
    }

    async fn transition(&self, plan_id: Uuid, job_id: Uuid, status: ExecutionStatus) {
        let mut state = self.state.lock().await;
        if let Some(exec) = state
            .plans
            .get_mut(&plan_id)
            .and_then(|p| p.jobs.get_mut(&job_id))
        {
            if let Err(err) = exec.transition_to(status) {
                debug!(job_id = %job_id, error = %err, "transition skipped");
            }
        }
    }

    /// A launch failure either schedules a retry with exponential backoff
    /// or fails the job terminally (and propagates through the graph).
    async fn handle_launch_failure(&self, plan_id: Uuid, job_id: Uuid, err: OrchestratorError) {
        let retryable = err.is_retryable();
        let (retry_count, max_reached) = {
            let state = self.state.lock().await;
            let retry_count = state
                .plans
                .get(&plan_id)
                .and_then(|p| p.jobs.get(&job_id))
                .map_or(0, crate::domain::models::plan::ExecutionJob::retry_count);
            (retry_count, retry_count >= self.config.max_retries)
        };
        {
            let mut state = self.state.lock().await;
            if let Some(exec) = state
                .plans
                .get_mut(&plan_id)
                .and_then(|p| p.jobs.get_mut(&job_id))
            {
                exec.record_attempt_error(err.classify(), err.to_string());
            }
        }

        if retryable && !max_reached {
            let retry = retry_count + 1;
            let backoff = Duration::from_millis(
                (self.config.retry_delay_ms as f64
                    * self.config.retry_multiplier.powi(retry as i32 - 1)) as u64,
            );
            self.transition(plan_id, job_id, ExecutionStatus::Retrying).await;
            {
                let mut state = self.state.lock().await;
                Self::enqueue_locked(&mut state, plan_id, job_id, Instant::now() + backoff);
            }
            self.record_audit(
                AuditRecord::new(
                    AuditCategory::Job,
                    AuditAction::JobRetried,
                    AuditOutcome::Failure,
                    AuditActor::System,
                    AuditResource::job(job_id),
                )
                .with_level(AuditLevel::Warning)
                .with_details(serde_json::json!({
                    "retry": retry,
                    "backoff_ms": backoff.as_millis() as u64,
                    "error": err.to_string(),
                })),
            )
            .await;
            self.emit(ExecutorEvent::JobRetried {
                plan_id,
                job_id,
                retry,
            });
            return;
        }

        self.fail_job(plan_id, job_id, err.to_string()).await;
    }

    async fn fail_job(&self, plan_id: Uuid, job_id: Uuid, reason: String) {
        self.transition(plan_id, job_id, ExecutionStatus::Failed).await;
        let outcome = self
            .dependencies
            .record_result(plan_id, job_id, JobResult::failed(1))
            .await;
        self.apply_propagation(plan_id, &outcome).await;

        self.record_audit(
            AuditRecord::new(
                AuditCategory::Job,
                AuditAction::JobFailed,
                AuditOutcome::Failure,
                AuditActor::System,
                AuditResource::job(job_id),
            )
            .with_level(AuditLevel::Error)
            .with_details(serde_json::json!({ "reason": reason })),
        )
        .await;
        self.emit(ExecutorEvent::JobFailed {
            plan_id,
            job_id,
            reason,
        });
        self.refresh_plan(plan_id).await;
    }

    /// Mirror graph propagation onto plan job statuses and enqueue any
    /// newly unblocked work.
    async fn apply_propagation(
        &self,
        plan_id: Uuid,
        outcome: &crate::services::dependency_manager::ResultOutcome,
    ) {
        let mut state = self.state.lock().await;
        for job_id in &outcome.propagation.failed {
            if let Some(exec) = state
                .plans
                .get_mut(&plan_id)
                .and_then(|p| p.jobs.get_mut(job_id))
            {
                if !exec.status.is_terminal() {
                    let _ = exec.transition_to(ExecutionStatus::Failed);
                }
            }
            state.queue.retain(|e| &e.job_id != job_id);
        }
        for job_id in &outcome.propagation.skipped {
            if let Some(exec) = state
                .plans
                .get_mut(&plan_id)
                .and_then(|p| p.jobs.get_mut(job_id))
            {
                if !exec.status.is_terminal() {
                    let _ = exec.transition_to(ExecutionStatus::Cancelled);
                }
            }
            state.queue.retain(|e| &e.job_id != job_id);
        }
        for job_id in &outcome.newly_ready {
            Self::enqueue_locked(&mut state, plan_id, *job_id, Instant::now());
        }
    }

    /// Report a terminal container result for a running job. Tears down
    /// the container, closes the security context, releases resources, and
    /// drives retries and dependents.
    pub async fn report_result(&self, job_id: Uuid, result: JobResult) {
        let Some(running) = self.state.lock().await.running.remove(&job_id) else {
            // Completing an already completed job is a no-op.
            return;
        };
        let RunningJob {
            plan_id,
            runner_id,
            container_id,
            lb_slot,
        } = running;

        let _ = self.engine.stop(&container_id, self.config.grace_period_secs).await;
        let _ = self.engine.remove(&container_id, true).await;
        self.security.close(job_id).await;
        self.scheduler.release(job_id).await;
        if lb_slot {
            self.load_balancer.complete(&runner_id, result.success).await;
        }

        if result.success {
            self.transition(plan_id, job_id, ExecutionStatus::Completed).await;
            let outcome = self.dependencies.record_result(plan_id, job_id, result).await;
            self.apply_propagation(plan_id, &outcome).await;
            self.record_audit(
                AuditRecord::new(
                    AuditCategory::Job,
                    AuditAction::JobCompleted,
                    AuditOutcome::Success,
                    AuditActor::System,
                    AuditResource::job(job_id),
                ),
            )
            .await;
            self.emit(ExecutorEvent::JobCompleted { plan_id, job_id });
            self.refresh_plan(plan_id).await;
        } else {
            // A failed container run may retry before the graph hears
            // about the failure.
            let retry_count = {
                let state = self.state.lock().await;
                state
                    .plans
                    .get(&plan_id)
                    .and_then(|p| p.jobs.get(&job_id))
                    .map_or(0, crate::domain::models::plan::ExecutionJob::retry_count)
            };
            if retry_count < self.config.max_retries {
                let retry = retry_count + 1;
                let backoff = Duration::from_millis(
                    (self.config.retry_delay_ms as f64
                        * self.config.retry_multiplier.powi(retry as i32 - 1))
                        as u64,
                );
                self.transition(plan_id, job_id, ExecutionStatus::Retrying).await;
                let mut state = self.state.lock().await;
                Self::enqueue_locked(&mut state, plan_id, job_id, Instant::now() + backoff);
                drop(state);
                self.emit(ExecutorEvent::JobRetried {
                    plan_id,
                    job_id,
                    retry,
                });
            } else {
                self.fail_job(plan_id, job_id, format!("exit code {}", result.exit_code))
                    .await;
            }
        }
    }

    /// Cancel one running or queued job (preemption victims, threat
    /// terminations).
    pub async fn cancel_job(&self, job_id: Uuid) {
        let running = {
            let mut state = self.state.lock().await;
            state.queue.retain(|e| e.job_id != job_id);
            state.running.remove(&job_id)
        };
        let plan_id = if let Some(running) = running {
            let _ = self
                .engine
                .stop(&running.container_id, self.config.grace_period_secs)
                .await;
            let _ = self.engine.remove(&running.container_id, true).await;
            self.security.close(job_id).await;
            self.scheduler.release(job_id).await;
            if running.lb_slot {
                self.load_balancer.complete(&running.runner_id, false).await;
            }
            Some(running.plan_id)
        } else {
            let state = self.state.lock().await;
            state
                .plans
                .iter()
                .find(|(_, plan)| plan.jobs.contains_key(&job_id))
                .map(|(id, _)| *id)
        };

        if let Some(plan_id) = plan_id {
            self.transition(plan_id, job_id, ExecutionStatus::Cancelled).await;
            self.dependencies.mark_cancelled(plan_id, job_id).await;
            self.record_audit(
                AuditRecord::new(
                    AuditCategory::Job,
                    AuditAction::JobCancelled,
                    AuditOutcome::Success,
                    AuditActor::System,
                    AuditResource::job(job_id),
                ),
            )
            .await;
            self.refresh_plan(plan_id).await;
        }
    }

    /// Cancel a whole plan: queued jobs leave the queue, active jobs are
    /// stopped with the grace period and their contexts closed.
    pub async fn cancel_plan(&self, plan_id: Uuid) {
        let active: Vec<Uuid> = {
            let mut state = self.state.lock().await;
            state.queue.retain(|e| e.plan_id != plan_id);
            let Some(plan) = state.plans.get_mut(&plan_id) else {
                return;
            };
            plan.cancel()
        };
        futures::future::join_all(active.into_iter().map(|job_id| self.cancel_job(job_id))).await;
        self.record_audit(
            AuditRecord::new(
                AuditCategory::Job,
                AuditAction::PlanCancelled,
                AuditOutcome::Success,
                AuditActor::System,
                AuditResource::new("plan", plan_id.to_string()),
            ),
        )
        .await;
        self.emit(ExecutorEvent::PlanFinished {
            plan_id,
            status: PlanStatus::Cancelled,
        });
    }

    async fn refresh_plan(&self, plan_id: Uuid) {
        let status = {
            let mut state = self.state.lock().await;
            let Some(plan) = state.plans.get_mut(&plan_id) else {
                return;
            };
            let before = plan.status;
            let after = plan.refresh_status();
            (before != after && after.is_terminal()).then_some(after)
        };
        if let Some(status) = status {
            self.record_audit(
                AuditRecord::new(
                    AuditCategory::Job,
                    AuditAction::PlanCompleted,
                    if status == PlanStatus::Completed {
                        AuditOutcome::Success
                    } else {
                        AuditOutcome::Failure
                    },
                    AuditActor::System,
                    AuditResource::new("plan", plan_id.to_string()),
                ),
            )
            .await;
            self.emit(ExecutorEvent::PlanFinished { plan_id, status });
            info!(plan_id = %plan_id, status = status.as_str(), "plan finished");
        }
    }

    pub async fn plan_status(&self, plan_id: Uuid) -> Option<PlanStatus> {
        self.state.lock().await.plans.get(&plan_id).map(|p| p.status)
    }

    pub async fn job_status(&self, job_id: Uuid) -> Option<ExecutionStatus> {
        let state = self.state.lock().await;
        state
            .plans
            .values()
            .find_map(|p| p.jobs.get(&job_id))
            .map(|e| e.status)
    }

    /// Execution + security report for a job.
    pub async fn job_report(&self, job_id: Uuid) -> Option<JobReport> {
        let (status, attempts, runner_id) = {
            let state = self.state.lock().await;
            let exec = state.plans.values().find_map(|p| p.jobs.get(&job_id))?;
            (
                exec.status,
                exec.attempts.len() as u32,
                exec.runner_id.clone(),
            )
        };
        Some(JobReport {
            job_id,
            status,
            attempts,
            runner_id,
            security: self.security.report(job_id).await,
        })
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Spawn the dispatch tick worker. Shuts down on the broadcast signal.
    pub fn spawn_tick_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let executor = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(executor.config.tick_interval_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => executor.tick().await,
                    _ = shutdown.recv() => {
                        info!("executor tick worker shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// Spawn the worker mirroring security terminations into job results.
    pub fn spawn_security_event_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let executor = self.clone();
        let mut events = self.security.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SecurityEvent::JobTerminated { job_id }) => {
                            executor.report_result(job_id, JobResult::failed(137)).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "security event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.recv() => return,
                }
            }
        })
    }

    /// Spawn the dependency-timeout sweeper.
    pub fn spawn_timeout_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let executor = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let escalations = executor.dependencies.check_timeouts(Utc::now()).await;
                        for escalation in escalations {
                            executor.record_audit(
                                AuditRecord::new(
                                    AuditCategory::Scheduler,
                                    AuditAction::JobFailed,
                                    AuditOutcome::Failure,
                                    AuditActor::System,
                                    AuditResource::job(escalation.target),
                                )
                                .with_level(AuditLevel::Warning)
                                .with_details(serde_json::json!({
                                    "dependency_timeout": true,
                                    "source": escalation.source,
                                    "action": escalation.action,
                                })),
                            )
                            .await;
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
        })
    }

    /// Signal every worker to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
