//! Execution plan domain model.
//!
//! A plan wraps a batch of jobs submitted together. Each wrapped job walks
//! a linear stage pipeline; the plan's own status is derived from its jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::job::{Job, JobResult};
use super::pool::ResourceAllocation;
use crate::domain::errors::ErrorClass;

/// Pipeline stage of a job inside a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Created,
    Routing,
    LoadBalancing,
    Scheduling,
    Executing,
    Completed,
    Failed,
}

impl ExecutionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Routing => "routing",
            Self::LoadBalancing => "load_balancing",
            Self::Scheduling => "scheduling",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Execution status of a wrapped job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Routing,
    Queued,
    Scheduled,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Routing => "routing",
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions. The pipeline is linear except for the retry loop
    /// and cancellation of a running job.
    pub fn valid_transitions(&self) -> &'static [ExecutionStatus] {
        match self {
            Self::Pending => &[Self::Routing, Self::Cancelled],
            Self::Routing => &[Self::Queued, Self::Failed, Self::Retrying, Self::Cancelled],
            Self::Queued => &[Self::Scheduled, Self::Failed, Self::Retrying, Self::Cancelled],
            Self::Scheduled => &[Self::Running, Self::Failed, Self::Retrying, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Retrying, Self::Cancelled],
            Self::Retrying => &[Self::Queued, Self::Routing, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// One execution attempt and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A job wrapped for execution within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub job: Job,
    pub stage: ExecutionStage,
    pub status: ExecutionStatus,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ResourceAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionJob {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            stage: ExecutionStage::Created,
            status: ExecutionStatus::Pending,
            attempts: Vec::new(),
            runner_id: None,
            pool_id: None,
            allocation: None,
            result: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.attempts.len().saturating_sub(1) as u32
    }

    /// Transition the execution status, updating timestamps.
    pub fn transition_to(&mut self, next: ExecutionStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "cannot transition from {} to {}",
                self.status.as_str(),
                next.as_str()
            ));
        }
        self.status = next;
        match next {
            ExecutionStatus::Running => {
                self.started_at = Some(Utc::now());
                self.stage = ExecutionStage::Executing;
            }
            ExecutionStatus::Completed => {
                self.finished_at = Some(Utc::now());
                self.stage = ExecutionStage::Completed;
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                self.finished_at = Some(Utc::now());
                self.stage = ExecutionStage::Failed;
            }
            ExecutionStatus::Routing => self.stage = ExecutionStage::Routing,
            ExecutionStatus::Queued => self.stage = ExecutionStage::LoadBalancing,
            ExecutionStatus::Scheduled => self.stage = ExecutionStage::Scheduling,
            _ => {}
        }
        Ok(())
    }

    pub fn record_attempt(&mut self) -> u32 {
        let attempt = self.attempts.len() as u32 + 1;
        self.attempts.push(AttemptRecord {
            attempt,
            started_at: Utc::now(),
            runner_id: None,
            error_class: None,
            error: None,
        });
        attempt
    }

    pub fn record_attempt_error(&mut self, class: ErrorClass, error: impl Into<String>) {
        if let Some(last) = self.attempts.last_mut() {
            last.error_class = Some(class);
            last.error = Some(error.into());
        }
    }

    pub fn record_attempt_runner(&mut self, runner_id: impl Into<String>) {
        let runner_id = runner_id.into();
        if let Some(last) = self.attempts.last_mut() {
            last.runner_id = Some(runner_id.clone());
        }
        self.runner_id = Some(runner_id);
    }
}

/// Plan-level status, derived from the contained jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A batch of jobs with shared lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub jobs: HashMap<Uuid, ExecutionJob>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionPlan {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            id: Uuid::new_v4(),
            jobs: jobs
                .into_iter()
                .map(|j| (j.id, ExecutionJob::new(j)))
                .collect(),
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Aggregate preferred resource ask across all jobs.
    pub fn aggregate_requirements(&self) -> ResourceAllocation {
        let mut total = ResourceAllocation::default();
        for exec in self.jobs.values() {
            total.cpu_cores += exec.job.requirements.cpu.preferred;
            total.memory_mb += exec.job.requirements.memory_mb.preferred;
            total.disk_mb += exec.job.requirements.disk_mb.preferred;
            if let Some(gpu) = &exec.job.requirements.gpu {
                total.gpu_count += gpu.count;
            }
        }
        total
    }

    /// Estimated wall-clock for the plan: the longest single job as a lower
    /// bound when no dependency information is attached here.
    pub fn estimated_duration_secs(&self) -> u64 {
        self.jobs
            .values()
            .map(|e| e.job.estimated_duration_secs)
            .max()
            .unwrap_or(0)
    }

    /// Derive the plan status from its jobs. A plan completes when every
    /// job completed; it fails once no unfinished job can still progress.
    pub fn refresh_status(&mut self) -> PlanStatus {
        if self.status == PlanStatus::Cancelled {
            return self.status;
        }
        let all_terminal = self.jobs.values().all(|j| j.status.is_terminal());
        let any_failed = self
            .jobs
            .values()
            .any(|j| j.status == ExecutionStatus::Failed);
        let any_cancelled = self
            .jobs
            .values()
            .any(|j| j.status == ExecutionStatus::Cancelled);
        let any_active = self.jobs.values().any(|j| !j.status.is_terminal());

        self.status = if all_terminal && any_failed {
            PlanStatus::Failed
        } else if all_terminal && any_cancelled {
            PlanStatus::Cancelled
        } else if all_terminal {
            PlanStatus::Completed
        } else if any_active && self.status == PlanStatus::Pending {
            PlanStatus::Running
        } else {
            self.status
        };
        if self.status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        self.status
    }

    /// Cancel the plan. Returns ids of jobs that were still active and now
    /// need teardown.
    pub fn cancel(&mut self) -> Vec<Uuid> {
        self.status = PlanStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        let mut active = Vec::new();
        for exec in self.jobs.values_mut() {
            if !exec.status.is_terminal() {
                let was_running = exec.status == ExecutionStatus::Running;
                // Cancellation is valid from every non-terminal state.
                let _ = exec.transition_to(ExecutionStatus::Cancelled);
                if was_running {
                    active.push(exec.job.id);
                }
            }
        }
        active
    }
}
