//! Webhook event domain model.
//!
//! The HTTP server hands us verified `(event, payload)` pairs; this module
//! owns the closed set of accepted event kinds and the enqueue-priority map.

use serde::{Deserialize, Serialize};

use super::job::JobPriority;

/// Event kinds accepted from the webhook ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    WorkflowJob,
    WorkflowRun,
    CheckRun,
    CheckSuite,
    Push,
    PullRequest,
    Repository,
    Organization,
}

impl WebhookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowJob => "workflow_job",
            Self::WorkflowRun => "workflow_run",
            Self::CheckRun => "check_run",
            Self::CheckSuite => "check_suite",
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::Repository => "repository",
            Self::Organization => "organization",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "workflow_job" => Some(Self::WorkflowJob),
            "workflow_run" => Some(Self::WorkflowRun),
            "check_run" => Some(Self::CheckRun),
            "check_suite" => Some(Self::CheckSuite),
            "push" => Some(Self::Push),
            "pull_request" => Some(Self::PullRequest),
            "repository" => Some(Self::Repository),
            "organization" => Some(Self::Organization),
            _ => None,
        }
    }

    /// Priority at which events of this kind are enqueued.
    pub fn enqueue_priority(&self) -> JobPriority {
        match self {
            Self::WorkflowJob => JobPriority::Critical,
            Self::WorkflowRun | Self::CheckRun => JobPriority::High,
            Self::Repository | Self::Organization => JobPriority::Low,
            Self::CheckSuite | Self::Push | Self::PullRequest => JobPriority::Normal,
        }
    }
}

/// Summary of a parsed webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub kind: WebhookEventKind,
    /// `owner/name` of the repository the event concerns.
    pub repository: String,
    /// Workflow name, when the payload carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Runner labels requested by a workflow job payload.
    #[serde(default)]
    pub labels: Vec<String>,
    /// GitHub's delivery identifier, kept for audit correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    /// Raw payload for downstream consumers.
    pub payload: serde_json::Value,
}

impl WebhookEvent {
    pub fn priority(&self) -> JobPriority {
        self.kind.enqueue_priority()
    }

    /// Build a job submission from a `workflow_job` event. Other event
    /// kinds do not describe runnable jobs.
    pub fn to_job(&self) -> Option<super::job::Job> {
        if self.kind != WebhookEventKind::WorkflowJob {
            return None;
        }
        let workflow = self.workflow.clone().unwrap_or_else(|| "default".to_string());
        let mut job = super::job::Job::new(self.repository.clone(), workflow)
            .with_priority(self.priority());
        job.labels = self.labels.clone();
        Some(job)
    }
}
