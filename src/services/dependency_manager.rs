//! Dependency manager.
//!
//! Owns one dependency graph per execution plan. Builds graphs from job
//! batches (rejecting cycles before anything enters a queue), gates job
//! readiness, applies the configured failure-propagation strategy, and
//! escalates dependency timeouts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{
    DependencyGraph, EdgeOptions, GraphBuildError, Job, JobResult, NodeStatus,
    PropagationOutcome, PropagationStrategy,
};

/// What to do when a dependency edge times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutEscalation {
    /// Reset the edge with a fresh deadline, up to the retry cap.
    Retry,
    /// Record and alert; the edge stays timed out.
    Notify,
    /// Treat the edge as satisfied and let the dependent proceed.
    Substitute,
    /// Cancel the dependent job outright.
    Cancel,
}

impl Default for TimeoutEscalation {
    fn default() -> Self {
        Self::Notify
    }
}

/// An escalation the manager performed, for audit and alerting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub plan_id: Uuid,
    pub source: Uuid,
    pub target: Uuid,
    pub action: TimeoutEscalation,
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct DependencyManagerConfig {
    pub default_timeout: Duration,
    pub propagation: PropagationStrategy,
    pub escalation: TimeoutEscalation,
    /// Edge timeout retries allowed under `TimeoutEscalation::Retry`.
    pub max_timeout_retries: u32,
}

impl Default for DependencyManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::hours(1),
            propagation: PropagationStrategy::default(),
            escalation: TimeoutEscalation::default(),
            max_timeout_retries: 2,
        }
    }
}

/// Summary returned after a successful graph submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub plan_id: Uuid,
    pub nodes: usize,
    pub layers: usize,
    pub critical_path: Vec<Uuid>,
    pub roots: usize,
    pub leaves: usize,
}

/// Outcome of recording a terminal job result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultOutcome {
    /// Jobs newly unblocked by this result.
    pub newly_ready: Vec<Uuid>,
    /// Propagation applied when the result was a failure.
    pub propagation: PropagationOutcome,
}

struct PlanGraphs {
    graphs: HashMap<Uuid, DependencyGraph>,
    /// Timeout retry counts per (plan, source, target).
    timeout_retries: HashMap<(Uuid, Uuid, Uuid), u32>,
}

/// Owns dependency graphs and gates job readiness.
pub struct DependencyManager {
    config: DependencyManagerConfig,
    state: Mutex<PlanGraphs>,
}

impl DependencyManager {
    pub fn new(config: DependencyManagerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PlanGraphs {
                graphs: HashMap::new(),
                timeout_retries: HashMap::new(),
            }),
        }
    }

    /// Build and register the graph for a plan. A cyclic batch fails here,
    /// before any job enters any queue.
    pub async fn submit(
        &self,
        plan_id: Uuid,
        jobs: &[Job],
        edge_options: &[EdgeOptions],
    ) -> OrchestratorResult<GraphSummary> {
        let graph = DependencyGraph::build(jobs, edge_options, self.config.default_timeout)
            .map_err(|err| match err {
                GraphBuildError::Cycle(job) => OrchestratorError::CyclicDependency(job),
                other => OrchestratorError::ValidationError(other.to_string()),
            })?;

        let summary = GraphSummary {
            plan_id,
            nodes: graph.len(),
            layers: graph.layers.len(),
            critical_path: graph
                .critical_path
                .iter()
                .map(|&ix| graph.node(ix).job_id)
                .collect(),
            roots: graph.roots.len(),
            leaves: graph.leaves.len(),
        };
        info!(
            plan_id = %plan_id,
            nodes = summary.nodes,
            layers = summary.layers,
            "dependency graph registered"
        );
        self.state.lock().await.graphs.insert(plan_id, graph);
        Ok(summary)
    }

    /// Currently ready jobs for a plan, most urgent first.
    pub async fn ready_jobs(&self, plan_id: Uuid) -> Vec<Uuid> {
        self.state
            .lock()
            .await
            .graphs
            .get(&plan_id)
            .map(DependencyGraph::ready_jobs)
            .unwrap_or_default()
    }

    pub async fn mark_running(&self, plan_id: Uuid, job_id: Uuid) {
        if let Some(graph) = self.state.lock().await.graphs.get_mut(&plan_id) {
            graph.mark_running(job_id);
        }
    }

    pub async fn mark_cancelled(&self, plan_id: Uuid, job_id: Uuid) {
        if let Some(graph) = self.state.lock().await.graphs.get_mut(&plan_id) {
            graph.mark_cancelled(job_id);
        }
    }

    /// Record a terminal result. On failure, applies the configured
    /// propagation strategy across the graph.
    pub async fn record_result(
        &self,
        plan_id: Uuid,
        job_id: Uuid,
        result: JobResult,
    ) -> ResultOutcome {
        let mut state = self.state.lock().await;
        let Some(graph) = state.graphs.get_mut(&plan_id) else {
            return ResultOutcome::default();
        };
        let newly_ready = graph.record_result(job_id, result);
        let propagation = if result.success {
            PropagationOutcome::default()
        } else {
            let outcome = graph.propagate_failure(job_id, self.config.propagation);
            if !outcome.failed.is_empty() || !outcome.skipped.is_empty() {
                debug!(
                    plan_id = %plan_id,
                    failed = outcome.failed.len(),
                    skipped = outcome.skipped.len(),
                    "propagated dependency failure"
                );
            }
            outcome
        };
        ResultOutcome {
            newly_ready,
            propagation,
        }
    }

    /// Expire overdue edges across all plans and apply the escalation
    /// policy. Returns the escalations performed.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<EscalationEvent> {
        let mut events = Vec::new();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let escalation = self.config.escalation;
        let max_retries = self.config.max_timeout_retries;
        let retry_window = self.config.default_timeout;

        let plan_ids: Vec<Uuid> = state.graphs.keys().copied().collect();
        for plan_id in plan_ids {
            let Some(graph) = state.graphs.get_mut(&plan_id) else {
                continue;
            };
            let expired = graph.expire_timeouts(now);
            for (source, target) in expired {
                let action = match escalation {
                    TimeoutEscalation::Retry => {
                        let count = state
                            .timeout_retries
                            .entry((plan_id, source, target))
                            .or_insert(0);
                        if *count < max_retries {
                            *count += 1;
                            graph.reset_edge(source, target, now + retry_window);
                            TimeoutEscalation::Retry
                        } else {
                            warn!(
                                plan_id = %plan_id,
                                %source,
                                %target,
                                "dependency timeout retries exhausted"
                            );
                            TimeoutEscalation::Notify
                        }
                    }
                    TimeoutEscalation::Substitute => {
                        // Let the dependent proceed as if the edge held.
                        graph.satisfy_edge(source, target);
                        graph.promote_ready();
                        TimeoutEscalation::Substitute
                    }
                    TimeoutEscalation::Cancel => {
                        graph.mark_cancelled(target);
                        TimeoutEscalation::Cancel
                    }
                    TimeoutEscalation::Notify => TimeoutEscalation::Notify,
                };
                events.push(EscalationEvent {
                    plan_id,
                    source,
                    target,
                    action,
                });
            }
        }
        events
    }

    /// Whether every node of the plan's graph is terminal.
    pub async fn is_settled(&self, plan_id: Uuid) -> bool {
        self.state
            .lock()
            .await
            .graphs
            .get(&plan_id)
            .is_none_or(DependencyGraph::is_settled)
    }

    /// Node status counts for plan reporting.
    pub async fn status_counts(&self, plan_id: Uuid) -> HashMap<NodeStatus, usize> {
        self.state
            .lock()
            .await
            .graphs
            .get(&plan_id)
            .map(DependencyGraph::status_counts)
            .unwrap_or_default()
    }

    /// Drop a settled plan's graph.
    pub async fn remove(&self, plan_id: Uuid) {
        let mut state = self.state.lock().await;
        state.graphs.remove(&plan_id);
        state.timeout_retries.retain(|(p, _, _), _| *p != plan_id);
    }
}
