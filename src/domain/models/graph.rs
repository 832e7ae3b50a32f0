//! Dependency graph domain model.
//!
//! Jobs submitted as a batch form a DAG. Nodes and edges live in dense
//! arenas addressed by index newtypes; job ids map to node indices through
//! a side table. The graph rejects cycles at build time and derives layers,
//! depth, and the critical path up front.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::condition::{ConditionParseError, DependencyCondition};
use super::job::{Job, JobPriority, JobResult};

/// Stable handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub usize);

/// Stable handle to an edge in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeIndex(pub usize);

/// Node lifecycle within the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Dependencies not yet satisfied.
    Waiting,
    /// All gating edges satisfied; eligible for dispatch.
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Not run because a predecessor failed (non-fatal outcome).
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// What a dependency edge carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Plain completion ordering.
    Completion,
    /// The dependent consumes artifacts of the source.
    Artifact,
}

impl Default for EdgeKind {
    fn default() -> Self {
        Self::Completion
    }
}

/// Resolution state of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Pending,
    Satisfied,
    Failed,
    TimedOut,
}

/// Derived per-node metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Layer index; roots are depth 0.
    pub depth: usize,
    pub fan_in: usize,
    pub fan_out: usize,
    pub on_critical_path: bool,
    pub est_duration_secs: u64,
}

/// A node wrapping one job of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepNode {
    pub job_id: Uuid,
    pub priority: JobPriority,
    pub status: NodeStatus,
    /// Result once the job reaches a terminal execution state.
    pub result: Option<JobResult>,
    /// Incoming edges (dependencies).
    pub deps: Vec<EdgeIndex>,
    /// Outgoing edges (dependents).
    pub dependents: Vec<EdgeIndex>,
    pub metadata: NodeMetadata,
}

/// A dependency edge `source -> target` ("target needs source").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepEdge {
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub kind: EdgeKind,
    pub optional: bool,
    pub condition: DependencyCondition,
    /// When the edge expires if the source has not finished.
    pub timeout_at: DateTime<Utc>,
    pub state: EdgeState,
}

/// Per-edge attribute overrides supplied at submission time. Conditions
/// arrive as expressions and are parsed during the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeOptions {
    pub source: Uuid,
    pub target: Uuid,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub kind: EdgeKind,
}

/// Errors raised while building a graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphBuildError {
    #[error("dependency cycle detected involving job {0}")]
    Cycle(Uuid),
    #[error("job {job} needs unknown job {missing}")]
    MissingDependency { job: Uuid, missing: Uuid },
    #[error("invalid condition on edge {source_id} -> {target}: {error}")]
    InvalidCondition {
        source_id: Uuid,
        target: Uuid,
        error: ConditionParseError,
    },
    #[error("duplicate job id {0} in batch")]
    DuplicateJob(Uuid),
}

/// Outcome of a failure propagation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationOutcome {
    pub failed: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
}

/// DFS colouring for cycle detection.
#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// A batch dependency DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    nodes: Vec<DepNode>,
    edges: Vec<DepEdge>,
    index: HashMap<Uuid, NodeIndex>,
    /// Kahn layers; `layers[d]` holds every node at depth `d`.
    pub layers: Vec<Vec<NodeIndex>>,
    pub critical_path: Vec<NodeIndex>,
    pub roots: Vec<NodeIndex>,
    pub leaves: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Build a graph from a batch of jobs using their `needs` lists plus
    /// optional per-edge overrides. Fails on cycles, unknown references,
    /// and malformed conditions; nothing of a failed build is retained.
    pub fn build(
        jobs: &[Job],
        edge_options: &[EdgeOptions],
        default_timeout: Duration,
    ) -> Result<Self, GraphBuildError> {
        let mut index: HashMap<Uuid, NodeIndex> = HashMap::with_capacity(jobs.len());
        let mut nodes: Vec<DepNode> = Vec::with_capacity(jobs.len());

        for job in jobs {
            if index.insert(job.id, NodeIndex(nodes.len())).is_some() {
                return Err(GraphBuildError::DuplicateJob(job.id));
            }
            nodes.push(DepNode {
                job_id: job.id,
                priority: job.priority,
                status: NodeStatus::Waiting,
                result: None,
                deps: Vec::new(),
                dependents: Vec::new(),
                metadata: NodeMetadata {
                    est_duration_secs: job.estimated_duration_secs,
                    ..NodeMetadata::default()
                },
            });
        }

        // Collect overrides keyed by (source, target).
        let mut overrides: HashMap<(Uuid, Uuid), &EdgeOptions> = HashMap::new();
        for opt in edge_options {
            overrides.insert((opt.source, opt.target), opt);
        }

        let timeout_at = Utc::now() + default_timeout;
        let mut edges: Vec<DepEdge> = Vec::new();
        for job in jobs {
            let target = index[&job.id];
            for need in &job.needs {
                let source = *index.get(need).ok_or(GraphBuildError::MissingDependency {
                    job: job.id,
                    missing: *need,
                })?;

                let (optional, condition, kind) = match overrides.get(&(*need, job.id)) {
                    Some(opt) => {
                        let condition = match &opt.condition {
                            Some(expr) => DependencyCondition::parse(expr).map_err(|error| {
                                GraphBuildError::InvalidCondition {
                                    source_id: *need,
                                    target: job.id,
                                    error,
                                }
                            })?,
                            None => DependencyCondition::default(),
                        };
                        (opt.optional, condition, opt.kind)
                    }
                    None => (false, DependencyCondition::default(), EdgeKind::default()),
                };

                let edge_ix = EdgeIndex(edges.len());
                edges.push(DepEdge {
                    source,
                    target,
                    kind,
                    optional,
                    condition,
                    timeout_at,
                    state: EdgeState::Pending,
                });
                nodes[target.0].deps.push(edge_ix);
                nodes[source.0].dependents.push(edge_ix);
            }
        }

        let mut graph = Self {
            nodes,
            edges,
            index,
            layers: Vec::new(),
            critical_path: Vec::new(),
            roots: Vec::new(),
            leaves: Vec::new(),
        };

        graph.detect_cycles()?;
        graph.assign_layers();
        graph.compute_critical_path();
        graph.promote_ready();
        Ok(graph)
    }

    /// White/grey/black DFS over the dependents relation. A grey neighbour
    /// is a back edge.
    fn detect_cycles(&self) -> Result<(), GraphBuildError> {
        let mut colour = vec![Colour::White; self.nodes.len()];
        // Iterative DFS; the stack holds (node, next dependent edge offset).
        for start in 0..self.nodes.len() {
            if colour[start] != Colour::White {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            colour[start] = Colour::Grey;
            while let Some(&(node, cursor)) = stack.last() {
                if cursor < self.nodes[node].dependents.len() {
                    if let Some(frame) = stack.last_mut() {
                        frame.1 += 1;
                    }
                    let edge = self.nodes[node].dependents[cursor];
                    let next = self.edges[edge.0].target.0;
                    match colour[next] {
                        Colour::Grey => {
                            return Err(GraphBuildError::Cycle(self.nodes[next].job_id));
                        }
                        Colour::White => {
                            colour[next] = Colour::Grey;
                            stack.push((next, 0));
                        }
                        Colour::Black => {}
                    }
                } else {
                    colour[node] = Colour::Black;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm. Layer index becomes node depth; fan_in/fan_out and
    /// roots/leaves fall out of the same pass.
    fn assign_layers(&mut self) {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.deps.len()).collect();
        for (ix, node) in self.nodes.iter_mut().enumerate() {
            node.metadata.fan_in = node.deps.len();
            node.metadata.fan_out = node.dependents.len();
            if node.deps.is_empty() {
                self.roots.push(NodeIndex(ix));
            }
            if node.dependents.is_empty() {
                self.leaves.push(NodeIndex(ix));
            }
        }

        let mut current: Vec<NodeIndex> = self.roots.clone();
        let mut depth = 0usize;
        while !current.is_empty() {
            let mut next: Vec<NodeIndex> = Vec::new();
            for &ix in &current {
                self.nodes[ix.0].metadata.depth = depth;
                for &edge in &self.nodes[ix.0].dependents.clone() {
                    let target = self.edges[edge.0].target;
                    in_degree[target.0] -= 1;
                    if in_degree[target.0] == 0 {
                        next.push(target);
                    }
                }
            }
            self.layers.push(current);
            current = next;
            depth += 1;
        }
    }

    /// Longest-duration path. Processes layers in order, so every
    /// predecessor distance is final before its dependents read it.
    fn compute_critical_path(&mut self) {
        let mut dist = vec![0u64; self.nodes.len()];
        let mut pred: Vec<Option<NodeIndex>> = vec![None; self.nodes.len()];

        for layer in &self.layers {
            for &ix in layer {
                let own = self.nodes[ix.0].metadata.est_duration_secs;
                let mut best = 0u64;
                let mut best_pred = None;
                for &edge in &self.nodes[ix.0].deps {
                    let source = self.edges[edge.0].source;
                    if dist[source.0] >= best {
                        best = dist[source.0];
                        best_pred = Some(source);
                    }
                }
                dist[ix.0] = best + own;
                pred[ix.0] = if self.nodes[ix.0].deps.is_empty() {
                    None
                } else {
                    best_pred
                };
            }
        }

        let tail = (0..self.nodes.len()).max_by_key(|&ix| dist[ix]).map(NodeIndex);
        let mut path = Vec::new();
        let mut cursor = tail;
        while let Some(ix) = cursor {
            path.push(ix);
            cursor = pred[ix.0];
        }
        path.reverse();
        for &ix in &path {
            self.nodes[ix.0].metadata.on_critical_path = true;
        }
        self.critical_path = path;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_index(&self, job_id: Uuid) -> Option<NodeIndex> {
        self.index.get(&job_id).copied()
    }

    pub fn node(&self, ix: NodeIndex) -> &DepNode {
        &self.nodes[ix.0]
    }

    pub fn edge(&self, ix: EdgeIndex) -> &DepEdge {
        &self.edges[ix.0]
    }

    pub fn node_by_job(&self, job_id: Uuid) -> Option<&DepNode> {
        self.node_index(job_id).map(|ix| self.node(ix))
    }

    /// Whether an edge currently gates its target.
    ///
    /// Optional edges never gate; a non-optional edge gates until satisfied.
    fn edge_blocks(&self, edge: &DepEdge) -> bool {
        !edge.optional && edge.state != EdgeState::Satisfied
    }

    /// Move Waiting nodes whose gates are all satisfied to Ready.
    /// Returns the newly ready job ids.
    pub fn promote_ready(&mut self) -> Vec<Uuid> {
        let gated: Vec<bool> = self
            .nodes
            .iter()
            .map(|node| {
                node.deps
                    .iter()
                    .any(|&e| self.edge_blocks(&self.edges[e.0]))
            })
            .collect();

        let mut promoted = Vec::new();
        for (node, gated) in self.nodes.iter_mut().zip(gated) {
            if node.status == NodeStatus::Waiting && !gated {
                node.status = NodeStatus::Ready;
                promoted.push(node.job_id);
            }
        }
        promoted
    }

    /// All currently ready job ids, highest urgency first.
    pub fn ready_jobs(&self) -> Vec<Uuid> {
        let mut ready: Vec<&DepNode> = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Ready)
            .collect();
        ready.sort_by_key(|n| n.priority);
        ready.iter().map(|n| n.job_id).collect()
    }

    pub fn mark_running(&mut self, job_id: Uuid) {
        if let Some(ix) = self.node_index(job_id) {
            self.nodes[ix.0].status = NodeStatus::Running;
        }
    }

    pub fn mark_cancelled(&mut self, job_id: Uuid) {
        if let Some(ix) = self.node_index(job_id) {
            if !self.nodes[ix.0].status.is_terminal() {
                self.nodes[ix.0].status = NodeStatus::Cancelled;
            }
        }
    }

    /// Record a terminal result, resolve outgoing edges, and promote any
    /// newly unblocked dependents. Recording a result for an already
    /// terminal node is a no-op.
    pub fn record_result(&mut self, job_id: Uuid, result: JobResult) -> Vec<Uuid> {
        let Some(ix) = self.node_index(job_id) else {
            return Vec::new();
        };
        if self.nodes[ix.0].status.is_terminal() {
            return Vec::new();
        }
        self.nodes[ix.0].status = if result.success {
            NodeStatus::Completed
        } else {
            NodeStatus::Failed
        };
        self.nodes[ix.0].result = Some(result);

        for edge_ix in self.nodes[ix.0].dependents.clone() {
            let edge = &self.edges[edge_ix.0];
            if edge.state != EdgeState::Pending {
                continue;
            }
            // An optional edge whose source failed counts as satisfied
            // regardless of its condition.
            let satisfied =
                edge.condition.evaluate(&result) || (edge.optional && !result.success);
            self.edges[edge_ix.0].state = if satisfied {
                EdgeState::Satisfied
            } else {
                EdgeState::Failed
            };
        }

        self.promote_ready()
    }

    /// Expire pending edges past their deadline. An expired edge behaves
    /// like a failed one (optional edges stop gating, non-optional edges
    /// block their target permanently). Returns `(source, target)` job id
    /// pairs for escalation.
    pub fn expire_timeouts(&mut self, now: DateTime<Utc>) -> Vec<(Uuid, Uuid)> {
        let mut expired = Vec::new();
        for edge in &mut self.edges {
            if edge.state == EdgeState::Pending && now >= edge.timeout_at {
                edge.state = EdgeState::TimedOut;
                expired.push((
                    self.nodes[edge.source.0].job_id,
                    self.nodes[edge.target.0].job_id,
                ));
            }
        }
        expired
    }

    /// Reset a timed-out or failed edge back to pending (timeout escalation
    /// retry). Extends the deadline.
    pub fn reset_edge(&mut self, source: Uuid, target: Uuid, new_timeout: DateTime<Utc>) {
        let (Some(s), Some(t)) = (self.node_index(source), self.node_index(target)) else {
            return;
        };
        for edge in &mut self.edges {
            if edge.source == s && edge.target == t && edge.state != EdgeState::Satisfied {
                edge.state = EdgeState::Pending;
                edge.timeout_at = new_timeout;
            }
        }
    }

    /// Force an edge to satisfied (timeout substitution).
    pub fn satisfy_edge(&mut self, source: Uuid, target: Uuid) {
        let (Some(s), Some(t)) = (self.node_index(source), self.node_index(target)) else {
            return;
        };
        for edge in &mut self.edges {
            if edge.source == s && edge.target == t {
                edge.state = EdgeState::Satisfied;
            }
        }
    }

    /// Transitive dependents of a node, in BFS order.
    fn transitive_dependents(&self, start: NodeIndex, honour_optional: bool) -> Vec<NodeIndex> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue = std::collections::VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(ix) = queue.pop_front() {
            for &edge_ix in &self.nodes[ix.0].dependents {
                let edge = &self.edges[edge_ix.0];
                if honour_optional && edge.optional {
                    continue;
                }
                let next = edge.target;
                if !seen[next.0] {
                    seen[next.0] = true;
                    out.push(next);
                    queue.push_back(next);
                }
            }
        }
        out
    }

    /// Apply a failure-propagation strategy for a failed node.
    ///
    /// Only non-terminal dependents are touched; jobs already finished keep
    /// their status.
    pub fn propagate_failure(
        &mut self,
        failed_job: Uuid,
        strategy: PropagationStrategy,
    ) -> PropagationOutcome {
        let Some(start) = self.node_index(failed_job) else {
            return PropagationOutcome::default();
        };
        let mut outcome = PropagationOutcome::default();

        match strategy {
            PropagationStrategy::Strict => {
                for ix in self.transitive_dependents(start, false) {
                    if !self.nodes[ix.0].status.is_terminal() {
                        self.nodes[ix.0].status = NodeStatus::Failed;
                        outcome.failed.push(self.nodes[ix.0].job_id);
                    }
                }
            }
            PropagationStrategy::Lenient => {
                for ix in self.transitive_dependents(start, true) {
                    if !self.nodes[ix.0].status.is_terminal() {
                        self.nodes[ix.0].status = NodeStatus::Skipped;
                        outcome.skipped.push(self.nodes[ix.0].job_id);
                    }
                }
            }
            PropagationStrategy::Optimistic => {
                // Only reach through non-optional edges; targets fail.
                for ix in self.transitive_dependents(start, true) {
                    if !self.nodes[ix.0].status.is_terminal() {
                        self.nodes[ix.0].status = NodeStatus::Failed;
                        outcome.failed.push(self.nodes[ix.0].job_id);
                    }
                }
            }
            PropagationStrategy::Adaptive => {
                for ix in self.transitive_dependents(start, true) {
                    if self.nodes[ix.0].status.is_terminal() {
                        continue;
                    }
                    let node = &self.nodes[ix.0];
                    let fail = node.metadata.on_critical_path
                        || node.priority.at_least(JobPriority::High);
                    if fail {
                        self.nodes[ix.0].status = NodeStatus::Failed;
                        outcome.failed.push(self.nodes[ix.0].job_id);
                    } else {
                        self.nodes[ix.0].status = NodeStatus::Skipped;
                        outcome.skipped.push(self.nodes[ix.0].job_id);
                    }
                }
            }
        }
        outcome
    }

    /// Whether every node is terminal.
    pub fn is_settled(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_terminal())
    }

    /// Status counts for reporting.
    pub fn status_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for node in &self.nodes {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }
}

/// How a predecessor failure spreads through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationStrategy {
    /// Every transitive dependent fails immediately.
    Strict,
    /// Dependents are skipped (non-fatal).
    Lenient,
    /// Only dependents reached through non-optional edges fail.
    Optimistic,
    /// Critical-path or high-urgency dependents fail; the rest are skipped.
    Adaptive,
}

impl Default for PropagationStrategy {
    fn default() -> Self {
        Self::Adaptive
    }
}
