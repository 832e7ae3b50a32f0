//! Domain models for the orchestrator.

pub mod condition;
pub mod config;
pub mod graph;
pub mod job;
pub mod plan;
pub mod pool;
pub mod runner;
pub mod security;
pub mod webhook;

pub use condition::{CompareOp, DependencyCondition};
pub use config::{
    AuditConfig, AuditFormat, AutoScalingConfig, Config, ExecutorConfig, LbAlgorithm,
    LoadBalancerConfig,
    LoggingConfig, ScannerPolicyConfig, SchedulerConfig, SchedulingAlgorithm, SecurityConfig,
    SecurityHardening, SecurityPolicies, StickyConfig, StickyKey, ThrottlingConfig, WebhookConfig,
};
pub use graph::{
    DependencyGraph, DepEdge, DepNode, EdgeIndex, EdgeKind, EdgeOptions, EdgeState,
    GraphBuildError, NodeIndex, NodeMetadata, NodeStatus, PropagationOutcome, PropagationStrategy,
};
pub use job::{
    AffinityRule, AffinityStrength, AntiAffinityRule, GpuRequirement, Job, JobPriority, JobResult,
    PlacementConstraints, Requirement, ResourceRequirements, SecretInjectionMode, SecretNeed,
    SecurityLevel,
};
pub use plan::{
    AttemptRecord, ExecutionJob, ExecutionPlan, ExecutionStage, ExecutionStatus, PlanStatus,
};
pub use pool::{
    PoolCapacity, PoolPolicies, PoolStatus, PreemptionPolicy, PreemptionStrategy,
    ResourceAllocation, ResourceCounter, ResourcePool, SchedulingWindow,
};
pub use runner::{
    CompletionRecord, Location, PerformanceHistory, RunnerCandidate, RunnerCapacity, RunnerStatus,
};
pub use security::{
    ContextState, InjectedSecret, SecurityChecks, SecurityContext, SecurityReport, ThreatEvent,
    ThreatKind, ThreatSeverity, Violation,
};
pub use webhook::{WebhookEvent, WebhookEventKind};
