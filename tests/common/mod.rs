//! Shared wiring for integration tests: the full pipeline over the
//! in-process engine and scanner.

use std::sync::Arc;

use tempfile::TempDir;

use runnerhub::adapters::{MockContainerEngine, MockImageScanner};
use runnerhub::application::ParallelExecutor;
use runnerhub::audit::AuditLog;
use runnerhub::domain::models::config::SecurityComponents;
use runnerhub::domain::models::pool::{PoolCapacity, ResourceAllocation, ResourcePool};
use runnerhub::domain::models::{
    AuditConfig, ExecutorConfig, Job, LoadBalancerConfig, Requirement, RunnerCandidate,
    SchedulerConfig, SecurityConfig, ThrottlingConfig,
};
use runnerhub::security::SecurityOrchestrator;
use runnerhub::services::dependency_manager::{DependencyManager, DependencyManagerConfig};
use runnerhub::services::load_balancer::LoadBalancer;
use runnerhub::services::router::Router;
use runnerhub::services::scheduler::Scheduler;

pub struct TestStack {
    pub executor: Arc<ParallelExecutor>,
    pub scheduler: Arc<Scheduler>,
    pub security: Arc<SecurityOrchestrator>,
    pub engine: Arc<MockContainerEngine>,
    pub scanner: Arc<MockImageScanner>,
    pub audit: Arc<AuditLog>,
    pub temp: TempDir,
}

pub struct StackOptions {
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub pool: ResourcePool,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig {
                retry_delay_ms: 5,
                ..Default::default()
            },
            scheduler: SchedulerConfig::default(),
            load_balancer: LoadBalancerConfig {
                throttling: ThrottlingConfig {
                    requests_per_second: 1000,
                    requests_per_minute: 60_000,
                    burst: 1000,
                },
                ..Default::default()
            },
            pool: ResourcePool::new("default", PoolCapacity::new(64.0, 131_072.0, 1_000_000.0)),
        }
    }
}

pub async fn stack(options: StackOptions) -> TestStack {
    let temp = TempDir::new().expect("temp dir");
    let audit = Arc::new(
        AuditLog::open(AuditConfig {
            base_path: temp.path().display().to_string(),
            buffer_batch_size: 8,
            ..Default::default()
        })
        .await
        .expect("audit log"),
    );
    let engine = Arc::new(MockContainerEngine::new());
    let scanner = Arc::new(MockImageScanner::new());

    let security = Arc::new(SecurityOrchestrator::new(
        SecurityConfig {
            components: SecurityComponents {
                rbac: false,
                ..Default::default()
            },
            ..Default::default()
        },
        engine.clone(),
        scanner.clone(),
        audit.clone(),
        ResourceAllocation::new(64.0, 131_072.0, 1_000_000.0),
    ));

    let router = Arc::new(Router::default());
    let load_balancer = Arc::new(LoadBalancer::new(options.load_balancer, router));
    let scheduler = Arc::new(Scheduler::new(options.scheduler));
    scheduler.add_pool(options.pool).await;
    let dependencies = Arc::new(DependencyManager::new(DependencyManagerConfig::default()));

    let executor = Arc::new(ParallelExecutor::new(
        options.executor,
        load_balancer,
        scheduler.clone(),
        dependencies,
        security.clone(),
        engine.clone(),
        audit.clone(),
    ));

    TestStack {
        executor,
        scheduler,
        security,
        engine,
        scanner,
        audit,
        temp,
    }
}

/// A standard self-hosted linux runner.
pub fn linux_runner(id: &str) -> RunnerCandidate {
    RunnerCandidate::new(id).with_labels(["self-hosted", "linux"])
}

/// A job asking for 2 cores and 4 GiB, the shape most tests use.
pub fn build_job() -> Job {
    let mut job = Job::new("acme/web", "build").with_labels(["self-hosted", "linux"]);
    job.requirements.cpu = Requirement::exact(2.0);
    job.requirements.memory_mb = Requirement::exact(4096.0);
    job.requirements.disk_mb = Requirement::exact(1024.0);
    job
}
