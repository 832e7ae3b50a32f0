//! RunnerHub daemon entry point.
//!
//! Loads configuration, initialises tracing and the audit log, wires the
//! component graph, and runs the pipeline workers until ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use runnerhub::adapters::{MockContainerEngine, MockImageScanner};
use runnerhub::application::ParallelExecutor;
use runnerhub::audit::AuditLog;
use runnerhub::domain::models::pool::{PoolCapacity, ResourceAllocation, ResourcePool};
use runnerhub::infrastructure::{logging, ConfigLoader};
use runnerhub::security::SecurityOrchestrator;
use runnerhub::services::dependency_manager::{DependencyManager, DependencyManagerConfig};
use runnerhub::services::load_balancer::LoadBalancer;
use runnerhub::services::router::Router;
use runnerhub::services::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::load().context("configuration load failed")?;
    let _log_guard = logging::init(&config.logging)?;
    info!("starting runnerhub");

    let audit = Arc::new(AuditLog::open(config.audit.clone()).await?);

    // The engine and scanner here are the in-process adapters; production
    // deployments wire the real container engine and scanner clients in
    // their place.
    let engine = Arc::new(MockContainerEngine::new());
    let scanner = Arc::new(MockImageScanner::new());

    let cluster = ResourceAllocation::new(64.0, 131_072.0, 2_000_000.0);
    let security = Arc::new(SecurityOrchestrator::new(
        config.security.clone(),
        engine.clone(),
        scanner,
        audit.clone(),
        cluster,
    ));
    security.rbac().install_defaults().await;

    let router = Arc::new(Router::default());
    let load_balancer = Arc::new(LoadBalancer::new(config.load_balancer.clone(), router));
    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
    scheduler
        .add_pool(ResourcePool::new(
            "default",
            PoolCapacity::new(cluster.cpu_cores, cluster.memory_mb, cluster.disk_mb),
        ))
        .await;
    let dependencies = Arc::new(DependencyManager::new(DependencyManagerConfig::default()));

    let executor = Arc::new(ParallelExecutor::new(
        config.executor.clone(),
        load_balancer,
        scheduler.clone(),
        dependencies,
        security.clone(),
        engine,
        audit.clone(),
    ));

    let mut workers = vec![
        executor.spawn_tick_worker(),
        executor.spawn_security_event_worker(),
        executor.spawn_timeout_worker(),
        security.spawn_threat_worker(),
    ];

    // Audit flush and retention workers.
    {
        let audit = audit.clone();
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                audit.flush_interval_secs().max(1),
            ));
            loop {
                ticker.tick().await;
                if let Err(err) = audit.flush().await {
                    tracing::warn!(error = %err, "audit flush failed");
                }
            }
        }));
    }
    {
        let audit = audit.clone();
        workers.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            loop {
                ticker.tick().await;
                if let Err(err) = audit.sweep_retention().await {
                    tracing::warn!(error = %err, "retention sweep failed");
                }
            }
        }));
    }

    // Scheduler pass and auto-scaling evaluation.
    {
        let scheduler = scheduler.clone();
        let interval = config.scheduler.scheduling_interval_secs.max(1);
        workers.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                for decision in scheduler.evaluate_scaling().await {
                    info!(?decision, "auto-scaling decision");
                }
            }
        }));
    }

    info!("runnerhub started");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    executor.shutdown();
    audit.flush().await.ok();
    for worker in workers {
        worker.abort();
    }
    info!("runnerhub stopped");
    Ok(())
}
