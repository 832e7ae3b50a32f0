//! End-to-end pipeline tests: submission through routing, scheduling, the
//! security pipeline, container start, and teardown.

mod common;

use common::{build_job, linux_runner, stack, StackOptions};
use runnerhub::audit::{AuditAction, AuditCategory, SearchFilter};
use runnerhub::domain::errors::OrchestratorError;
use runnerhub::domain::models::{
    ContextState, ExecutionStatus, JobResult, PlanStatus,
};
use runnerhub::domain::ports::SeverityCounts;
use runnerhub::services::router::Router;

#[tokio::test]
async fn happy_path_single_job_full_lifecycle() {
    let s = stack(StackOptions::default()).await;
    s.executor.register_runner("default", linux_runner("r1")).await;

    // The router itself is confident about this placement.
    let router = Router::default();
    let routing = router
        .route(&build_job(), &[linux_runner("r1")], None)
        .await
        .unwrap();
    assert!(routing.confidence >= 0.6);

    let job = build_job();
    let plan_id = s
        .executor
        .submit_plan(vec![job.clone()], vec![], "ci-bot")
        .await
        .unwrap();

    s.executor.tick().await;
    assert_eq!(
        s.executor.job_status(job.id).await,
        Some(ExecutionStatus::Running)
    );

    // The reservation is visible: 2 cores and 4 GiB held.
    let pool = s.scheduler.pool("default").await.unwrap();
    assert!((pool.capacity.cpu_cores.reserved - 2.0).abs() < 1e-9);
    assert!((pool.capacity.memory_mb.reserved - 4096.0).abs() < 1e-9);

    // The security context passed every check and is running.
    let ctx = s.security.context(job.id).await.unwrap();
    assert!(ctx.checks.all_passed());
    assert_eq!(ctx.state, ContextState::Running);
    assert_eq!(ctx.security_score, 100);

    s.executor.report_result(job.id, JobResult::succeeded()).await;
    assert_eq!(
        s.executor.job_status(job.id).await,
        Some(ExecutionStatus::Completed)
    );
    assert_eq!(s.executor.plan_status(plan_id).await, Some(PlanStatus::Completed));

    // After completion the pool shows available == total again.
    let pool = s.scheduler.pool("default").await.unwrap();
    assert!(
        (pool.capacity.cpu_cores.available - pool.capacity.cpu_cores.total).abs() < 1e-9
    );
    assert!(pool.verify_invariant());

    // Lifecycle left an audit trail.
    s.audit.flush().await.unwrap();
    let started = s
        .audit
        .search(&SearchFilter::new().with_action(AuditAction::JobStarted))
        .await
        .unwrap();
    assert_eq!(started.len(), 1);
    let report = s.audit.verify_integrity(None, None).await.unwrap();
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn dependency_cycle_rejected_before_any_queue() {
    let s = stack(StackOptions::default()).await;
    s.executor.register_runner("default", linux_runner("r1")).await;

    let mut a = build_job();
    let mut b = build_job();
    let mut c = build_job();
    let (a_id, b_id, c_id) = (a.id, b.id, c.id);
    a.needs = vec![c_id];
    b.needs = vec![a_id];
    c.needs = vec![b_id];

    let err = s
        .executor
        .submit_plan(vec![a, b, c], vec![], "ci-bot")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::CyclicDependency(_)));
    assert_eq!(s.executor.queued_count().await, 0);
    assert_eq!(s.executor.running_count().await, 0);
}

#[tokio::test]
async fn failed_image_scan_blocks_job_and_audits_threat() {
    let s = stack(StackOptions::default()).await;
    s.executor.register_runner("default", linux_runner("r1")).await;
    s.scanner
        .script_counts(
            "vulnerable:latest",
            SeverityCounts {
                critical: 3,
                ..Default::default()
            },
        )
        .await;

    let job = build_job().with_image("vulnerable:latest");
    let plan_id = s
        .executor
        .submit_plan(vec![job.clone()], vec![], "ci-bot")
        .await
        .unwrap();
    s.executor.tick().await;

    // The context blocked at the scan stage; the job failed terminally.
    let ctx = s.security.context(job.id).await.unwrap();
    assert_eq!(ctx.state, ContextState::Blocked);
    assert!(!ctx.checks.scan);
    assert_eq!(
        s.executor.job_status(job.id).await,
        Some(ExecutionStatus::Failed)
    );
    assert_eq!(s.executor.plan_status(plan_id).await, Some(PlanStatus::Failed));

    // No pool reservation is held.
    let pool = s.scheduler.pool("default").await.unwrap();
    assert!(pool.capacity.cpu_cores.reserved.abs() < 1e-9);

    // A chained security/threat_detected record exists.
    s.audit.flush().await.unwrap();
    let threats = s
        .audit
        .search(
            &SearchFilter::new()
                .with_category(AuditCategory::Security)
                .with_action(AuditAction::ThreatDetected),
        )
        .await
        .unwrap();
    assert!(!threats.is_empty());
    assert!(threats[0].integrity.is_some());

    let report = s.audit.verify_integrity(None, None).await.unwrap();
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn diamond_dependency_plan_completes() {
    let s = stack(StackOptions::default()).await;
    s.executor.register_runner("default", linux_runner("r1")).await;
    s.executor.register_runner("default", linux_runner("r2")).await;

    //   a -> b, a -> c, {b, c} -> d
    let a = build_job();
    let mut b = build_job();
    let mut c = build_job();
    let mut d = build_job();
    b.needs = vec![a.id];
    c.needs = vec![a.id];
    d.needs = vec![b.id, c.id];

    let plan_id = s
        .executor
        .submit_plan(vec![a.clone(), b.clone(), c.clone(), d.clone()], vec![], "ci-bot")
        .await
        .unwrap();

    s.executor.tick().await;
    assert_eq!(s.executor.job_status(a.id).await, Some(ExecutionStatus::Running));
    s.executor.report_result(a.id, JobResult::succeeded()).await;

    s.executor.tick().await;
    assert_eq!(s.executor.running_count().await, 2);
    s.executor.report_result(b.id, JobResult::succeeded()).await;
    s.executor.report_result(c.id, JobResult::succeeded()).await;

    s.executor.tick().await;
    assert_eq!(s.executor.job_status(d.id).await, Some(ExecutionStatus::Running));
    s.executor.report_result(d.id, JobResult::succeeded()).await;

    assert_eq!(s.executor.plan_status(plan_id).await, Some(PlanStatus::Completed));
    assert!(s.scheduler.verify_invariants().await);
}

#[tokio::test]
async fn job_report_carries_security_report() {
    let s = stack(StackOptions::default()).await;
    s.executor.register_runner("default", linux_runner("r1")).await;

    let job = build_job();
    s.executor
        .submit_plan(vec![job.clone()], vec![], "ci-bot")
        .await
        .unwrap();
    s.executor.tick().await;
    s.executor.report_result(job.id, JobResult::succeeded()).await;

    let report = s.executor.job_report(job.id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.attempts, 1);
    assert!(report.runner_id.is_some());
    let security = report.security.unwrap();
    assert_eq!(security.score, 100);
    assert!(security.threats.is_empty());
}
