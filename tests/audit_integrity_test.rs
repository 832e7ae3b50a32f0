//! Audit chain tamper-evidence over a long record run.

use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use runnerhub::audit::{
    AuditAction, AuditActor, AuditCategory, AuditLog, AuditOutcome, AuditRecord, AuditResource,
    SearchFilter,
};
use runnerhub::domain::models::AuditConfig;

async fn log_with_records(temp: &TempDir, count: usize) -> AuditLog {
    let log = AuditLog::open(AuditConfig {
        base_path: temp.path().display().to_string(),
        buffer_batch_size: 64,
        ..Default::default()
    })
    .await
    .unwrap();

    for i in 0..count {
        log.append(
            AuditRecord::new(
                AuditCategory::Job,
                AuditAction::JobCompleted,
                AuditOutcome::Success,
                AuditActor::System,
                AuditResource::job(Uuid::new_v4()),
            )
            .with_details(json!({ "n": i })),
        )
        .await
        .unwrap();
    }
    log.flush().await.unwrap();
    log
}

#[tokio::test]
async fn untampered_chain_of_1000_verifies() {
    let temp = TempDir::new().unwrap();
    let log = log_with_records(&temp, 1000).await;

    let report = log.verify_integrity(None, None).await.unwrap();
    assert_eq!(report.verified, 1000);
    assert_eq!(report.failed, 0);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn tampering_record_500_fails_it_and_everything_after() {
    let temp = TempDir::new().unwrap();
    let log = log_with_records(&temp, 1000).await;

    // Flip one byte in record #500 (details n == 499, zero-indexed).
    let content = tokio::fs::read_to_string(log.active_path()).await.unwrap();
    let tampered: Vec<String> = content
        .lines()
        .map(|line| {
            if line.contains("\"n\":499") {
                line.replace("\"n\":499", "\"n\":899")
            } else {
                line.to_string()
            }
        })
        .collect();
    tokio::fs::write(log.active_path(), tampered.join("\n") + "\n")
        .await
        .unwrap();

    let report = log.verify_integrity(None, None).await.unwrap();
    // Records 1..=499 verify; records 500..=1000 are all failed.
    assert_eq!(report.verified, 499);
    assert_eq!(report.failed, 501);
    assert!(report.errors[0].contains("hash mismatch"));
}

#[tokio::test]
async fn search_does_not_mind_tampering() {
    let temp = TempDir::new().unwrap();
    let log = log_with_records(&temp, 50).await;

    let results = log
        .search(&SearchFilter::new().with_limit(10))
        .await
        .unwrap();
    assert_eq!(results.len(), 10);
    // Newest first.
    assert!(results[0].timestamp_ms >= results[9].timestamp_ms);
}

#[tokio::test]
async fn rotation_preserves_chain_across_files() {
    let temp = TempDir::new().unwrap();
    let log = AuditLog::open(AuditConfig {
        base_path: temp.path().display().to_string(),
        buffer_batch_size: 8,
        max_file_size: 4096,
        ..Default::default()
    })
    .await
    .unwrap();

    for i in 0..60 {
        log.append(
            AuditRecord::new(
                AuditCategory::Security,
                AuditAction::ThreatDetected,
                AuditOutcome::Failure,
                AuditActor::System,
                AuditResource::job(Uuid::new_v4()),
            )
            .with_details(json!({ "n": i })),
        )
        .await
        .unwrap();
    }
    log.flush().await.unwrap();

    let report = log.verify_integrity(None, None).await.unwrap();
    assert_eq!(report.verified, 60);
    assert_eq!(report.failed, 0);
}
