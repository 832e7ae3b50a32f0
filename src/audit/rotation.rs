//! Audit file rotation, indexing, and retention.
//!
//! The active file rotates into the archive directory once it reaches the
//! size limit. Each archived file gets a sidecar `.idx` with the indexed
//! fields of every record, and a daily sweep deletes archives past their
//! retention window. Security and compliance archives are held longer than
//! the default.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::record::{AuditCategory, AuditRecord};

/// Retention for archives containing security records.
pub const SECURITY_RETENTION_DAYS: u32 = 730;
/// Retention for archives containing compliance records.
pub const COMPLIANCE_RETENTION_DAYS: u32 = 2555;

/// One indexed record entry inside a `.idx` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Byte offset of the record line in the archive file.
    pub offset: u64,
    /// Byte length of the line, excluding the newline.
    pub len: u64,
    /// Indexed field values, keyed by field name.
    pub fields: std::collections::HashMap<String, String>,
}

/// Sidecar index for one archive file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveIndex {
    pub filename: String,
    pub filepath: String,
    pub created: DateTime<Utc>,
    pub events: Vec<IndexEntry>,
}

impl ArchiveIndex {
    /// Longest retention demanded by any record category in this archive.
    pub fn retention_days(&self, default_days: u32) -> u32 {
        let mut days = default_days;
        for entry in &self.events {
            match entry.fields.get("category").map(String::as_str) {
                Some("compliance") => days = days.max(COMPLIANCE_RETENTION_DAYS),
                Some("security") => days = days.max(SECURITY_RETENTION_DAYS),
                _ => {}
            }
        }
        days
    }
}

/// Rotates audit files and sweeps expired archives.
#[derive(Debug, Clone)]
pub struct LogRotator {
    archive_dir: PathBuf,
    max_file_size: u64,
    retention_days: u32,
    indexed_fields: Vec<String>,
}

impl LogRotator {
    pub fn new(
        archive_dir: impl Into<PathBuf>,
        max_file_size: u64,
        retention_days: u32,
        indexed_fields: Vec<String>,
    ) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            max_file_size,
            retention_days,
            indexed_fields,
        }
    }

    /// Whether appending `incoming_len` more bytes must rotate first.
    pub fn should_rotate(&self, current_size: u64, incoming_len: u64) -> bool {
        current_size > 0 && current_size + incoming_len >= self.max_file_size
    }

    fn index_value(record: &AuditRecord, field: &str) -> Option<String> {
        match field {
            "category" => Some(record.category.as_str().to_string()),
            "action" => Some(record.action.as_str().to_string()),
            "actor" => Some(record.actor.identifier()),
            "resource_id" => Some(record.resource.id.clone()),
            "resource_type" => Some(record.resource.resource_type.clone()),
            "level" => Some(record.level.as_str().to_string()),
            _ => None,
        }
    }

    /// Rotate the active file into the archive directory and write its
    /// index. Returns the archive filename for the next file's header.
    pub async fn rotate(
        &self,
        active_path: &Path,
        parse_line: impl Fn(&str) -> Option<AuditRecord>,
    ) -> Result<String> {
        tokio::fs::create_dir_all(&self.archive_dir)
            .await
            .context("failed to create archive directory")?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%f");
        let archive_name = format!("audit-{timestamp}.log");
        let archive_path = self.archive_dir.join(&archive_name);

        tokio::fs::rename(active_path, &archive_path)
            .await
            .context("failed to rotate audit file")?;

        // Build the index from the archived content.
        let content = tokio::fs::read_to_string(&archive_path)
            .await
            .context("failed to read rotated archive")?;
        let mut events = Vec::new();
        let mut offset = 0u64;
        for line in content.lines() {
            let len = line.len() as u64;
            if let Some(record) = parse_line(line) {
                let mut fields = std::collections::HashMap::new();
                for field in &self.indexed_fields {
                    if let Some(value) = Self::index_value(&record, field) {
                        fields.insert(field.clone(), value);
                    }
                }
                events.push(IndexEntry { offset, len, fields });
            }
            offset += len + 1;
        }

        let index = ArchiveIndex {
            filename: archive_name.clone(),
            filepath: archive_path.display().to_string(),
            created: Utc::now(),
            events,
        };
        let index_path = self.archive_dir.join(format!("{archive_name}.idx"));
        tokio::fs::write(&index_path, serde_json::to_vec_pretty(&index)?)
            .await
            .context("failed to write archive index")?;

        info!(
            archive = %archive_path.display(),
            records = index.events.len(),
            "rotated audit file"
        );
        Ok(archive_name)
    }

    /// List archive log files, oldest first.
    pub async fn archives(&self) -> Result<Vec<PathBuf>> {
        let mut archives = Vec::new();
        if !self.archive_dir.exists() {
            return Ok(archives);
        }
        let mut entries = tokio::fs::read_dir(&self.archive_dir)
            .await
            .context("failed to read archive directory")?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("log") {
                archives.push(path);
            }
        }
        archives.sort();
        Ok(archives)
    }

    async fn load_index(&self, archive: &Path) -> Option<ArchiveIndex> {
        let index_path = archive.with_file_name(format!(
            "{}.idx",
            archive.file_name()?.to_string_lossy()
        ));
        let content = tokio::fs::read_to_string(index_path).await.ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Delete archives older than their retention window. Returns the
    /// number of files removed (indexes included in the count).
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut deleted = 0usize;
        for archive in self.archives().await? {
            let index = self.load_index(&archive).await;
            let retention = index
                .as_ref()
                .map_or(self.retention_days, |ix| ix.retention_days(self.retention_days));
            let created = match index {
                Some(ix) => ix.created,
                None => {
                    let metadata = tokio::fs::metadata(&archive).await?;
                    metadata.modified().map(DateTime::<Utc>::from).unwrap_or(now)
                }
            };
            if now - created >= Duration::days(i64::from(retention)) {
                match tokio::fs::remove_file(&archive).await {
                    Ok(()) => {
                        deleted += 1;
                        let idx = archive.with_file_name(format!(
                            "{}.idx",
                            archive.file_name().unwrap_or_default().to_string_lossy()
                        ));
                        if tokio::fs::remove_file(&idx).await.is_ok() {
                            deleted += 1;
                        }
                        debug!(archive = %archive.display(), "expired archive deleted");
                    }
                    Err(err) => {
                        warn!(archive = %archive.display(), error = %err, "failed to delete archive");
                    }
                }
            }
        }
        if deleted > 0 {
            info!(count = deleted, "retention sweep removed expired archives");
        }
        Ok(deleted)
    }

    /// Whether an archive may contain records matching a category filter,
    /// per its index. Unknown archives always may.
    pub async fn may_match(&self, archive: &Path, category: Option<AuditCategory>) -> bool {
        let Some(category) = category else {
            return true;
        };
        match self.load_index(archive).await {
            Some(index) => index.events.iter().any(|e| {
                e.fields.get("category").map(String::as_str) == Some(category.as_str())
            }),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::{AuditAction, AuditActor, AuditOutcome, AuditResource};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn rotator(dir: &Path) -> LogRotator {
        LogRotator::new(
            dir.join("archive"),
            1024,
            365,
            vec!["category".to_string(), "action".to_string()],
        )
    }

    fn record(category: AuditCategory) -> AuditRecord {
        AuditRecord::new(
            category,
            AuditAction::JobCompleted,
            AuditOutcome::Success,
            AuditActor::System,
            AuditResource::job(Uuid::new_v4()),
        )
    }

    #[test]
    fn test_should_rotate_boundary() {
        let temp = TempDir::new().unwrap();
        let rotator = rotator(temp.path());
        assert!(!rotator.should_rotate(0, 2048));
        assert!(!rotator.should_rotate(512, 100));
        // Exactly reaching the limit rotates before the append.
        assert!(rotator.should_rotate(1000, 24));
        assert!(rotator.should_rotate(2000, 1));
    }

    #[tokio::test]
    async fn test_rotate_creates_archive_and_index() {
        let temp = TempDir::new().unwrap();
        let rotator = rotator(temp.path());
        let active = temp.path().join("audit.log");

        let line = serde_json::to_string(&record(AuditCategory::Job)).unwrap();
        tokio::fs::write(&active, format!("{line}\n")).await.unwrap();

        let archived = rotator
            .rotate(&active, |l| serde_json::from_str(l).ok())
            .await
            .unwrap();
        assert!(!active.exists());

        let archives = rotator.archives().await.unwrap();
        assert_eq!(archives.len(), 1);
        assert!(archives[0].ends_with(&archived));

        let index_content = tokio::fs::read_to_string(
            archives[0].with_file_name(format!("{archived}.idx")),
        )
        .await
        .unwrap();
        let index: ArchiveIndex = serde_json::from_str(&index_content).unwrap();
        assert_eq!(index.events.len(), 1);
        assert_eq!(
            index.events[0].fields.get("category").map(String::as_str),
            Some("job")
        );
        assert_eq!(index.events[0].offset, 0);
    }

    #[test]
    fn test_index_retention_escalation() {
        let base = ArchiveIndex {
            filename: "a".to_string(),
            filepath: "a".to_string(),
            created: Utc::now(),
            events: vec![IndexEntry {
                offset: 0,
                len: 1,
                fields: std::collections::HashMap::from([(
                    "category".to_string(),
                    "security".to_string(),
                )]),
            }],
        };
        assert_eq!(base.retention_days(365), SECURITY_RETENTION_DAYS);

        let mut compliance = base.clone();
        compliance.events[0]
            .fields
            .insert("category".to_string(), "compliance".to_string());
        assert_eq!(compliance.retention_days(365), COMPLIANCE_RETENTION_DAYS);
    }

    #[tokio::test]
    async fn test_sweep_expired_respects_category_retention() {
        let temp = TempDir::new().unwrap();
        let rotator = rotator(temp.path());
        let archive_dir = temp.path().join("archive");
        tokio::fs::create_dir_all(&archive_dir).await.unwrap();

        // A plain archive created 400 days ago: expired at 365.
        let old = archive_dir.join("audit-old.log");
        tokio::fs::write(&old, "x\n").await.unwrap();
        let old_index = ArchiveIndex {
            filename: "audit-old.log".to_string(),
            filepath: old.display().to_string(),
            created: Utc::now() - Duration::days(400),
            events: vec![IndexEntry {
                offset: 0,
                len: 1,
                fields: std::collections::HashMap::from([(
                    "category".to_string(),
                    "job".to_string(),
                )]),
            }],
        };
        tokio::fs::write(
            archive_dir.join("audit-old.log.idx"),
            serde_json::to_vec(&old_index).unwrap(),
        )
        .await
        .unwrap();

        // A security archive of the same age: kept until 730 days.
        let security = archive_dir.join("audit-sec.log");
        tokio::fs::write(&security, "x\n").await.unwrap();
        let mut sec_index = old_index.clone();
        sec_index.filename = "audit-sec.log".to_string();
        sec_index.filepath = security.display().to_string();
        sec_index.events[0]
            .fields
            .insert("category".to_string(), "security".to_string());
        tokio::fs::write(
            archive_dir.join("audit-sec.log.idx"),
            serde_json::to_vec(&sec_index).unwrap(),
        )
        .await
        .unwrap();

        let deleted = rotator.sweep_expired().await.unwrap();
        assert_eq!(deleted, 2); // file + index
        assert!(!old.exists());
        assert!(security.exists());
    }
}
