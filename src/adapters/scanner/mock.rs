//! In-memory image scanner.
//!
//! Returns scripted reports per image reference; unknown images scan clean.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::ports::{ImageScanner, ScanReport, SeverityCounts};

/// Mock scanner with per-image scripted reports.
pub struct MockImageScanner {
    reports: Mutex<HashMap<String, ScanReport>>,
}

impl Default for MockImageScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockImageScanner {
    pub fn new() -> Self {
        Self {
            reports: Mutex::new(HashMap::new()),
        }
    }

    /// Script the report returned for an image reference.
    pub async fn script(&self, image: impl Into<String>, report: ScanReport) {
        self.reports.lock().await.insert(image.into(), report);
    }

    /// Convenience: script severity counts only.
    pub async fn script_counts(&self, image: impl Into<String>, counts: SeverityCounts) {
        let image = image.into();
        let report = ScanReport {
            image_digest: Self::digest_of(&image),
            counts,
            ..Default::default()
        };
        self.script(image, report).await;
    }

    fn digest_of(image: &str) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(image.as_bytes())))
    }
}

#[async_trait]
impl ImageScanner for MockImageScanner {
    async fn scan(&self, image: &str) -> Result<ScanReport> {
        if let Some(report) = self.reports.lock().await.get(image) {
            return Ok(report.clone());
        }
        Ok(ScanReport {
            image_digest: Self::digest_of(image),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_image_scans_clean() {
        let scanner = MockImageScanner::new();
        let report = scanner.scan("ubuntu:22.04").await.unwrap();
        assert_eq!(report.counts, SeverityCounts::default());
        assert!(report.image_digest.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn test_scripted_report_returned() {
        let scanner = MockImageScanner::new();
        scanner
            .script_counts(
                "bad:latest",
                SeverityCounts {
                    critical: 3,
                    ..Default::default()
                },
            )
            .await;
        let report = scanner.scan("bad:latest").await.unwrap();
        assert_eq!(report.counts.critical, 3);
    }
}
