//! Image scanner port.
//!
//! The scanner binary (Trivy or compatible) is an external collaborator;
//! we depend only on a "scan image, get a report" call.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Vulnerability counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

/// One vulnerability finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub id: String,
    pub severity: String,
    pub package: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
}

/// Report produced by a completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Digest of the scanned image; scan results cache on this.
    pub image_digest: String,
    pub counts: SeverityCounts,
    #[serde(default)]
    pub findings: Vec<ScanFinding>,
    /// Packages present in the image.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Licenses observed in the image.
    #[serde(default)]
    pub licenses: Vec<String>,
}

/// Port to the external image scanner.
#[async_trait]
pub trait ImageScanner: Send + Sync {
    /// Scan an image reference and return the report.
    async fn scan(&self, image: &str) -> Result<ScanReport>;
}
