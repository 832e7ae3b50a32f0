//! Image scan policy.
//!
//! Submits images to the external scanner, caches reports per image
//! digest, and applies the configured thresholds. Severity precedence is
//! fixed: critical counts block before high is evaluated, high before
//! medium.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::ScannerPolicyConfig;
use crate::domain::ports::{ImageScanner, ScanReport};

/// Verdict of a policy evaluation over a scan report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanVerdict {
    Pass,
    /// The image is blocked; the reason names the first threshold crossed.
    Blocked { reason: String },
}

impl ScanVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Scan outcome handed to the security orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub report: ScanReport,
    pub verdict: ScanVerdict,
    pub cache_hit: bool,
}

/// Policy layer over the scanner port, with a per-digest report cache.
pub struct ScanPolicy {
    scanner: Arc<dyn ImageScanner>,
    config: ScannerPolicyConfig,
    cache: Mutex<HashMap<String, ScanReport>>,
}

impl ScanPolicy {
    pub fn new(scanner: Arc<dyn ImageScanner>, config: ScannerPolicyConfig) -> Self {
        Self {
            scanner,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Scan (or reuse a cached report for) an image and evaluate policy.
    pub async fn evaluate(&self, image: &str) -> OrchestratorResult<ScanOutcome> {
        // The cache is keyed by digest; an image reference maps onto its
        // last seen digest through a scan, so probe by reference first.
        if let Some(report) = self.cache.lock().await.get(image).cloned() {
            let verdict = self.apply_policy(&report);
            return Ok(ScanOutcome {
                report,
                verdict,
                cache_hit: true,
            });
        }

        let report = self.scanner.scan(image).await.map_err(|err| {
            OrchestratorError::ScanFailed {
                image: image.to_string(),
                reason: err.to_string(),
            }
        })?;
        debug!(
            image,
            digest = %report.image_digest,
            critical = report.counts.critical,
            high = report.counts.high,
            "image scanned"
        );
        self.cache
            .lock()
            .await
            .insert(image.to_string(), report.clone());

        let verdict = self.apply_policy(&report);
        if let ScanVerdict::Blocked { reason } = &verdict {
            warn!(image, reason, "image blocked by scan policy");
        }
        Ok(ScanOutcome {
            report,
            verdict,
            cache_hit: false,
        })
    }

    /// Evaluate thresholds in severity order, then bans and licensing.
    fn apply_policy(&self, report: &ScanReport) -> ScanVerdict {
        if report.counts.critical > self.config.max_critical {
            return ScanVerdict::Blocked {
                reason: format!(
                    "{} critical vulnerabilities exceed limit {}",
                    report.counts.critical, self.config.max_critical
                ),
            };
        }
        if report.counts.high > self.config.max_high {
            return ScanVerdict::Blocked {
                reason: format!(
                    "{} high vulnerabilities exceed limit {}",
                    report.counts.high, self.config.max_high
                ),
            };
        }
        if report.counts.medium > self.config.max_medium {
            return ScanVerdict::Blocked {
                reason: format!(
                    "{} medium vulnerabilities exceed limit {}",
                    report.counts.medium, self.config.max_medium
                ),
            };
        }

        for package in &report.packages {
            if self.config.banned_packages.iter().any(|b| b == package) {
                return ScanVerdict::Blocked {
                    reason: format!("banned package present: {package}"),
                };
            }
        }

        if !self.config.allowed_licenses.is_empty() {
            for license in &report.licenses {
                if !self.config.allowed_licenses.iter().any(|a| a == license) {
                    return ScanVerdict::Blocked {
                        reason: format!("unapproved license: {license}"),
                    };
                }
            }
        }

        ScanVerdict::Pass
    }

    /// Drop the cached report for an image (e.g. after a rebuild).
    pub async fn invalidate(&self, image: &str) {
        self.cache.lock().await.remove(image);
    }
}
