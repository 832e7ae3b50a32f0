//! Runner candidate domain model.
//!
//! A runner candidate is an ephemeral container runner the router may place
//! a job on. Capacity and load are snapshots taken at routing time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::job::SecurityLevel;

/// Lifecycle status of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Active,
    Idle,
    Busy,
    Draining,
    Maintenance,
    Offline,
    Error,
}

impl Default for RunnerStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Maintenance => "maintenance",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    /// Whether the runner may accept new jobs.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Active | Self::Idle | Self::Busy)
    }
}

/// Physical placement of a runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub region: String,
    pub zone: String,
    pub datacenter: String,
}

/// Declared capacity of a runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerCapacity {
    pub cpu_cores: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    /// GPU type label when the runner carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
}

/// One completed job, as remembered by a runner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub success: bool,
    pub predicted_duration_secs: u64,
    pub actual_duration_secs: u64,
    pub finished_at: DateTime<Utc>,
}

/// Rolling window of the last N completions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceHistory {
    records: VecDeque<CompletionRecord>,
}

impl PerformanceHistory {
    /// Completions retained per runner.
    pub const WINDOW: usize = 50;

    /// Below this many samples, scoring treats the history as neutral.
    pub const MIN_SAMPLES: usize = 5;

    pub fn record(&mut self, record: CompletionRecord) {
        self.records.push_back(record);
        while self.records.len() > Self::WINDOW {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fraction of successful completions, or None below the sample floor.
    pub fn success_rate(&self) -> Option<f64> {
        if self.records.len() < Self::MIN_SAMPLES {
            return None;
        }
        let ok = self.records.iter().filter(|r| r.success).count();
        Some(ok as f64 / self.records.len() as f64)
    }

    /// How close predicted durations track actuals, in [0, 1].
    ///
    /// Each sample contributes `min(pred, actual) / max(pred, actual)`.
    pub fn duration_accuracy(&self) -> Option<f64> {
        if self.records.len() < Self::MIN_SAMPLES {
            return None;
        }
        let sum: f64 = self
            .records
            .iter()
            .map(|r| {
                let (p, a) = (r.predicted_duration_secs as f64, r.actual_duration_secs as f64);
                if p <= 0.0 || a <= 0.0 {
                    0.0
                } else {
                    p.min(a) / p.max(a)
                }
            })
            .sum();
        Some(sum / self.records.len() as f64)
    }
}

/// A runner the router may place a job on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerCandidate {
    pub id: String,
    pub labels: Vec<String>,
    /// Capabilities derived from the runner image and labels.
    pub capabilities: Vec<String>,
    pub capacity: RunnerCapacity,
    /// Load fraction in [0, 1].
    pub current_load: f64,
    pub status: RunnerStatus,
    pub location: Location,
    pub security_level: SecurityLevel,
    /// Relative performance index; 1.0 is baseline.
    pub benchmark_score: f64,
    pub history: PerformanceHistory,
    /// Jobs currently placed on this runner.
    pub active_jobs: u32,
}

impl RunnerCandidate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: Vec::new(),
            capabilities: Vec::new(),
            capacity: RunnerCapacity {
                cpu_cores: 4.0,
                memory_mb: 8192.0,
                disk_mb: 65536.0,
                gpu_type: None,
            },
            current_load: 0.0,
            status: RunnerStatus::Idle,
            location: Location::default(),
            security_level: SecurityLevel::Internal,
            benchmark_score: 1.0,
            history: PerformanceHistory::default(),
            active_jobs: 0,
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities(
        mut self,
        caps: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capacity(mut self, capacity: RunnerCapacity) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.current_load = load.clamp(0.0, 1.0);
        self
    }

    pub fn with_status(mut self, status: RunnerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn with_benchmark_score(mut self, score: f64) -> Self {
        self.benchmark_score = score;
        self
    }

    /// Whether the runner carries a label or capability of this name.
    pub fn matches(&self, selector: &str) -> bool {
        self.labels.iter().any(|l| l == selector)
            || self.capabilities.iter().any(|c| c == selector)
    }

    /// Whether every required selector matches.
    pub fn matches_all<'a>(&self, selectors: impl IntoIterator<Item = &'a String>) -> bool {
        selectors.into_iter().all(|s| self.matches(s))
    }
}
