//! Job router.
//!
//! Given a job and the current runner-candidate set, selects the best
//! runner. The algorithm is chosen per request from the job's shape;
//! candidates are filtered against hard constraints before any scoring.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{
    AffinityStrength, Job, JobPriority, RunnerCandidate, SecurityLevel,
};

/// Scoring weights for the intelligent algorithm.
const WEIGHT_RESOURCE_FIT: f64 = 0.30;
const WEIGHT_LOAD: f64 = 0.20;
const WEIGHT_CAPABILITY: f64 = 0.25;
const WEIGHT_AFFINITY: f64 = 0.15;
const WEIGHT_HISTORY: f64 = 0.10;

/// Candidates at or above this load are dropped before scoring.
const LOAD_CUTOFF: f64 = 0.8;

/// Routing algorithm chosen per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAlgorithm {
    RoundRobin,
    LeastLoaded,
    ResourceAware,
    Intelligent,
    MlScored,
}

impl RoutingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::ResourceAware => "resource_aware",
            Self::Intelligent => "intelligent",
            Self::MlScored => "ml_scored",
        }
    }

    /// Pick the algorithm for a job.
    pub fn select_for(job: &Job) -> Self {
        let required_caps =
            job.labels.len() + job.constraints.required_capabilities.len();
        if job.priority.at_least(JobPriority::High) && required_caps >= 3 {
            return Self::MlScored;
        }
        if !job.affinity.is_empty() || !job.anti_affinity.is_empty() {
            return Self::Intelligent;
        }
        if job.requirements.cpu.min > 4.0 || job.requirements.memory_mb.min > 8192.0 {
            return Self::ResourceAware;
        }
        if job.priority == JobPriority::Normal {
            return Self::LeastLoaded;
        }
        Self::RoundRobin
    }
}

/// Metrics attached to every routing result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetrics {
    pub candidates_considered: usize,
    pub filtered_out: usize,
    pub cache_hit: bool,
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingResult {
    pub runner_id: String,
    /// Ranked alternatives with their scores, best first.
    pub alternatives: Vec<(String, f64)>,
    pub confidence: f64,
    pub algorithm: RoutingAlgorithm,
    pub reasoning: String,
    pub metrics: RoutingMetrics,
}

/// Counter snapshot for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub routed_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Cached decision, revalidated against the live candidate set.
#[derive(Clone)]
struct CacheEntry {
    runner_id: String,
    confidence: f64,
    algorithm: RoutingAlgorithm,
}

/// Bounded LRU over routing cache keys.
struct RoutingCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RoutingCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key).cloned()?;
        // Refresh recency.
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
        Some(entry)
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        if self.entries.insert(key.clone(), entry).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            } else {
                break;
            }
        }
    }
}

struct RouterState {
    cache: RoutingCache,
    round_robin_cursor: usize,
    stats: RouterStats,
}

/// Selects runners for jobs.
pub struct Router {
    state: Mutex<RouterState>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Router {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            state: Mutex::new(RouterState {
                cache: RoutingCache::new(cache_capacity),
                round_robin_cursor: 0,
                stats: RouterStats::default(),
            }),
        }
    }

    /// Route a job onto one of the candidates. `preferred_runner` comes
    /// from sticky sessions and wins when it survives constraint filtering.
    pub async fn route(
        &self,
        job: &Job,
        candidates: &[RunnerCandidate],
        preferred_runner: Option<&str>,
    ) -> OrchestratorResult<RoutingResult> {
        // The allowlist is mandatory for restricted jobs; checked before
        // general validation so the caller sees the routing failure mode.
        if job.security_level == SecurityLevel::Restricted
            && job.constraints.allowed_runners.is_empty()
        {
            return Err(OrchestratorError::NoEligibleRunner(job.id));
        }
        job.validate()
            .map_err(OrchestratorError::ValidationError)?;
        if candidates.is_empty() {
            return Err(OrchestratorError::NoCandidates);
        }

        let eligible = Self::filter_candidates(job, candidates)?;
        let filtered_out = candidates.len() - eligible.len();
        let algorithm = RoutingAlgorithm::select_for(job);

        // A pinned runner that is still eligible short-circuits scoring.
        if let Some(preferred) = preferred_runner {
            if let Some(runner) = eligible.iter().find(|r| r.id == preferred) {
                let mut state = self.state.lock().await;
                state.stats.routed_total += 1;
                return Ok(RoutingResult {
                    runner_id: runner.id.clone(),
                    alternatives: Vec::new(),
                    confidence: (1.0 - runner.current_load).max(0.5),
                    algorithm,
                    reasoning: format!("sticky preference for {}", runner.id),
                    metrics: RoutingMetrics {
                        candidates_considered: candidates.len(),
                        filtered_out,
                        cache_hit: false,
                    },
                });
            }
        }

        let cache_key = Self::cache_key(job);
        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.cache.get(&cache_key) {
                if eligible.iter().any(|r| r.id == entry.runner_id) {
                    state.stats.cache_hits += 1;
                    state.stats.routed_total += 1;
                    return Ok(RoutingResult {
                        runner_id: entry.runner_id.clone(),
                        alternatives: Vec::new(),
                        confidence: entry.confidence,
                        algorithm: entry.algorithm,
                        reasoning: "cached decision".to_string(),
                        metrics: RoutingMetrics {
                            candidates_considered: candidates.len(),
                            filtered_out,
                            cache_hit: true,
                        },
                    });
                }
            }
            state.stats.cache_misses += 1;
        }

        let (scored, reasoning) = match algorithm {
            RoutingAlgorithm::RoundRobin => {
                let mut state = self.state.lock().await;
                let ix = state.round_robin_cursor % eligible.len();
                state.round_robin_cursor = state.round_robin_cursor.wrapping_add(1);
                let scored = vec![(eligible[ix].clone(), 0.5)];
                (scored, "round-robin rotation".to_string())
            }
            RoutingAlgorithm::LeastLoaded => {
                let mut scored: Vec<(RunnerCandidate, f64)> = eligible
                    .iter()
                    .map(|r| ((*r).clone(), 1.0 - r.current_load))
                    .collect();
                Self::sort_scored(&mut scored);
                (scored, "least current load".to_string())
            }
            RoutingAlgorithm::ResourceAware => {
                let mut scored: Vec<(RunnerCandidate, f64)> = eligible
                    .iter()
                    .map(|r| {
                        let fit = Self::resource_fit(job, r);
                        ((*r).clone(), fit * 0.7 + (1.0 - r.current_load) * 0.3)
                    })
                    .collect();
                Self::sort_scored(&mut scored);
                (scored, "resource fit with load tiebreak".to_string())
            }
            RoutingAlgorithm::Intelligent => {
                let mut scored: Vec<(RunnerCandidate, f64)> = eligible
                    .iter()
                    .map(|r| ((*r).clone(), Self::intelligent_score(job, r)))
                    .collect();
                Self::sort_scored(&mut scored);
                (
                    scored,
                    "weighted fit/load/capability/affinity/history".to_string(),
                )
            }
            RoutingAlgorithm::MlScored => {
                let mut scored: Vec<(RunnerCandidate, f64)> = eligible
                    .iter()
                    .map(|r| ((*r).clone(), Self::ml_score(job, r)))
                    .collect();
                Self::sort_scored(&mut scored);
                (scored, "logistic feature scoring".to_string())
            }
        };

        let (winner, winner_score) = scored
            .first()
            .cloned()
            .ok_or(OrchestratorError::NoEligibleRunner(job.id))?;
        let alternatives: Vec<(String, f64)> = scored
            .iter()
            .skip(1)
            .take(3)
            .map(|(r, s)| (r.id.clone(), *s))
            .collect();
        let confidence = winner_score.clamp(0.0, 1.0);

        debug!(
            job_id = %job.id,
            runner = %winner.id,
            algorithm = algorithm.as_str(),
            confidence,
            "routed job"
        );

        let mut state = self.state.lock().await;
        state.stats.routed_total += 1;
        state.cache.insert(
            cache_key,
            CacheEntry {
                runner_id: winner.id.clone(),
                confidence,
                algorithm,
            },
        );

        Ok(RoutingResult {
            runner_id: winner.id.clone(),
            alternatives,
            confidence,
            algorithm,
            reasoning,
            metrics: RoutingMetrics {
                candidates_considered: candidates.len(),
                filtered_out,
                cache_hit: false,
            },
        })
    }

    pub async fn stats(&self) -> RouterStats {
        self.state.lock().await.stats
    }

    /// Hard constraint filter applied before any scoring.
    fn filter_candidates<'a>(
        job: &Job,
        candidates: &'a [RunnerCandidate],
    ) -> OrchestratorResult<Vec<&'a RunnerCandidate>> {
        if job.security_level == SecurityLevel::Restricted
            && job.constraints.allowed_runners.is_empty()
        {
            return Err(OrchestratorError::NoEligibleRunner(job.id));
        }

        let eligible: Vec<&RunnerCandidate> = candidates
            .iter()
            .filter(|r| r.status.is_schedulable())
            .filter(|r| {
                job.constraints.allowed_runners.is_empty()
                    || job.constraints.allowed_runners.iter().any(|a| a == &r.id)
            })
            .filter(|r| !job.constraints.blocked_runners.iter().any(|b| b == &r.id))
            .filter(|r| r.matches_all(&job.labels))
            .filter(|r| r.matches_all(&job.constraints.required_capabilities))
            .filter(|r| {
                job.constraints
                    .min_security_level
                    .map_or(true, |min| r.security_level >= min)
            })
            .filter(|r| r.current_load < LOAD_CUTOFF)
            .collect();

        if eligible.is_empty() {
            return Err(OrchestratorError::NoEligibleRunner(job.id));
        }
        Ok(eligible)
    }

    /// Deterministic cache key over the job attributes that affect routing.
    fn cache_key(job: &Job) -> String {
        let mut labels = job.labels.clone();
        labels.sort();
        let material = serde_json::json!({
            "labels": labels,
            "requirements": job.requirements,
            "constraints": job.constraints,
            "affinity": job.affinity,
            "anti_affinity": job.anti_affinity,
        });
        let digest = Sha256::digest(material.to_string().as_bytes());
        base64::engine::general_purpose::STANDARD.encode(digest)
    }

    /// Resource fit in [0, 1]: slight over-provisioning is rewarded,
    /// under-provisioning penalised.
    fn resource_fit(job: &Job, runner: &RunnerCandidate) -> f64 {
        let classes = [
            (runner.capacity.cpu_cores, job.requirements.cpu.preferred),
            (runner.capacity.memory_mb, job.requirements.memory_mb.preferred),
            (runner.capacity.disk_mb, job.requirements.disk_mb.preferred),
        ];
        let mut sum = 0.0;
        let mut count = 0usize;
        for (capacity, needed) in classes {
            if needed <= 0.0 {
                continue;
            }
            let ratio = capacity / needed;
            let score = if ratio >= 1.0 {
                (2.0 - ratio).clamp(0.0, 1.0)
            } else {
                ratio * 0.7
            };
            sum += score;
            count += 1;
        }
        if count == 0 {
            1.0
        } else {
            sum / count as f64
        }
    }

    /// Fraction of required labels and capabilities present.
    fn capability_match(job: &Job, runner: &RunnerCandidate) -> f64 {
        let required: Vec<&String> = job
            .labels
            .iter()
            .chain(job.constraints.required_capabilities.iter())
            .collect();
        if required.is_empty() {
            return 1.0;
        }
        let matched = required.iter().filter(|s| runner.matches(s)).count();
        matched as f64 / required.len() as f64
    }

    /// Affinity score: matched hard rules at 0.5 each, soft rules at their
    /// own weight; anti-affinity matches subtract the same way.
    fn affinity_score(job: &Job, runner: &RunnerCandidate) -> f64 {
        let mut score: f64 = 0.0;
        for rule in &job.affinity {
            if runner.matches(&rule.label) {
                score += match rule.strength {
                    AffinityStrength::Hard => 0.5,
                    AffinityStrength::Soft => rule.weight,
                };
            }
        }
        for rule in &job.anti_affinity {
            if runner.matches(&rule.label) {
                score -= match rule.strength {
                    AffinityStrength::Hard => 0.5,
                    AffinityStrength::Soft => 0.25,
                };
            }
        }
        score.clamp(0.0, 1.0)
    }

    /// History score: `0.6·success_rate + 0.4·duration_accuracy`, neutral
    /// 0.5 below five prior runs.
    fn history_score(runner: &RunnerCandidate) -> f64 {
        match (
            runner.history.success_rate(),
            runner.history.duration_accuracy(),
        ) {
            (Some(success), Some(accuracy)) => 0.6 * success + 0.4 * accuracy,
            _ => 0.5,
        }
    }

    fn intelligent_score(job: &Job, runner: &RunnerCandidate) -> f64 {
        WEIGHT_RESOURCE_FIT * Self::resource_fit(job, runner)
            + WEIGHT_LOAD * (1.0 - runner.current_load)
            + WEIGHT_CAPABILITY * Self::capability_match(job, runner)
            + WEIGHT_AFFINITY * Self::affinity_score(job, runner)
            + WEIGHT_HISTORY * Self::history_score(runner)
    }

    /// ML-style score: the intelligent feature vector pushed through a
    /// logistic squash with history weighted up, so well-known runners
    /// separate from cold ones.
    fn ml_score(job: &Job, runner: &RunnerCandidate) -> f64 {
        let features = [
            (Self::resource_fit(job, runner), 1.2),
            (1.0 - runner.current_load, 0.8),
            (Self::capability_match(job, runner), 1.4),
            (Self::affinity_score(job, runner), 0.6),
            (Self::history_score(runner), 1.6),
            (runner.benchmark_score.min(2.0) / 2.0, 0.4),
        ];
        let activation: f64 = features.iter().map(|(v, w)| v * w).sum::<f64>() - 3.0;
        1.0 / (1.0 + (-activation).exp())
    }

    /// Descending score; ties broken by lower load, then higher benchmark
    /// score, then lexicographic runner id.
    fn sort_scored(scored: &mut [(RunnerCandidate, f64)]) {
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.current_load
                        .partial_cmp(&b.current_load)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| {
                    b.benchmark_score
                        .partial_cmp(&a.benchmark_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}
