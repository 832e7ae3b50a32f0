//! Runtime container monitoring.
//!
//! Samples each job container on an interval: enumerates processes and
//! listening sockets, checks file integrity against a start-of-job
//! baseline, and reads resource stats. Rule hits and threshold breaches
//! become threat events on the orchestrator's channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::models::{ThreatEvent, ThreatKind, ThreatSeverity};
use crate::domain::ports::ContainerEngine;

/// Detection rules evaluated per sample.
#[derive(Debug, Clone)]
pub struct MonitorRules {
    /// Process command substrings that indicate tampering tools.
    pub suspicious_processes: Vec<String>,
    /// Process command substrings that indicate cryptomining.
    pub cryptomining_processes: Vec<String>,
    /// Listening ports that indicate mining pools or reverse shells.
    pub suspicious_ports: Vec<u16>,
    /// Files whose digests are baselined at start and re-checked.
    pub watched_files: Vec<String>,
    /// CPU fraction above which a resource-abuse threat is raised.
    pub cpu_threshold: f64,
    /// Memory fraction (of the container limit) above which abuse fires.
    pub memory_threshold: f64,
}

impl Default for MonitorRules {
    fn default() -> Self {
        Self {
            suspicious_processes: vec![
                "nmap".to_string(),
                "masscan".to_string(),
                "tcpdump".to_string(),
                "socat".to_string(),
                "ncat".to_string(),
            ],
            cryptomining_processes: vec![
                "xmrig".to_string(),
                "minerd".to_string(),
                "cgminer".to_string(),
                "ethminer".to_string(),
                "cpuminer".to_string(),
            ],
            suspicious_ports: vec![3333, 4444, 5555, 7777, 14444, 31337],
            watched_files: vec![
                "/etc/passwd".to_string(),
                "/etc/shadow".to_string(),
                "/etc/sudoers".to_string(),
            ],
            cpu_threshold: 0.95,
            memory_threshold: 0.95,
        }
    }
}

struct Session {
    container_id: String,
    job_id: Uuid,
    task: JoinHandle<()>,
}

/// Periodic in-container sampler.
pub struct RuntimeMonitor {
    engine: Arc<dyn ContainerEngine>,
    rules: MonitorRules,
    interval: Duration,
    threat_tx: mpsc::Sender<ThreatEvent>,
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl RuntimeMonitor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        rules: MonitorRules,
        interval: Duration,
        threat_tx: mpsc::Sender<ThreatEvent>,
    ) -> Self {
        Self {
            engine,
            rules,
            interval,
            threat_tx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin monitoring a container. Returns the monitoring handle.
    pub async fn start(&self, job_id: Uuid, container_id: &str) -> Uuid {
        let handle = Uuid::new_v4();
        let baseline = Self::file_baseline(
            self.engine.as_ref(),
            container_id,
            &self.rules.watched_files,
        )
        .await;

        let engine = self.engine.clone();
        let rules = self.rules.clone();
        let interval = self.interval;
        let threat_tx = self.threat_tx.clone();
        let container = container_id.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let threats =
                    Self::sample_once(engine.as_ref(), &rules, job_id, &container, &baseline)
                        .await;
                for threat in threats {
                    if threat_tx.send(threat).await.is_err() {
                        return;
                    }
                }
            }
        });

        self.sessions.lock().await.insert(
            handle,
            Session {
                container_id: container_id.to_string(),
                job_id,
                task,
            },
        );
        debug!(job_id = %job_id, container = container_id, "runtime monitoring started");
        handle
    }

    /// Stop a monitoring session. Stopping twice is a no-op.
    pub async fn stop(&self, handle: Uuid) {
        if let Some(session) = self.sessions.lock().await.remove(&handle) {
            session.task.abort();
            debug!(job_id = %session.job_id, container = %session.container_id, "runtime monitoring stopped");
        }
    }

    /// Digest baseline for the watched files.
    async fn file_baseline(
        engine: &dyn ContainerEngine,
        container_id: &str,
        watched: &[String],
    ) -> HashMap<String, String> {
        let mut argv = vec!["sha256sum".to_string()];
        argv.extend(watched.iter().cloned());
        match engine.exec(container_id, &argv).await {
            Ok(output) => Self::parse_digests(&output.stdout),
            Err(_) => HashMap::new(),
        }
    }

    /// Parse `sha256sum` output lines: `<digest>  <path>`.
    fn parse_digests(stdout: &str) -> HashMap<String, String> {
        let mut digests = HashMap::new();
        for line in stdout.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(digest), Some(path)) = (parts.next(), parts.next()) {
                digests.insert(path.to_string(), digest.to_string());
            }
        }
        digests
    }

    /// One full sample pass. Public for deterministic tests; the loop
    /// calls this on every tick.
    pub async fn sample_once(
        engine: &dyn ContainerEngine,
        rules: &MonitorRules,
        job_id: Uuid,
        container_id: &str,
        baseline: &HashMap<String, String>,
    ) -> Vec<ThreatEvent> {
        let mut threats = Vec::new();

        // Process sweep.
        if let Ok(output) = engine
            .exec(container_id, &["ps".to_string(), "-eo".to_string(), "pid,comm,args".to_string()])
            .await
        {
            for line in output.stdout.lines().skip(1) {
                let lowered = line.to_lowercase();
                for pattern in &rules.cryptomining_processes {
                    if lowered.contains(pattern) {
                        threats.push(ThreatEvent::new(
                            job_id,
                            ThreatKind::Cryptomining,
                            ThreatSeverity::Critical,
                            format!("mining process observed: {}", line.trim()),
                        ));
                    }
                }
                for pattern in &rules.suspicious_processes {
                    if lowered.contains(pattern) {
                        threats.push(ThreatEvent::new(
                            job_id,
                            ThreatKind::SuspiciousProcess,
                            ThreatSeverity::High,
                            format!("suspicious process observed: {}", line.trim()),
                        ));
                    }
                }
            }
        }

        // Socket sweep.
        if let Ok(output) = engine
            .exec(container_id, &["ss".to_string(), "-tlnp".to_string()])
            .await
        {
            for port in &rules.suspicious_ports {
                let needle = format!(":{port}");
                if output
                    .stdout
                    .lines()
                    .any(|line| line.split_whitespace().any(|col| col.ends_with(&needle)))
                {
                    threats.push(ThreatEvent::new(
                        job_id,
                        ThreatKind::SuspiciousPort,
                        ThreatSeverity::High,
                        format!("listener on suspicious port {port}"),
                    ));
                }
            }
        }

        // File integrity.
        if !baseline.is_empty() {
            let current =
                Self::file_baseline(engine, container_id, &rules.watched_files).await;
            for (path, digest) in baseline {
                match current.get(path) {
                    Some(now) if now == digest => {}
                    Some(_) => threats.push(ThreatEvent::new(
                        job_id,
                        ThreatKind::FileIntegrity,
                        ThreatSeverity::Critical,
                        format!("watched file modified: {path}"),
                    )),
                    None => threats.push(ThreatEvent::new(
                        job_id,
                        ThreatKind::FileIntegrity,
                        ThreatSeverity::High,
                        format!("watched file missing: {path}"),
                    )),
                }
            }
        }

        // Resource stats.
        if let Ok(stats) = engine.stats(container_id).await {
            if stats.cpu_fraction > rules.cpu_threshold {
                threats.push(ThreatEvent::new(
                    job_id,
                    ThreatKind::ResourceAbuse,
                    ThreatSeverity::Medium,
                    format!("cpu at {:.0}% of limit", stats.cpu_fraction * 100.0),
                ));
            }
            if stats.memory_limit_bytes > 0 {
                let fraction = stats.memory_bytes as f64 / stats.memory_limit_bytes as f64;
                if fraction > rules.memory_threshold {
                    threats.push(ThreatEvent::new(
                        job_id,
                        ThreatKind::ResourceAbuse,
                        ThreatSeverity::Medium,
                        format!("memory at {:.0}% of limit", fraction * 100.0),
                    ));
                }
            }
        }

        if !threats.is_empty() {
            warn!(
                job_id = %job_id,
                container = container_id,
                count = threats.len(),
                "threats observed in sample"
            );
        }
        threats
    }

    /// Active session count, for health reporting.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
