//! Container engine port.
//!
//! The orchestrator depends on a container engine that can create, start,
//! stop, and remove containers, attach them to networks, update cgroup
//! limits, exec commands, and stream stats. Docker-compatible engines
//! satisfy this; tests use the in-process mock adapter.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Specification for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Tmpfs mounts for memory-mode secret injection.
    #[serde(default)]
    pub tmpfs: Vec<String>,
}

/// Cgroup limit update for a running container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_swap_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blkio_weight: Option<u16>,
}

/// Point-in-time container statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// CPU utilization fraction over the sample window.
    pub cpu_fraction: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub blkio_read_bytes: u64,
    pub blkio_write_bytes: u64,
    /// Per-network rx/tx byte counters.
    pub networks: HashMap<String, (u64, u64)>,
}

/// Result of an exec inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Specification for creating an isolated network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    /// CIDR, e.g. `10.17.42.0/24`.
    pub subnet: String,
    pub gateway: String,
    /// No external routing when set.
    pub internal: bool,
    pub enable_ipv6: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Endpoint options when attaching a container to a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Container inspection summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    #[serde(default)]
    pub networks: Vec<String>,
}

/// Port to the container engine the orchestrator runs jobs on.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container; returns its id.
    async fn create(&self, spec: ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Stop with a grace period before SIGKILL.
    async fn stop(&self, id: &str, grace_period_secs: u64) -> Result<()>;

    async fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Run a command inside the container.
    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput>;

    async fn stats(&self, id: &str) -> Result<ContainerStats>;

    async fn inspect(&self, id: &str) -> Result<ContainerInfo>;

    /// Export the container filesystem as a tar stream, returned as bytes.
    async fn export(&self, id: &str) -> Result<Vec<u8>>;

    async fn update_limits(&self, id: &str, limits: UpdateLimits) -> Result<()>;

    /// Create an isolated network; returns its id.
    async fn create_network(&self, spec: NetworkSpec) -> Result<String>;

    async fn connect_container(
        &self,
        network_id: &str,
        container_id: &str,
        endpoint: EndpointSpec,
    ) -> Result<()>;

    async fn disconnect_container(&self, network_id: &str, container_id: &str) -> Result<()>;

    /// Remove a network. Removing an already removed network is a no-op.
    async fn remove_network(&self, network_id: &str) -> Result<()>;

    /// Networks currently known to the engine.
    async fn list_networks(&self) -> Result<Vec<String>>;
}
