//! In-memory container engine.
//!
//! Backs tests and local dry-runs. Containers and networks are plain maps;
//! exec output is scripted per command so runtime-monitor rules can be
//! exercised without a real engine.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::domain::ports::{
    ContainerEngine, ContainerInfo, ContainerSpec, ContainerStats, EndpointSpec, ExecOutput,
    NetworkSpec, UpdateLimits,
};

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
    removed: bool,
    limits: UpdateLimits,
}

#[derive(Debug, Clone)]
struct MockNetwork {
    spec: NetworkSpec,
    members: HashSet<String>,
    removed: bool,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, MockNetwork>,
    stats: HashMap<String, ContainerStats>,
    /// Scripted exec outputs matched by the first argv element.
    exec_outputs: HashMap<String, ExecOutput>,
    last_network_spec: Option<NetworkSpec>,
}

/// Mock engine with scriptable exec and stats.
pub struct MockContainerEngine {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl Default for MockContainerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Script the output of `exec` calls whose argv starts with `command`.
    pub async fn script_exec(&self, command: impl Into<String>, output: ExecOutput) {
        self.state
            .lock()
            .await
            .exec_outputs
            .insert(command.into(), output);
    }

    /// Set the stats sample returned for a container.
    pub async fn set_stats(&self, container_id: &str, stats: ContainerStats) {
        self.state
            .lock()
            .await
            .stats
            .insert(container_id.to_string(), stats);
    }

    pub async fn is_running(&self, container_id: &str) -> bool {
        self.state
            .lock()
            .await
            .containers
            .get(container_id)
            .is_some_and(|c| c.running && !c.removed)
    }

    pub async fn is_removed(&self, container_id: &str) -> bool {
        self.state
            .lock()
            .await
            .containers
            .get(container_id)
            .is_none_or(|c| c.removed)
    }

    pub async fn container_env(&self, container_id: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .await
            .containers
            .get(container_id)
            .map(|c| c.spec.env.clone())
            .unwrap_or_default()
    }

    pub async fn container_limits(&self, container_id: &str) -> UpdateLimits {
        self.state
            .lock()
            .await
            .containers
            .get(container_id)
            .map(|c| c.limits)
            .unwrap_or_default()
    }

    pub async fn last_network_spec(&self) -> Option<NetworkSpec> {
        self.state.lock().await.last_network_spec.clone()
    }

    pub async fn network_members(&self, network_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .networks
            .get(network_id)
            .map(|n| n.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn network_removed(&self, network_id: &str) -> bool {
        self.state
            .lock()
            .await
            .networks
            .get(network_id)
            .is_none_or(|n| n.removed)
    }
}

#[async_trait]
impl ContainerEngine for MockContainerEngine {
    async fn create(&self, spec: ContainerSpec) -> Result<String> {
        let id = self.fresh_id("ctr");
        self.state.lock().await.containers.insert(
            id.clone(),
            MockContainer {
                spec,
                running: false,
                removed: false,
                limits: UpdateLimits::default(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        if container.removed {
            return Err(anyhow!("container removed: {id}"));
        }
        container.running = true;
        Ok(())
    }

    async fn stop(&self, id: &str, _grace_period_secs: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        container.running = false;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        if container.running && !force {
            return Err(anyhow!("container still running: {id}"));
        }
        container.running = false;
        container.removed = true;
        Ok(())
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput> {
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        if !container.running {
            return Err(anyhow!("container not running: {id}"));
        }
        let key = argv.first().cloned().unwrap_or_default();
        Ok(state.exec_outputs.get(&key).cloned().unwrap_or_default())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let state = self.state.lock().await;
        if !state.containers.contains_key(id) {
            return Err(anyhow!("no such container: {id}"));
        }
        Ok(state.stats.get(id).cloned().unwrap_or_default())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let state = self.state.lock().await;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        let networks = state
            .networks
            .iter()
            .filter(|(_, n)| n.members.contains(id))
            .map(|(net_id, _)| net_id.clone())
            .collect();
        Ok(ContainerInfo {
            id: id.to_string(),
            name: container.spec.name.clone(),
            image: container.spec.image.clone(),
            running: container.running,
            networks,
        })
    }

    async fn export(&self, id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        if !state.containers.contains_key(id) {
            return Err(anyhow!("no such container: {id}"));
        }
        // A token tar payload is enough for forensics-path tests.
        Ok(format!("tar-export:{id}").into_bytes())
    }

    async fn update_limits(&self, id: &str, limits: UpdateLimits) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| anyhow!("no such container: {id}"))?;
        container.limits = limits;
        Ok(())
    }

    async fn create_network(&self, spec: NetworkSpec) -> Result<String> {
        let id = self.fresh_id("net");
        let mut state = self.state.lock().await;
        state.last_network_spec = Some(spec.clone());
        state.networks.insert(
            id.clone(),
            MockNetwork {
                spec,
                members: HashSet::new(),
                removed: false,
            },
        );
        Ok(id)
    }

    async fn connect_container(
        &self,
        network_id: &str,
        container_id: &str,
        _endpoint: EndpointSpec,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let network = state
            .networks
            .get_mut(network_id)
            .ok_or_else(|| anyhow!("no such network: {network_id}"))?;
        if network.removed {
            return Err(anyhow!("network removed: {network_id}"));
        }
        network.members.insert(container_id.to_string());
        Ok(())
    }

    async fn disconnect_container(&self, network_id: &str, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(network) = state.networks.get_mut(network_id) {
            network.members.remove(container_id);
        }
        Ok(())
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        // Removing an unknown or already removed network is a no-op.
        if let Some(network) = state.networks.get_mut(network_id) {
            network.members.clear();
            network.removed = true;
        }
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .await
            .networks
            .iter()
            .filter(|(_, n)| !n.removed)
            .map(|(id, _)| id.clone())
            .collect())
    }
}
