//! Per-job network isolation.
//!
//! Every job gets its own `/24` network, derived deterministically from the
//! job id so re-creation after a crash lands on the same subnet. Strict
//! mode creates internal networks with no external routing.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::ports::{ContainerEngine, EndpointSpec, NetworkSpec};

/// Creates and tears down isolated job networks.
pub struct NetworkIsolation {
    engine: Arc<dyn ContainerEngine>,
    /// Strict mode: networks are internal (no external routing).
    strict: bool,
    enable_ipv6: bool,
    /// job id -> network id for everything we created.
    networks: Mutex<HashMap<Uuid, String>>,
}

impl NetworkIsolation {
    pub fn new(engine: Arc<dyn ContainerEngine>, strict: bool, enable_ipv6: bool) -> Self {
        Self {
            engine,
            strict,
            enable_ipv6,
            networks: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic `/24` subnet and gateway for a job: two digest bytes
    /// select `10.x.y.0/24`, gateway `.1`.
    pub fn subnet_for(job_id: Uuid) -> (String, String) {
        let digest = Sha256::digest(job_id.as_bytes());
        let (x, y) = (digest[0], digest[1]);
        (format!("10.{x}.{y}.0/24"), format!("10.{x}.{y}.1"))
    }

    /// Network name for a job.
    fn network_name(job_id: Uuid) -> String {
        format!("runnerhub-job-{job_id}")
    }

    /// Create the job's isolated network. Creating twice returns the
    /// existing network id.
    pub async fn create_for_job(&self, job_id: Uuid) -> OrchestratorResult<String> {
        {
            let networks = self.networks.lock().await;
            if let Some(existing) = networks.get(&job_id) {
                return Ok(existing.clone());
            }
        }

        let (subnet, gateway) = Self::subnet_for(job_id);
        let spec = NetworkSpec {
            name: Self::network_name(job_id),
            subnet: subnet.clone(),
            gateway,
            internal: self.strict,
            enable_ipv6: self.enable_ipv6,
            labels: HashMap::from([
                ("runnerhub.job".to_string(), job_id.to_string()),
                ("runnerhub.managed".to_string(), "true".to_string()),
            ]),
        };
        let network_id = self
            .engine
            .create_network(spec)
            .await
            .map_err(|err| OrchestratorError::NetworkError(err.to_string()))?;
        info!(job_id = %job_id, network = %network_id, subnet = %subnet, "isolated network created");
        self.networks.lock().await.insert(job_id, network_id.clone());
        Ok(network_id)
    }

    /// Attach the job container to its network.
    pub async fn attach(&self, job_id: Uuid, container_id: &str) -> OrchestratorResult<()> {
        let network_id = {
            let networks = self.networks.lock().await;
            networks
                .get(&job_id)
                .cloned()
                .ok_or_else(|| {
                    OrchestratorError::NetworkError(format!("no network for job {job_id}"))
                })?
        };
        self.engine
            .connect_container(&network_id, container_id, EndpointSpec::default())
            .await
            .map_err(|err| OrchestratorError::NetworkError(err.to_string()))?;
        debug!(job_id = %job_id, container = container_id, "container attached");
        Ok(())
    }

    /// Detach a container from every network we attached it to. Used when
    /// a high-severity threat restricts the job's network access.
    pub async fn detach_all(&self, job_id: Uuid, container_id: &str) -> OrchestratorResult<()> {
        let network_id = {
            let networks = self.networks.lock().await;
            networks.get(&job_id).cloned()
        };
        if let Some(network_id) = network_id {
            self.engine
                .disconnect_container(&network_id, container_id)
                .await
                .map_err(|err| OrchestratorError::NetworkError(err.to_string()))?;
            info!(job_id = %job_id, container = container_id, "container detached from isolated network");
        }
        Ok(())
    }

    /// Remove the job's network. Removing an already removed network is a
    /// no-op.
    pub async fn remove_for_job(&self, job_id: Uuid) -> OrchestratorResult<()> {
        let network_id = self.networks.lock().await.remove(&job_id);
        let Some(network_id) = network_id else {
            return Ok(());
        };
        self.engine
            .remove_network(&network_id)
            .await
            .map_err(|err| OrchestratorError::NetworkError(err.to_string()))?;
        debug!(job_id = %job_id, network = %network_id, "isolated network removed");
        Ok(())
    }

    /// Network id currently held for a job.
    pub async fn network_id(&self, job_id: Uuid) -> Option<String> {
        self.networks.lock().await.get(&job_id).cloned()
    }
}
