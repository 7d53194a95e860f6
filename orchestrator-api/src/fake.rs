//! An in memory orchestrator for tests

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::Orchestrator;
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceKey, NullInt64, TopologyRecovery};

/// The state of the fake orchestrator
#[derive(Debug, Default)]
struct State {
    /// Instances by cluster alias
    clusters: HashMap<String, Vec<Instance>>,
    /// Recoveries by cluster alias
    recoveries: HashMap<String, Vec<TopologyRecovery>>,
    /// Hosts passed to `discover`
    discovered: Vec<InstanceKey>,
    /// Hosts passed to `forget`
    forgotten: Vec<InstanceKey>,
    /// Acknowledged recovery ids
    acked: Vec<i64>,
    /// Hosts set writable, in call order
    writable: Vec<InstanceKey>,
    /// Hosts set read only, in call order
    read_only: Vec<InstanceKey>,
    /// Next recovery id
    next_id: i64,
    /// Whether every call fails
    unreachable: bool,
}

/// An orchestrator keeping its topology in memory
#[derive(Debug, Default)]
pub struct FakeOrchestrator {
    /// State
    state: Mutex<State>,
}

/// The error orchestrator replies with for an unknown cluster
fn cluster_not_found(cluster_hint: &str) -> Error {
    Error::Status {
        status: 500,
        message: format!("Unable to determine cluster name. clusterHint={cluster_hint}"),
    }
}

impl FakeOrchestrator {
    /// New an empty orchestrator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance to a cluster.
    /// A `master` instance is writable and replicates from nobody, others
    /// replicate from `master_host`. `lag` of `None` means the lag is unknown.
    #[inline]
    #[allow(clippy::too_many_arguments)] // mirrors the instance flags
    pub async fn add_instance(
        &self,
        cluster: &str,
        host: &str,
        master: bool,
        master_host: &str,
        lag: Option<i64>,
        replicating: bool,
        up_to_date: bool,
    ) {
        let instance = Instance {
            key: InstanceKey::new(host, 3306),
            uptime: 3600,
            read_only: !master,
            master_key: if master {
                InstanceKey::default()
            } else {
                InstanceKey::new(master_host, 3306)
            },
            slave_io_running: replicating,
            slave_sql_running: replicating,
            seconds_behind_master: lag.map(NullInt64::some).unwrap_or_default(),
            cluster_name: cluster.to_owned(),
            is_last_check_valid: up_to_date,
            is_up_to_date: up_to_date,
            ..Instance::default()
        };
        self.insert_instance(cluster, instance).await;
    }

    /// Add a raw instance to a cluster
    #[inline]
    pub async fn insert_instance(&self, cluster: &str, instance: Instance) {
        self.state
            .lock()
            .await
            .clusters
            .entry(cluster.to_owned())
            .or_default()
            .push(instance);
    }

    /// Remove an instance, the cluster is dropped with its last instance
    #[inline]
    pub async fn remove_instance(&self, cluster: &str, host: &str) {
        let mut state = self.state.lock().await;
        let Some(instances) = state.clusters.get_mut(cluster) else {
            return;
        };
        instances.retain(|inst| inst.key.hostname != host);
        if instances.is_empty() {
            let _ig = state.clusters.remove(cluster);
        }
    }

    /// Add a recovery to a cluster, returns its id
    #[inline]
    pub async fn add_recovery(&self, cluster: &str, acked: bool, active: bool) -> i64 {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.saturating_add(1);
        let id = state.next_id;
        state
            .recoveries
            .entry(cluster.to_owned())
            .or_default()
            .push(TopologyRecovery {
                id,
                acknowledged: acked,
                is_active: active,
                is_successful: !active,
                recovery_start_timestamp: "2018-05-16T13:15:05Z".to_owned(),
                ..TopologyRecovery::default()
            });
        id
    }

    /// Make every call fail
    #[inline]
    pub async fn make_unreachable(&self) {
        self.state.lock().await.unreachable = true;
    }

    /// Hosts passed to `discover`
    #[inline]
    pub async fn discovered(&self) -> Vec<InstanceKey> {
        self.state.lock().await.discovered.clone()
    }

    /// Hosts passed to `forget`
    #[inline]
    pub async fn forgotten(&self) -> Vec<InstanceKey> {
        self.state.lock().await.forgotten.clone()
    }

    /// Acknowledged recovery ids
    #[inline]
    pub async fn acked(&self) -> Vec<i64> {
        self.state.lock().await.acked.clone()
    }

    /// Hosts set writable
    #[inline]
    pub async fn writable_calls(&self) -> Vec<InstanceKey> {
        self.state.lock().await.writable.clone()
    }

    /// Hosts set read only
    #[inline]
    pub async fn read_only_calls(&self) -> Vec<InstanceKey> {
        self.state.lock().await.read_only.clone()
    }

    /// Fail when unreachable
    fn check_reachable(state: &State) -> Result<()> {
        if state.unreachable {
            return Err(Error::Status {
                status: 503,
                message: "orchestrator is unreachable".to_owned(),
            });
        }
        Ok(())
    }

    /// Set the read only flag of a host in every cluster
    fn set_read_only_flag(state: &mut State, key: &InstanceKey, read_only: bool) {
        state
            .clusters
            .values_mut()
            .flatten()
            .filter(|inst| inst.key == *key)
            .for_each(|inst| inst.read_only = read_only);
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn discover(&self, host: &str, port: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_reachable(&state)?;
        state.discovered.push(InstanceKey::new(host, port));
        Ok(())
    }

    async fn forget(&self, host: &str, port: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_reachable(&state)?;
        let key = InstanceKey::new(host, port);
        state
            .clusters
            .values_mut()
            .for_each(|instances| instances.retain(|inst| inst.key != key));
        state.clusters.retain(|_, instances| !instances.is_empty());
        state.forgotten.push(key);
        Ok(())
    }

    async fn master(&self, cluster_hint: &str) -> Result<Instance> {
        let state = self.state.lock().await;
        Self::check_reachable(&state)?;
        let instances = state
            .clusters
            .get(cluster_hint)
            .ok_or_else(|| cluster_not_found(cluster_hint))?;
        instances
            .iter()
            .find(|inst| !inst.read_only)
            .cloned()
            .ok_or_else(|| Error::Status {
                status: 500,
                message: format!("No masters found for cluster {cluster_hint}"),
            })
    }

    async fn cluster(&self, cluster_hint: &str) -> Result<Vec<Instance>> {
        let state = self.state.lock().await;
        Self::check_reachable(&state)?;
        state
            .clusters
            .get(cluster_hint)
            .cloned()
            .ok_or_else(|| cluster_not_found(cluster_hint))
    }

    async fn audit_recovery(&self, cluster_hint: &str) -> Result<Vec<TopologyRecovery>> {
        let state = self.state.lock().await;
        Self::check_reachable(&state)?;
        if !state.clusters.contains_key(cluster_hint) {
            return Err(cluster_not_found(cluster_hint));
        }
        Ok(state
            .recoveries
            .get(cluster_hint)
            .cloned()
            .unwrap_or_default())
    }

    async fn ack_recovery(&self, id: i64, comment: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_reachable(&state)?;
        for recovery in state.recoveries.values_mut().flatten() {
            if recovery.id == id {
                recovery.acknowledged = true;
                recovery.acknowledged_comment = comment.to_owned();
            }
        }
        state.acked.push(id);
        Ok(())
    }

    async fn set_host_writable(&self, key: &InstanceKey) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_reachable(&state)?;
        Self::set_read_only_flag(&mut state, key, false);
        state.writable.push(key.clone());
        Ok(())
    }

    async fn set_host_read_only(&self, key: &InstanceKey) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_reachable(&state)?;
        Self::set_read_only_flag(&mut state, key, true);
        state.read_only.push(key.clone());
        Ok(())
    }
}
