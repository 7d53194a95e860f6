use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crd_api::v1alpha1::{MysqlCluster, MysqlClusterStatus};
use flume::{Receiver, Sender};
use futures::Future;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::EventType;
use kube::{Api, Client, ResourceExt};
use orchestrator_api::Orchestrator;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use utils::consts::MYSQL_PORT;

use crate::controller::publish_event;

/// One orchestrator pass over a cluster
mod reconcile;

use reconcile::{sync, NodeNames, SyncOutcome};

/// A cluster known to the topology reconciler
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ClusterKey {
    /// Namespace of the cluster
    pub(crate) namespace: String,
    /// Name of the cluster
    pub(crate) name: String,
}

/// The merge patch writing the topology fields of `status`, it fails if
/// the cluster changed since it was read
fn status_patch(cluster: &MysqlCluster, status: &MysqlClusterStatus) -> serde_json::Value {
    let mut patch = json!({
        "status": {
            "conditions": status.conditions,
            "nodes": status.nodes,
        }
    });
    if let Some(version) = cluster.resource_version() {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    patch
}

/// Registers clusters to the periodic topology reconcile
#[derive(Debug, Clone)]
pub(crate) struct TopologyHandle {
    /// Registration sender
    tx: Sender<ClusterKey>,
}

impl TopologyHandle {
    /// Add a cluster to the reconcile set, registering twice is a no-op
    pub(crate) fn register(&self, namespace: &str, name: &str) {
        let key = ClusterKey {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        };
        if let Err(err) = self.tx.send(key) {
            warn!("topology reconciler is gone, cannot register {namespace}/{name}: {err}");
        }
    }
}

/// Periodically reconciles every registered cluster against orchestrator,
/// independently of the kubernetes watch events
pub(crate) struct TopologyReconciler {
    /// Kubernetes client
    kube_client: Client,
    /// Orchestrator client
    orchestrator: Arc<dyn Orchestrator>,
    /// Tick period
    period: Duration,
    /// Registration receiver
    rx: Receiver<ClusterKey>,
    /// The registered clusters
    clusters: BTreeSet<ClusterKey>,
    /// Node hostname parser
    names: NodeNames,
}

impl TopologyReconciler {
    /// Create the reconciler and the handle used to feed it
    pub(crate) fn new(
        kube_client: Client,
        orchestrator: Arc<dyn Orchestrator>,
        period: Duration,
    ) -> Result<(Self, TopologyHandle), regex::Error> {
        let (tx, rx) = flume::unbounded();
        let reconciler = Self {
            kube_client,
            orchestrator,
            period,
            rx,
            clusters: BTreeSet::new(),
            names: NodeNames::new()?,
        };
        Ok((reconciler, TopologyHandle { tx }))
    }

    /// Run the ticker until `graceful_shutdown` resolves
    #[allow(clippy::integer_arithmetic)] // required by tokio::select
    pub(crate) async fn run_with_graceful_shutdown(self, graceful_shutdown: impl Future<Output = ()>) {
        tokio::select! {
            () = graceful_shutdown => {
                info!("topology reconciler stopped");
            }
            () = self.tick_loop() => {}
        }
    }

    /// Tick forever
    async fn tick_loop(mut self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let _instant = interval.tick().await;
            self.clusters.extend(self.rx.drain());
            let clusters: Vec<ClusterKey> = self.clusters.iter().cloned().collect();
            for key in clusters {
                if !self.reconcile_cluster(&key).await {
                    debug!("removing {}/{} from topology reconcile", key.namespace, key.name);
                    let _existed = self.clusters.remove(&key);
                }
            }
        }
    }

    /// Reconcile one cluster, returns false if it no longer exists
    async fn reconcile_cluster(&self, key: &ClusterKey) -> bool {
        let api: Api<MysqlCluster> = Api::namespaced(self.kube_client.clone(), &key.namespace);
        let cluster = match api.get_opt(&key.name).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                self.forget_cluster(&format!("{}.{}", key.name, key.namespace))
                    .await;
                return false;
            }
            Err(err) => {
                error!("failed to get cluster {}/{}: {err}", key.namespace, key.name);
                return true;
            }
        };
        let SyncOutcome { status, acked } =
            match sync(self.orchestrator.as_ref(), &cluster, &self.names, Utc::now()).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("orchestrator reconcile of {}/{} failed: {err}", key.namespace, key.name);
                    return true;
                }
            };
        for id in acked {
            publish_event(
                &self.kube_client,
                &cluster,
                EventType::Normal,
                "RecoveryAcked",
                format!("Recovery with id {id} was acked."),
            )
            .await;
        }
        if cluster.status.as_ref() == Some(&status) {
            return true;
        }
        let patch = status_patch(&cluster, &status);
        if let Err(err) = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            // a conflict is retried on the next tick from a fresh read
            warn!("failed to update status of {}/{}: {err}", key.namespace, key.name);
        }
        true
    }

    /// Remove every instance of a deleted cluster from orchestrator
    async fn forget_cluster(&self, alias: &str) {
        let instances = match self.orchestrator.cluster(alias).await {
            Ok(instances) => instances,
            Err(err) if err.is_not_found() => return,
            Err(err) => {
                warn!("cannot list instances of deleted cluster {alias}: {err}");
                return;
            }
        };
        for inst in instances {
            info!(host = inst.key.hostname.as_str(), "forgetting node of deleted cluster");
            if let Err(err) = self.orchestrator.forget(&inst.key.hostname, MYSQL_PORT).await {
                warn!("failed to forget {}: {err}", inst.key.hostname);
            }
        }
    }
}
