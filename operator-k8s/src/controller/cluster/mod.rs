use std::sync::Arc;

use async_trait::async_trait;
use crd_api::v1alpha1::{MysqlCluster, ResourceName};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use orchestrator_api::Orchestrator;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::config::OperatorOptions;
use crate::controller::backup_cron::BackupScheduler;
use crate::controller::topology::TopologyHandle;
use crate::controller::{Controller, ControllerMetrics, MetricsLabeled};
use crate::manager::cluster::{user_secret_additions, Factory};
use crate::manager::defaults::{migrate_spec, resolve_mysql_image, set_defaults, validate, SpecError};

/// PVC cleanup after scale down
mod cleaner;
/// Syncers of the owned objects
mod syncer;
/// Migration of clusters created with the per cluster headless service
mod upgrade;

/// `MysqlCluster` reconcile errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// Kubernetes api error
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// The spec is not valid
    #[error("invalid cluster spec: {0}")]
    Spec(#[from] SpecError),
    /// The user secret lacks the root password
    #[error("ROOT_PASSWORD not set in secret: {0}")]
    MissingRootPassword(String),
    /// The pod of a node is not created yet
    #[error("pod {0} not found")]
    PodNotFound(String),
    /// The node has no `Master` condition yet
    #[error("master status condition not set for node {0}")]
    MissingMasterCondition(String),
    /// Orchestrator call failed
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] orchestrator_api::Error),
    /// The upgrade cannot proceed yet
    #[error("upgrade blocked: {0}")]
    Upgrade(String),
    /// The cluster is not namespaced
    #[error("cluster {0} has no namespace")]
    MissingNamespace(String),
}

impl MetricsLabeled for Error {
    fn labels(&self) -> Vec<&str> {
        match *self {
            Self::Kube(ref err) => err.labels(),
            Self::Spec(_) | Self::MissingRootPassword(_) | Self::MissingNamespace(_) => {
                vec!["invalid spec"]
            }
            Self::PodNotFound(_) | Self::MissingMasterCondition(_) => vec!["node not ready"],
            Self::Orchestrator(_) => vec!["orchestrator error"],
            Self::Upgrade(_) => vec!["upgrade blocked"],
        }
    }
}

/// Controller result
type Result<T> = std::result::Result<T, Error>;

/// CRD `MysqlCluster` controller
pub(crate) struct ClusterController {
    /// Kubernetes client
    pub(crate) kube_client: Client,
    /// Operator options
    pub(crate) options: Arc<OperatorOptions>,
    /// Orchestrator client
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    /// Registers clusters to the periodic topology reconcile
    pub(crate) topology: TopologyHandle,
    /// Recurrent backups
    pub(crate) scheduler: Arc<BackupScheduler>,
    /// Cluster metrics
    pub(crate) metrics: ControllerMetrics,
}

impl ClusterController {
    /// Fill the random credentials missing from the user secret
    async fn sync_user_secret(&self, cluster: &MysqlCluster) -> Result<()> {
        let api: Api<Secret> =
            Api::namespaced(self.kube_client.clone(), &cluster.namespace_or_default());
        let name = cluster.spec.secret_name.as_str();
        let secret = api.get(name).await?;
        let additions = user_secret_additions(name, &secret.data.unwrap_or_default())
            .map_err(Error::MissingRootPassword)?;
        if additions.is_empty() {
            return Ok(());
        }
        debug!("adding {} keys to secret {name}", additions.len());
        let patch = json!({ "data": additions });
        let _secret = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Label the pods, the master last
    async fn sync_pods(&self, cluster: &MysqlCluster) -> Result<()> {
        for host in syncer::pod_sync_order(cluster) {
            match self.sync_pod_labels(cluster, &host).await {
                Ok(()) => {}
                Err(Error::PodNotFound(pod)) => debug!("pod {pod} is not created yet"),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Clean the orphan claims then label the pods, the labels wait for the
    /// first topology reconcile of each node
    async fn sync_nodes(&self, cluster: &MysqlCluster) -> Result<()> {
        self.clean_claims(cluster).await?;
        self.sync_pods(cluster).await
    }

    /// Mirror the ready replicas of the statefulset
    async fn update_ready_nodes(&self, cluster: &MysqlCluster, ready: i32) -> Result<()> {
        if cluster.status.as_ref().map_or(0, |s| s.ready_nodes) == ready
            && cluster.status.is_some()
        {
            return Ok(());
        }
        let api: Api<MysqlCluster> =
            Api::namespaced(self.kube_client.clone(), &cluster.namespace_or_default());
        let patch = json!({ "status": { "readyNodes": ready } });
        let _cluster = api
            .patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// The resource version of an applied object
fn revision<R: ResourceExt>(res: &R) -> String {
    res.resource_version().unwrap_or_default()
}

#[async_trait]
impl Controller<MysqlCluster> for ClusterController {
    type Error = Error;
    type Metrics = ControllerMetrics;

    fn metrics(&self) -> &Self::Metrics {
        &self.metrics
    }

    async fn reconcile_once(&self, cluster: &Arc<MysqlCluster>) -> Result<()> {
        let name = cluster.name_any();
        let Some(namespace) = cluster.namespace() else {
            return Err(Error::MissingNamespace(name));
        };
        let api: Api<MysqlCluster> = Api::namespaced(self.kube_client.clone(), &namespace);
        let Some(mut cluster) = api.get_opt(&name).await? else {
            debug!("cluster {namespace}/{name} not found, it may be deleted");
            self.scheduler.unregister(&namespace, &name).await;
            return Ok(());
        };

        if upgrade::needs_upgrade(&cluster) {
            return self.upgrade(&cluster).await;
        }
        if migrate_spec(&mut cluster) {
            debug!("cluster {namespace}/{name} spec migrated, writing it back");
            let _cluster = api.replace(&name, &PostParams::default(), &cluster).await?;
            return Ok(());
        }
        set_defaults(&mut cluster, &self.options);
        validate(&cluster, &self.options)?;

        let cluster = Arc::new(cluster);
        self.topology.register(&namespace, &name);
        if let Err(err) = self.scheduler.register(&cluster).await {
            warn!("cannot schedule backups of {namespace}/{name}: {err}");
        }

        let factory = Factory::new(Arc::clone(&cluster), Arc::clone(&self.options));
        let config_map = self.apply(&namespace, factory.config_map()).await?;
        let secrets: Api<Secret> = Api::namespaced(self.kube_client.clone(), &namespace);
        let existing = secrets
            .get_opt(&cluster.name_for(ResourceName::OperatedSecret))
            .await?;
        let operated = self
            .apply(&namespace, factory.operated_secret(existing.as_ref()))
            .await?;

        self.sync_user_secret(&cluster).await?;
        let _svc = self.apply(&namespace, factory.headless_service()).await?;
        let _svc = self.apply(&namespace, factory.master_service()).await?;
        let _svc = self.apply(&namespace, factory.healthy_nodes_service()).await?;
        let _svc = self.apply(&namespace, factory.healthy_replicas_service()).await?;
        let image = resolve_mysql_image(&cluster, &self.options)?;
        let sts = self
            .apply(
                &namespace,
                factory.statefulset(&image, &revision(&config_map), &revision(&operated)),
            )
            .await?;
        if let Some(pdb) = factory.pod_disruption_budget() {
            if self.create_if_missing(&namespace, pdb).await? {
                debug!("pod disruption budget of {namespace}/{name} created");
            }
        }

        let ready = sts
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        self.update_ready_nodes(&cluster, ready).await?;
        self.sync_nodes(&cluster).await
    }

    fn handle_error(&self, resource: &Arc<MysqlCluster>, err: &Self::Error) {
        error!("{:?} reconciliation error: {}", resource.metadata.name, err);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crd_api::v1alpha1::MysqlClusterSpec;
    use http::{Method, Request, Response};
    use hyper::Body;
    use orchestrator_api::fake::FakeOrchestrator;
    use serde_json::Value;
    use tokio::sync::watch;

    use super::*;
    use crate::controller::backup_cron::KubeBackupStore;
    use crate::controller::topology::TopologyReconciler;

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    fn respond(body: &Value) -> Response<Body> {
        Response::builder()
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    /// Answer the claims listing then the pod read, returns the requested paths
    async fn serve_unobserved_node(mut handle: ApiServerHandle) -> Vec<String> {
        let mut paths = Vec::new();
        let (req, send) = handle.next_request().await.expect("claims list");
        assert_eq!(req.method(), Method::GET);
        paths.push(req.uri().path().to_owned());
        send.send_response(respond(&serde_json::json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaimList",
            "metadata": {},
            "items": []
        })));

        let (req, send) = handle.next_request().await.expect("pod get");
        assert_eq!(req.method(), Method::GET);
        paths.push(req.uri().path().to_owned());
        send.send_response(respond(&serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "foo-mysql-0", "namespace": "default" }
        })));
        paths
    }

    #[tokio::test]
    async fn claims_are_cleaned_before_the_topology_is_known() {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(service, "default");
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(FakeOrchestrator::new());
        let (_reconciler, topology) =
            TopologyReconciler::new(client.clone(), Arc::clone(&orchestrator), Duration::from_secs(5)).unwrap();
        let (_shutdown, shutdown_rx) = watch::channel(());
        let controller = ClusterController {
            kube_client: client.clone(),
            options: Arc::new(OperatorOptions::default()),
            orchestrator,
            topology,
            scheduler: Arc::new(BackupScheduler::new(
                Arc::new(KubeBackupStore::new(client)),
                Duration::from_secs(1),
                Duration::from_secs(60),
                shutdown_rx,
            )),
            metrics: ControllerMetrics::new("mysqlcluster"),
        };
        let mut cluster = MysqlCluster::new(
            "foo",
            MysqlClusterSpec {
                replicas: Some(1),
                ..MysqlClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_owned());
        let server = tokio::spawn(serve_unobserved_node(handle));

        assert!(matches!(
            controller.sync_nodes(&cluster).await,
            Err(Error::MissingMasterCondition(_))
        ));
        let paths = tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("api server scenario timed out")
            .unwrap();
        assert_eq!(
            paths,
            [
                "/api/v1/namespaces/default/persistentvolumeclaims",
                "/api/v1/namespaces/default/pods/foo-mysql-0",
            ]
        );
    }
}
