use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::any;
use axum::{Extension, Router};
use crd_api::v1alpha1::{MysqlBackup, MysqlCluster, MANAGED_BY};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::watcher;
use kube::{Api, Client, Resource};
use orchestrator_api::{HttpOrchestrator, Orchestrator};
use prometheus::Registry;
use serde::de::DeserializeOwned;
use tokio::sync::watch::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::config::{Config, Namespace, OperatorOptions};
use crate::consts::LABEL_MANAGED_BY;
use crate::controller::backup::BackupController;
use crate::controller::backup_cron::{BackupScheduler, KubeBackupStore};
use crate::controller::cluster::ClusterController;
use crate::controller::node::NodeController;
use crate::controller::topology::{TopologyHandle, TopologyReconciler};
use crate::controller::{Controller, ControllerMetrics, Metrics};
use crate::router::{healthz, metrics};

/// Mysql Operator for k8s
#[derive(Debug)]
pub struct Operator {
    /// Config of this operator
    config: Config,
}

/// Resolves once the graceful shutdown is requested
async fn shutdown_requested(mut graceful_shutdown: Receiver<()>) {
    let _ig = graceful_shutdown.changed().await;
}

impl Operator {
    /// Constructor
    #[inline]
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run operator
    ///
    /// # Errors
    ///
    /// Return `Err` when run failed
    #[inline]
    pub async fn run(&self) -> Result<()> {
        let kube_client: Client = Client::try_default().await?;
        crd_api::setup(&kube_client, self.config.manage_crd).await?;
        let options = Arc::new(OperatorOptions::from(&self.config));
        let orchestrator: Arc<dyn Orchestrator> =
            Arc::new(HttpOrchestrator::new(options.orchestrator_uri.clone())?);

        let (graceful_shutdown_event, _) = tokio::sync::watch::channel(());
        let forceful_shutdown = self.forceful_shutdown(&graceful_shutdown_event);
        let registry = Registry::new();

        let topology = self.start_topology_reconciler(
            kube_client.clone(),
            Arc::clone(&orchestrator),
            &options,
            graceful_shutdown_event.subscribe(),
        )?;
        let scheduler = Arc::new(BackupScheduler::new(
            Arc::new(KubeBackupStore::new(kube_client.clone())),
            options.backup_poll_interval,
            options.backup_watch_timeout,
            graceful_shutdown_event.subscribe(),
        ));
        self.start_cluster_controller(
            ClusterController {
                kube_client: kube_client.clone(),
                options: Arc::clone(&options),
                orchestrator,
                topology,
                scheduler,
                metrics: ControllerMetrics::new("mysqlcluster"),
            },
            &registry,
            graceful_shutdown_event.subscribe(),
        )?;
        self.start_backup_controller(
            BackupController {
                kube_client: kube_client.clone(),
                options: Arc::clone(&options),
                metrics: ControllerMetrics::new("mysqlbackup"),
            },
            &registry,
            graceful_shutdown_event.subscribe(),
        )?;
        self.start_node_controller(
            NodeController::new(
                kube_client,
                options,
                ControllerMetrics::new("mysqlnode"),
            )?,
            &registry,
            graceful_shutdown_event.subscribe(),
        )?;
        self.start_web_server(registry, graceful_shutdown_event.subscribe())?;

        tokio::pin!(forceful_shutdown);

        #[allow(clippy::integer_arithmetic)] // this error originates in the macro `tokio::select`
        {
            tokio::select! {
                _ = &mut forceful_shutdown => {
                    warn!("forceful shutdown");
                }
                _ = graceful_shutdown_event.closed() => {
                    info!("graceful shutdown");
                }
            }
        }

        Ok(())
    }

    /// Forceful shutdown
    async fn forceful_shutdown(&self, graceful_shutdown_event: &Sender<()>) {
        info!("press ctrl+c to shut down gracefully");
        let _ctrl_c = tokio::signal::ctrl_c().await;
        let _ig = graceful_shutdown_event.send(());
        info!("graceful shutdown already requested to {} components, press ctrl+c again to force shut down", graceful_shutdown_event.receiver_count());
        let _ctrl_c_c = tokio::signal::ctrl_c().await;
    }

    /// The api of `K` in the configured namespace
    fn api<K>(&self, kube_client: &Client) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match self.config.namespace {
            Namespace::Single(ref namespace) => Api::namespaced(kube_client.clone(), namespace),
            Namespace::ClusterWide => Api::all(kube_client.clone()),
        }
    }

    /// Spawn a controller running until the graceful shutdown
    fn spawn_controller<R, C>(
        controller: C,
        runtime: kube::runtime::Controller<R>,
        registry: &Registry,
        graceful_shutdown: Receiver<()>,
    ) -> Result<()>
    where
        R: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        C: Controller<R>,
    {
        controller.metrics().register(registry)?;
        let kind = R::kind(&()).into_owned();
        let _ig = tokio::spawn(async move {
            C::run_with_shutdown(
                Arc::new(controller),
                runtime,
                shutdown_requested(graceful_shutdown),
            )
            .await;
            info!("{kind} controller shutdown");
        });
        Ok(())
    }

    /// Start the `MysqlCluster` controller, woken by its owned objects
    fn start_cluster_controller(
        &self,
        controller: ClusterController,
        registry: &Registry,
        graceful_shutdown: Receiver<()>,
    ) -> Result<()> {
        let client = &controller.kube_client;
        let runtime = kube::runtime::Controller::new(
            self.api::<MysqlCluster>(client),
            watcher::Config::default(),
        )
        .owns(self.api::<StatefulSet>(client), watcher::Config::default())
        .owns(self.api::<Service>(client), watcher::Config::default())
        .owns(self.api::<ConfigMap>(client), watcher::Config::default())
        .owns(self.api::<Secret>(client), watcher::Config::default())
        .owns(
            self.api::<PodDisruptionBudget>(client),
            watcher::Config::default(),
        );
        Self::spawn_controller(controller, runtime, registry, graceful_shutdown)
    }

    /// Start the `MysqlBackup` controller, woken by the backup jobs
    fn start_backup_controller(
        &self,
        controller: BackupController,
        registry: &Registry,
        graceful_shutdown: Receiver<()>,
    ) -> Result<()> {
        let client = &controller.kube_client;
        let runtime = kube::runtime::Controller::new(
            self.api::<MysqlBackup>(client),
            watcher::Config::default(),
        )
        .owns(self.api::<Job>(client), watcher::Config::default());
        Self::spawn_controller(controller, runtime, registry, graceful_shutdown)
    }

    /// Start the node controller on the pods created by this operator
    fn start_node_controller(
        &self,
        controller: NodeController,
        registry: &Registry,
        graceful_shutdown: Receiver<()>,
    ) -> Result<()> {
        let selector = format!("{LABEL_MANAGED_BY}={MANAGED_BY}");
        let runtime = kube::runtime::Controller::new(
            self.api::<Pod>(&controller.kube_client),
            watcher::Config::default().labels(&selector),
        );
        Self::spawn_controller(controller, runtime, registry, graceful_shutdown)
    }

    /// Start the periodic orchestrator reconcile
    fn start_topology_reconciler(
        &self,
        kube_client: Client,
        orchestrator: Arc<dyn Orchestrator>,
        options: &OperatorOptions,
        graceful_shutdown: Receiver<()>,
    ) -> Result<TopologyHandle> {
        let (reconciler, handle) =
            TopologyReconciler::new(kube_client, orchestrator, options.topology_period)?;
        let _ig = tokio::spawn(async move {
            reconciler
                .run_with_graceful_shutdown(shutdown_requested(graceful_shutdown))
                .await;
            info!("topology reconciler shutdown");
        });
        Ok(handle)
    }

    /// Start web server
    fn start_web_server(&self, registry: Registry, graceful_shutdown: Receiver<()>) -> Result<()> {
        let status = Router::new()
            .route("/metrics", any(metrics))
            .route("/healthz", any(healthz))
            .layer(Extension(registry));
        let server = axum::Server::bind(&self.config.listen_addr.parse()?);

        let _ig = tokio::spawn(async move {
            let res = server
                .serve(status.into_make_service())
                .with_graceful_shutdown(shutdown_requested(graceful_shutdown))
                .await;
            if let Err(err) = res {
                error!("web server starts failed, error: {err}");
            } else {
                info!("web server shut down");
            }
        });

        Ok(())
    }
}
