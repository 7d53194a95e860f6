use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use crd_api::v1alpha1::{MysqlBackup, MysqlCluster};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info};

use crate::config::OperatorOptions;
use crate::controller::{Controller, ControllerMetrics, MetricsLabeled};
use crate::manager::backup::{
    backup_job, backup_job_name, migrate_backup, project_job_status, set_backup_defaults, NoBucket,
};

use self::deletion::{deletion_step, DeletionStep};

/// Remote archive removal
mod deletion;

/// `MysqlBackup` reconcile errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// Kubernetes api error
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// Neither the backup nor the cluster has a bucket
    #[error(transparent)]
    NoBucket(#[from] NoBucket),
    /// The backup does not name its cluster
    #[error("backup {0} has no cluster name")]
    EmptyClusterName(String),
    /// The backup cluster does not exist
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
    /// The remote archive cannot be removed without its URL
    #[error("empty .spec.backupURL of backup {0}")]
    EmptyUrl(String),
    /// The backup is not namespaced
    #[error("backup {0} has no namespace")]
    MissingNamespace(String),
}

impl MetricsLabeled for Error {
    fn labels(&self) -> Vec<&str> {
        match *self {
            Self::Kube(ref err) => err.labels(),
            Self::NoBucket(_)
            | Self::EmptyClusterName(_)
            | Self::EmptyUrl(_)
            | Self::MissingNamespace(_) => vec!["invalid spec"],
            Self::ClusterNotFound(_) => vec!["cluster not found"],
        }
    }
}

/// Controller result
type Result<T> = std::result::Result<T, Error>;

/// CRD `MysqlBackup` controller
pub(crate) struct BackupController {
    /// Kubernetes client
    pub(crate) kube_client: Client,
    /// Operator options
    pub(crate) options: Arc<OperatorOptions>,
    /// Backup metrics
    pub(crate) metrics: ControllerMetrics,
}

impl BackupController {
    /// Get the backup job, creating it if missing
    async fn sync_job(&self, backup: &MysqlBackup, cluster: &MysqlCluster, url: &str) -> Result<Job> {
        let jobs: Api<Job> =
            Api::namespaced(self.kube_client.clone(), &backup.namespace().unwrap_or_default());
        let name = backup_job_name(&backup.name_any());
        if let Some(job) = jobs.get_opt(&name).await? {
            return Ok(job);
        }
        info!(job = name.as_str(), "creating backup job");
        let job = backup_job(backup, cluster, url, &self.options);
        Ok(jobs.create(&PostParams::default(), &job).await?)
    }

    /// Default the backup, run its job and mirror the job state
    async fn sync_backup(
        &self,
        api: &Api<MysqlBackup>,
        mut backup: MysqlBackup,
        cluster: &MysqlCluster,
    ) -> Result<MysqlBackup> {
        let now = Utc::now();
        if set_backup_defaults(&mut backup, cluster, now)? {
            debug!("backup {} defaulted, updating it", backup.name_any());
            backup = api
                .replace(&backup.name_any(), &PostParams::default(), &backup)
                .await?;
        }
        let Some(url) = backup.backup_url().map(ToOwned::to_owned) else {
            return Err(Error::EmptyUrl(backup.name_any()));
        };
        let job = self.sync_job(&backup, cluster, &url).await?;
        if project_job_status(&mut backup, &job, now) {
            let patch = json!({ "status": backup.status });
            backup = api
                .patch_status(&backup.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(backup)
    }
}

#[async_trait]
impl Controller<MysqlBackup> for BackupController {
    type Error = Error;
    type Metrics = ControllerMetrics;

    fn metrics(&self) -> &Self::Metrics {
        &self.metrics
    }

    async fn reconcile_once(&self, backup: &Arc<MysqlBackup>) -> Result<()> {
        let name = backup.name_any();
        let Some(namespace) = backup.namespace() else {
            return Err(Error::MissingNamespace(name));
        };
        let api: Api<MysqlBackup> = Api::namespaced(self.kube_client.clone(), &namespace);
        let Some(mut backup) = api.get_opt(&name).await? else {
            debug!("backup {namespace}/{name} not found, it may be deleted");
            return Ok(());
        };
        if migrate_backup(&mut backup) {
            info!("backup {namespace}/{name} migrated from status");
            backup = api.replace(&name, &PostParams::default(), &backup).await?;
        }
        if deletion_step(&backup) == DeletionStep::AddFinalizer {
            // the remote archive is gated before any other step may fail
            backup = self.set_finalizer(&api, &backup, true).await?;
        }
        if backup.spec.cluster_name.is_empty() {
            return Err(Error::EmptyClusterName(name));
        }

        let clusters: Api<MysqlCluster> = Api::namespaced(self.kube_client.clone(), &namespace);
        let Some(cluster) = clusters.get_opt(&backup.spec.cluster_name).await? else {
            // orphaned backups still get their remote data removed
            self.sync_deletion(&api, &backup, None).await?;
            return Err(Error::ClusterNotFound(backup.spec.cluster_name.clone()));
        };

        if !backup.is_completed() && backup.metadata.deletion_timestamp.is_none() {
            backup = self.sync_backup(&api, backup, &cluster).await?;
        }
        self.sync_deletion(&api, &backup, Some(&cluster)).await
    }

    fn handle_error(&self, resource: &Arc<MysqlBackup>, err: &Self::Error) {
        error!("{:?} reconciliation error: {}", resource.metadata.name, err);
    }
}
