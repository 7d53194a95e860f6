use crd_api::v1alpha1::{
    BackupConditionType, DeletePolicy, MysqlBackup, MysqlCluster, REMOTE_STORAGE_FINALIZER,
};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{BackupController, Error, Result};
use crate::controller::publish_event;
use crate::manager::backup::{deletion_job, deletion_job_name, job_outcome};

/// What the deletion syncer has to do with a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeletionStep {
    /// Nothing to do
    Idle,
    /// Gate the deletion on the remote cleanup
    AddFinalizer,
    /// Release the backup without touching the remote data
    RemoveFinalizer,
    /// Run the deletion job and release the backup once it completes
    RunJob,
}

/// Decide the deletion step of a backup
pub(crate) fn deletion_step(backup: &MysqlBackup) -> DeletionStep {
    let deleting = backup.metadata.deletion_timestamp.is_some();
    let has_finalizer = backup.has_finalizer();
    if backup.delete_policy() == DeletePolicy::Retain {
        // the policy may have been changed after the finalizer was set
        return if deleting && has_finalizer {
            DeletionStep::RemoveFinalizer
        } else {
            DeletionStep::Idle
        };
    }
    if !deleting {
        return if has_finalizer {
            DeletionStep::Idle
        } else {
            DeletionStep::AddFinalizer
        };
    }
    if !has_finalizer {
        return DeletionStep::Idle;
    }
    let failed = backup
        .status
        .as_ref()
        .is_some_and(|s| s.conditions.is_true(BackupConditionType::Failed));
    if failed {
        return DeletionStep::RemoveFinalizer;
    }
    DeletionStep::RunJob
}

/// The finalizers of a backup with the remote storage one added or removed
pub(crate) fn with_finalizer(backup: &MysqlBackup, present: bool) -> Vec<String> {
    let mut finalizers: Vec<String> = backup
        .finalizers()
        .iter()
        .filter(|f| *f != REMOTE_STORAGE_FINALIZER)
        .cloned()
        .collect();
    if present {
        finalizers.push(REMOTE_STORAGE_FINALIZER.to_owned());
    }
    finalizers
}

impl BackupController {
    /// Remove the remote archive of a deleted backup when its policy asks for it
    pub(super) async fn sync_deletion(
        &self,
        api: &Api<MysqlBackup>,
        backup: &MysqlBackup,
        cluster: Option<&MysqlCluster>,
    ) -> Result<()> {
        match deletion_step(backup) {
            DeletionStep::Idle => Ok(()),
            DeletionStep::AddFinalizer => self.set_finalizer(api, backup, true).await.map(drop),
            DeletionStep::RemoveFinalizer => self.set_finalizer(api, backup, false).await.map(drop),
            DeletionStep::RunJob => {
                let url = backup
                    .backup_url()
                    .ok_or_else(|| Error::EmptyUrl(backup.name_any()))?;
                let jobs: Api<Job> =
                    Api::namespaced(self.kube_client.clone(), &backup.namespace().unwrap_or_default());
                let name = deletion_job_name(&backup.name_any());
                let job = match jobs.get_opt(&name).await? {
                    Some(job) => job,
                    None => {
                        info!(job = name.as_str(), "creating remote deletion job");
                        let job = deletion_job(backup, cluster, url, &self.options);
                        jobs.create(&PostParams::default(), &job).await?
                    }
                };
                let outcome = job_outcome(&job);
                if outcome.complete {
                    return self.set_finalizer(api, backup, false).await.map(drop);
                }
                if outcome.failed {
                    warn!(job = name.as_str(), "remote deletion job failed");
                    if let Some(cluster) = cluster {
                        publish_event(
                            &self.kube_client,
                            cluster,
                            EventType::Warning,
                            "RemoteDeletionFailed",
                            "job failed".to_owned(),
                        )
                        .await;
                    }
                }
                debug!(job = name.as_str(), "remote deletion job is running");
                Ok(())
            }
        }
    }

    /// Add or remove the remote storage finalizer, returns the patched backup
    pub(super) async fn set_finalizer(
        &self,
        api: &Api<MysqlBackup>,
        backup: &MysqlBackup,
        present: bool,
    ) -> Result<MysqlBackup> {
        let mut metadata = json!({ "finalizers": with_finalizer(backup, present) });
        if let Some(version) = backup.resource_version() {
            // fail on a stale object instead of dropping a concurrent finalizer
            metadata["resourceVersion"] = json!(version);
        }
        let patch = json!({ "metadata": metadata });
        Ok(api
            .patch(&backup.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
