use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crd_api::v1alpha1::{DeletePolicy, MysqlBackup, MysqlBackupSpec};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::store::BackupStore;
use super::Error;
use crate::consts::{LABEL_BACKUP_CLUSTER, LABEL_RECURRENT};

/// Creation attempts of a scheduled backup
const CREATE_ATTEMPTS: usize = 5;
/// Delay between two creation attempts
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The work done each time the schedule of a cluster fires
pub(crate) struct CronJob {
    /// Namespace of the cluster
    pub(crate) namespace: String,
    /// Name of the cluster
    pub(crate) cluster: String,
    /// Scheduled backups kept after each firing, unlimited if `None`
    pub(crate) history_limit: Option<usize>,
    /// Delete policy of the created backups
    pub(crate) delete_policy: Option<DeletePolicy>,
    /// Backups store
    pub(crate) store: Arc<dyn BackupStore>,
    /// Completion poll interval
    pub(crate) poll_interval: Duration,
    /// How long a created backup is watched
    pub(crate) watch_timeout: Duration,
    /// Set while a backup created by this job is in flight
    running: AtomicBool,
}

/// Clears the running flag when dropped
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CronJob {
    /// New a job for `namespace/cluster`
    pub(crate) fn new(
        namespace: String,
        cluster: String,
        store: Arc<dyn BackupStore>,
        poll_interval: Duration,
        watch_timeout: Duration,
    ) -> Self {
        Self {
            namespace,
            cluster,
            history_limit: None,
            delete_policy: None,
            store,
            poll_interval,
            watch_timeout,
            running: AtomicBool::new(false),
        }
    }

    /// Whether a backup of this job is in flight
    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fire once: create a backup unless one is in flight, wait for it, then
    /// prune the history
    pub(crate) async fn fire(&self) {
        info!(namespace = self.namespace.as_str(), cluster = self.cluster.as_str(), "scheduled backup job started");
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(cluster = self.cluster.as_str(), "previous scheduled backup still running, skip");
            return;
        }
        {
            let _guard = RunningGuard(&self.running);
            if let Err(err) = self.run().await {
                warn!(cluster = self.cluster.as_str(), "scheduled backup failed: {err}");
            }
        }
        if let Some(limit) = self.history_limit {
            if let Err(err) = self.collect_garbage(limit).await {
                warn!(cluster = self.cluster.as_str(), "scheduled backups cleanup failed: {err}");
            }
        }
    }

    /// Create a backup and wait for its completion
    async fn run(&self) -> Result<(), Error> {
        let backups = self
            .store
            .list_recurrent(&self.namespace, &self.cluster)
            .await?;
        let running = backups.iter().filter(|b| !b.is_completed()).count();
        if running > 0 {
            debug!(running, "at least a scheduled backup is running");
            return Ok(());
        }
        let backup = self.new_backup();
        let name = backup.name_any();
        self.create_with_retries(&backup).await?;
        info!(backup = name.as_str(), "scheduled backup created");
        self.wait_completed(&name).await
    }

    /// The next scheduled backup
    fn new_backup(&self) -> MysqlBackup {
        let name = format!(
            "{}-auto-{}",
            self.cluster,
            Utc::now().format("%Y-%m-%dt%H-%M-%S")
        );
        let mut backup = MysqlBackup::new(
            &name,
            MysqlBackupSpec {
                cluster_name: self.cluster.clone(),
                remote_delete_policy: self.delete_policy,
                ..MysqlBackupSpec::default()
            },
        );
        backup.metadata.namespace = Some(self.namespace.clone());
        backup.metadata.labels = Some(
            [
                (LABEL_RECURRENT.to_owned(), "true".to_owned()),
                (LABEL_BACKUP_CLUSTER.to_owned(), self.cluster.clone()),
            ]
            .into(),
        );
        backup
    }

    /// Create the backup, retrying a bounded number of times
    async fn create_with_retries(&self, backup: &MysqlBackup) -> Result<(), Error> {
        let mut attempt = 1;
        loop {
            match self.store.create(backup).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt >= CREATE_ATTEMPTS => {
                    return Err(Error::CreateFailed {
                        backup: backup.name_any(),
                        attempts: attempt,
                        source: err,
                    })
                }
                Err(err) => {
                    debug!(attempt, "failed to create scheduled backup: {err}");
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(CREATE_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Poll the backup until it completes, bounded by the watch timeout
    async fn wait_completed(&self, name: &str) -> Result<(), Error> {
        let poll = async {
            loop {
                tokio::time::sleep(self.poll_interval).await;
                match self.store.get(&self.namespace, name).await? {
                    Some(backup) if backup.is_completed() => return Ok::<(), Error>(()),
                    Some(_) => {}
                    None => {
                        debug!(backup = name, "scheduled backup was removed while running");
                        return Ok(());
                    }
                }
            }
        };
        tokio::time::timeout(self.watch_timeout, poll)
            .await
            .map_err(|_elapsed| Error::Timeout(name.to_owned()))?
    }

    /// Delete the scheduled backups beyond the history limit, newest kept
    async fn collect_garbage(&self, limit: usize) -> Result<(), Error> {
        let mut backups = self
            .store
            .list_recurrent(&self.namespace, &self.cluster)
            .await?;
        backups.sort_by(|a, b| b.creation_timestamp().cmp(&a.creation_timestamp()));
        for backup in backups.iter().skip(limit) {
            info!(backup = backup.name_any().as_str(), "removing old scheduled backup");
            self.store.delete(&self.namespace, &backup.name_any()).await?;
        }
        Ok(())
    }
}
