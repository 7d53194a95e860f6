use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use crd_api::v1alpha1::{DeletePolicy, MysqlCluster};
use kube::ResourceExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::job::CronJob;
use self::store::BackupStore;
pub(crate) use self::store::KubeBackupStore;

/// The work of a single firing
mod job;
/// Access to the backup objects
mod store;

/// Backup scheduler errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// Kubernetes api error
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// The schedule is not a valid cron expression
    #[error("invalid backup schedule {schedule:?}: {source}")]
    Schedule {
        /// The schedule
        schedule: String,
        /// Parse error
        source: cron::error::Error,
    },
    /// The backup could not be created
    #[error("failed to create backup {backup} after {attempts} attempts: {source}")]
    CreateFailed {
        /// The backup name
        backup: String,
        /// Attempts made
        attempts: usize,
        /// The last error
        source: kube::Error,
    },
    /// The backup did not complete in time
    #[error("timeout waiting for backup {0} to complete")]
    Timeout(String),
}

/// Accept the 5 field cron syntax by adding the seconds field
pub(crate) fn normalize_schedule(schedule: &str) -> String {
    let schedule = schedule.trim();
    if schedule.split_whitespace().count() == 5 {
        format!("0 {schedule}")
    } else {
        schedule.to_owned()
    }
}

/// Parse a backup schedule
pub(crate) fn parse_schedule(schedule: &str) -> Result<Schedule, Error> {
    Schedule::from_str(&normalize_schedule(schedule)).map_err(|source| Error::Schedule {
        schedule: schedule.to_owned(),
        source,
    })
}

/// What an entry was registered with
#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryParams {
    /// Cron expression, as written in the cluster
    schedule: String,
    /// Scheduled backups history limit
    history_limit: Option<usize>,
    /// Delete policy of the created backups
    delete_policy: Option<DeletePolicy>,
}

/// A registered cluster
struct Entry {
    /// Registration parameters
    params: EntryParams,
    /// Registration number, to tell replaced entries apart
    generation: u64,
    /// The task firing the schedule
    task: JoinHandle<()>,
}

/// The registered entries
#[derive(Default)]
struct Entries {
    /// Entries by `namespace/name`
    by_cluster: HashMap<String, Entry>,
    /// Last registration number
    generation: u64,
}

/// Creates backups of the clusters following their `backupSchedule`
pub(crate) struct BackupScheduler {
    /// Backups store
    store: Arc<dyn BackupStore>,
    /// Completion poll interval
    poll_interval: Duration,
    /// How long a created backup is watched
    watch_timeout: Duration,
    /// The register-or-update decision is taken under this lock
    entries: Arc<Mutex<Entries>>,
    /// Changes once the operator shuts down
    shutdown: watch::Receiver<()>,
}

/// Whether the shutdown was requested, a dropped sender counts as one
fn shutdown_requested(shutdown: &watch::Receiver<()>) -> bool {
    shutdown.has_changed().unwrap_or(true)
}

impl BackupScheduler {
    /// New a scheduler without entries, its schedules stop and its in
    /// flight firings are dropped once `shutdown` changes
    pub(crate) fn new(
        store: Arc<dyn BackupStore>,
        poll_interval: Duration,
        watch_timeout: Duration,
        shutdown: watch::Receiver<()>,
    ) -> Self {
        Self {
            store,
            poll_interval,
            watch_timeout,
            entries: Arc::new(Mutex::new(Entries::default())),
            shutdown,
        }
    }

    /// Register the schedule of a cluster. Registering again is a no-op
    /// unless the schedule, the history limit or the delete policy changed,
    /// an empty schedule removes the entry.
    pub(crate) async fn register(&self, cluster: &MysqlCluster) -> Result<(), Error> {
        let namespace = cluster.namespace_or_default();
        let name = cluster.name_any();
        let Some(schedule_str) = cluster
            .spec
            .backup_schedule
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        else {
            self.unregister(&namespace, &name).await;
            return Ok(());
        };
        let params = EntryParams {
            schedule: schedule_str.to_owned(),
            history_limit: cluster.spec.backup_schedule_jobs_history_limit,
            delete_policy: cluster.spec.backup_remote_delete_policy,
        };
        let key = format!("{namespace}/{name}");
        if shutdown_requested(&self.shutdown) {
            debug!("shutting down, backup schedule of {key} ignored");
            return Ok(());
        }

        let mut entries = self.entries.lock().await;
        if entries
            .by_cluster
            .get(&key)
            .is_some_and(|entry| entry.params == params)
        {
            return Ok(());
        }
        let schedule = parse_schedule(schedule_str)?;
        if let Some(old) = entries.by_cluster.remove(&key) {
            info!("backup schedule of {key} changed, replacing it");
            old.task.abort();
        }

        entries.generation = entries.generation.wrapping_add(1);
        let generation = entries.generation;
        let mut job = CronJob::new(
            namespace,
            name,
            Arc::clone(&self.store),
            self.poll_interval,
            self.watch_timeout,
        );
        job.history_limit = params.history_limit;
        job.delete_policy = params.delete_policy;
        let task = tokio::spawn(run_schedule(
            schedule,
            Arc::new(job),
            Arc::clone(&self.entries),
            key.clone(),
            generation,
            self.shutdown.clone(),
        ));
        info!("registered backup schedule {:?} of {key}", params.schedule);
        let _prev = entries.by_cluster.insert(
            key,
            Entry {
                params,
                generation,
                task,
            },
        );
        Ok(())
    }

    /// Remove the entry of a cluster
    pub(crate) async fn unregister(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        if let Some(entry) = self.entries.lock().await.by_cluster.remove(&key) {
            info!("unregistered backup schedule of {key}");
            entry.task.abort();
        }
    }

    /// Number of registered clusters
    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.by_cluster.len()
    }
}

/// Fire `job` on every upcoming time of `schedule` until the shutdown.
/// Each firing runs in its own task so a slow backup does not delay the
/// schedule; overlapping firings are skipped by the job itself.
#[allow(clippy::integer_arithmetic)] // this error originates in the macro `tokio::select`
async fn run_schedule(
    schedule: Schedule,
    job: Arc<CronJob>,
    entries: Arc<Mutex<Entries>>,
    key: String,
    generation: u64,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            debug!("schedule of {key} has no upcoming time");
            break;
        };
        let delay = next
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or_default();
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("shutting down, stop scheduling backups of {key}");
                break;
            }
            () = tokio::time::sleep(delay) => {}
        }

        match job.store.cluster_exists(&job.namespace, &job.cluster).await {
            Ok(true) => {}
            Ok(false) => {
                info!("cluster {key} not found, stop scheduling backups");
                break;
            }
            Err(err) => {
                warn!("failed to get cluster {key}: {err}");
                continue;
            }
        }
        let firing = Arc::clone(&job);
        let mut firing_shutdown = shutdown.clone();
        let _handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = firing_shutdown.changed() => {
                    debug!(cluster = firing.cluster.as_str(), "shutting down, scheduled backup dropped");
                }
                () = firing.fire() => {}
            }
        });
    }
    let mut entries = entries.lock().await;
    if entries
        .by_cluster
        .get(&key)
        .is_some_and(|entry| entry.generation == generation)
    {
        let _entry = entries.by_cluster.remove(&key);
    }
}

#[cfg(test)]
mod test {
    use crd_api::v1alpha1::MysqlClusterSpec;

    use super::store::memory::MemoryStore;
    use super::*;

    fn cluster(schedule: Option<&str>, limit: Option<usize>) -> MysqlCluster {
        let mut cluster = MysqlCluster::new(
            "foo",
            MysqlClusterSpec {
                backup_schedule: schedule.map(ToOwned::to_owned),
                backup_schedule_jobs_history_limit: limit,
                ..MysqlClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_owned());
        cluster
    }

    fn scheduler_over(store: Arc<MemoryStore>) -> (BackupScheduler, watch::Sender<()>) {
        let (shutdown, rx) = watch::channel(());
        let scheduler = BackupScheduler::new(store, Duration::from_secs(1), Duration::from_secs(60), rx);
        (scheduler, shutdown)
    }

    fn scheduler() -> (BackupScheduler, watch::Sender<()>) {
        scheduler_over(Arc::new(MemoryStore::default()))
    }

    #[test]
    fn five_fields_get_seconds() {
        assert_eq!(normalize_schedule("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_schedule(" 0 0 * * * * "), "0 0 * * * *");
        assert!(parse_schedule("0 0 * * *").is_ok());
        assert!(parse_schedule("0 0 0 * * *").is_ok());
        assert!(matches!(
            parse_schedule("every day"),
            Err(Error::Schedule { .. })
        ));
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let (scheduler, _shutdown) = scheduler();
        scheduler.register(&cluster(Some("0 0 * * *"), None)).await.unwrap();
        let generation = scheduler.entries.lock().await.generation;
        scheduler.register(&cluster(Some("0 0 * * *"), None)).await.unwrap();
        assert_eq!(scheduler.entries.lock().await.generation, generation);
        assert_eq!(scheduler.len().await, 1);
    }

    #[tokio::test]
    async fn changed_schedule_replaces_the_entry() {
        let (scheduler, _shutdown) = scheduler();
        scheduler.register(&cluster(Some("0 0 * * *"), None)).await.unwrap();
        scheduler.register(&cluster(Some("0 1 * * *"), None)).await.unwrap();
        scheduler.register(&cluster(Some("0 1 * * *"), Some(3))).await.unwrap();
        let entries = scheduler.entries.lock().await;
        assert_eq!(entries.by_cluster.len(), 1);
        assert_eq!(entries.generation, 3);
        let entry = entries.by_cluster.get("default/foo").unwrap();
        assert_eq!(entry.params.schedule, "0 1 * * *");
        assert_eq!(entry.params.history_limit, Some(3));
    }

    #[tokio::test]
    async fn empty_schedule_unregisters() {
        let (scheduler, _shutdown) = scheduler();
        scheduler.register(&cluster(Some("0 0 * * *"), None)).await.unwrap();
        scheduler.register(&cluster(None, None)).await.unwrap();
        assert_eq!(scheduler.len().await, 0);
        scheduler.register(&cluster(Some("0 0 * * *"), None)).await.unwrap();
        scheduler.unregister("default", "foo").await;
        assert_eq!(scheduler.len().await, 0);
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected() {
        let (scheduler, _shutdown) = scheduler();
        assert!(scheduler.register(&cluster(Some("nope"), None)).await.is_err());
        assert_eq!(scheduler.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_schedules() {
        let store = Arc::new(MemoryStore {
            complete_on_create: true,
            ..MemoryStore::default()
        });
        let (scheduler, shutdown) = scheduler_over(Arc::clone(&store));
        scheduler.register(&cluster(Some("* * * * * *"), None)).await.unwrap();
        assert_eq!(scheduler.len().await, 1);
        shutdown.send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.len().await, 0);
        assert_eq!(store.create_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        scheduler.register(&cluster(Some("* * * * * *"), None)).await.unwrap();
        assert_eq!(scheduler.len().await, 0);
    }
}
