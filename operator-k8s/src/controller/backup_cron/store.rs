use async_trait::async_trait;
use crd_api::v1alpha1::{MysqlBackup, MysqlCluster};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};

use crate::consts::{LABEL_BACKUP_CLUSTER, LABEL_RECURRENT};
use crate::controller::is_not_found;

/// The backup objects the scheduler reads and writes
#[async_trait]
pub(crate) trait BackupStore: Send + Sync {
    /// The scheduled backups of a cluster
    async fn list_recurrent(&self, namespace: &str, cluster: &str) -> kube::Result<Vec<MysqlBackup>>;

    /// Create a backup
    async fn create(&self, backup: &MysqlBackup) -> kube::Result<()>;

    /// Get a backup, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> kube::Result<Option<MysqlBackup>>;

    /// Delete a backup, a missing one is not an error
    async fn delete(&self, namespace: &str, name: &str) -> kube::Result<()>;

    /// Whether the cluster still exists
    async fn cluster_exists(&self, namespace: &str, name: &str) -> kube::Result<bool>;
}

/// The label selector of the scheduled backups of a cluster
pub(crate) fn recurrent_selector(cluster: &str) -> String {
    format!("{LABEL_RECURRENT}=true,{LABEL_BACKUP_CLUSTER}={cluster}")
}

/// Backups stored in kubernetes
pub(crate) struct KubeBackupStore {
    /// Kubernetes client
    kube_client: Client,
}

impl KubeBackupStore {
    /// New a store over `kube_client`
    pub(crate) fn new(kube_client: Client) -> Self {
        Self { kube_client }
    }

    /// Backups api of a namespace
    fn api(&self, namespace: &str) -> Api<MysqlBackup> {
        Api::namespaced(self.kube_client.clone(), namespace)
    }
}

#[async_trait]
impl BackupStore for KubeBackupStore {
    async fn list_recurrent(&self, namespace: &str, cluster: &str) -> kube::Result<Vec<MysqlBackup>> {
        let params = ListParams::default().labels(&recurrent_selector(cluster));
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn create(&self, backup: &MysqlBackup) -> kube::Result<()> {
        let namespace = backup.metadata.namespace.as_deref().unwrap_or_default();
        let _backup = self
            .api(namespace)
            .create(&PostParams::default(), backup)
            .await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> kube::Result<Option<MysqlBackup>> {
        self.api(namespace).get_opt(name).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> kube::Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_deleted) => Ok(()),
            Err(ref err) if is_not_found(err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn cluster_exists(&self, namespace: &str, name: &str) -> kube::Result<bool> {
        let api: Api<MysqlCluster> = Api::namespaced(self.kube_client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use crd_api::v1alpha1::MysqlBackupStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::ResourceExt;
    use tokio::sync::Mutex;

    use super::*;

    /// A store keeping backups in memory
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        /// Backups by name
        pub(crate) backups: Mutex<BTreeMap<String, MysqlBackup>>,
        /// Created backups are completed right away
        pub(crate) complete_on_create: bool,
        /// The next creations failing
        pub(crate) failing_creates: AtomicUsize,
        /// Creation attempts
        pub(crate) create_calls: AtomicUsize,
        /// Whether the cluster exists
        pub(crate) cluster_missing: bool,
    }

    impl MemoryStore {
        /// Insert a backup created `age_secs` seconds ago
        pub(crate) async fn insert(&self, name: &str, completed: bool, age_secs: i64) {
            let mut backup = MysqlBackup::new(name, Default::default());
            backup.metadata.namespace = Some("default".to_owned());
            backup.metadata.creation_timestamp =
                Some(Time(Utc::now() - chrono::Duration::seconds(age_secs)));
            backup.status = Some(MysqlBackupStatus {
                completed,
                ..MysqlBackupStatus::default()
            });
            let _prev = self.backups.lock().await.insert(name.to_owned(), backup);
        }

        /// Names of the stored backups
        pub(crate) async fn names(&self) -> Vec<String> {
            self.backups.lock().await.keys().cloned().collect()
        }
    }

    #[async_trait]
    impl BackupStore for MemoryStore {
        async fn list_recurrent(&self, _namespace: &str, _cluster: &str) -> kube::Result<Vec<MysqlBackup>> {
            Ok(self.backups.lock().await.values().cloned().collect())
        }

        async fn create(&self, backup: &MysqlBackup) -> kube::Result<()> {
            let _prev_calls = self.create_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_creates.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_creates.store(failing - 1, Ordering::SeqCst);
                return Err(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_owned(),
                    message: "injected".to_owned(),
                    reason: "InternalError".to_owned(),
                    code: 500,
                }));
            }
            let mut backup = backup.clone();
            backup.metadata.creation_timestamp = Some(Time(Utc::now()));
            backup.status = Some(MysqlBackupStatus {
                completed: self.complete_on_create,
                ..MysqlBackupStatus::default()
            });
            let _prev = self.backups.lock().await.insert(backup.name_any(), backup);
            Ok(())
        }

        async fn get(&self, _namespace: &str, name: &str) -> kube::Result<Option<MysqlBackup>> {
            Ok(self.backups.lock().await.get(name).cloned())
        }

        async fn delete(&self, _namespace: &str, name: &str) -> kube::Result<()> {
            let _prev = self.backups.lock().await.remove(name);
            Ok(())
        }

        async fn cluster_exists(&self, _namespace: &str, _name: &str) -> kube::Result<bool> {
            Ok(!self.cluster_missing)
        }
    }
}
