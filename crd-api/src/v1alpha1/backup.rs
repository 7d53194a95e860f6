// The `JsonSchema` and `CustomResource` macro generates codes that does not pass the clippy lint.
#![allow(clippy::str_to_string)]
#![allow(clippy::missing_docs_in_private_items)]

use garde::Validate;
use k8s_openapi::serde::{Deserialize, Serialize};
use kube::CustomResource;
use schemars::JsonSchema;

use super::cluster::DeletePolicy;
use super::condition::Conditions;

/// The finalizer that gates the deletion of a backup on its remote data removal
pub const REMOTE_STORAGE_FINALIZER: &str = "backups.mysql.presslabs.org/remote-storage-cleanup";

/// Mysql backup specification
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, Validate)]
#[kube(
    group = "mysql.presslabs.org",
    version = "v1alpha1",
    kind = "MysqlBackup",
    singular = "mysqlbackup",
    plural = "mysqlbackups",
    namespaced,
    status = "MysqlBackupStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Completed", "type":"boolean", "jsonPath":".status.completed"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
#[garde(allow_unvalidated)]
pub struct MysqlBackupSpec {
    /// The cluster to back up
    #[garde(length(min = 1))]
    pub cluster_name: String,
    /// Full URL of the backup archive, generated from the cluster bucket if empty
    #[serde(rename = "backupURL", skip_serializing_if = "Option::is_none")]
    pub backup_url: Option<String>,
    /// Deprecated alias of `backupURL`
    #[serde(rename = "backupUri", skip_serializing_if = "Option::is_none")]
    pub backup_uri: Option<String>,
    /// The secret with bucket credentials, inherited from the cluster if empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_secret_name: Option<String>,
    /// What happens with the remote data when this object is removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_delete_policy: Option<DeletePolicy>,
    /// The node to take the backup from, picked automatically if empty
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_node: Option<String>,
}

/// Backup condition types
#[allow(clippy::exhaustive_enums)] // a backup either completes or fails
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum BackupConditionType {
    /// The backup job succeeded
    Complete,
    /// The backup job failed
    Failed,
}

/// Mysql backup status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlBackupStatus {
    /// Whether the backup job finished, successfully or not
    #[serde(default)]
    pub completed: bool,
    /// Where the archive is stored
    #[serde(rename = "backupUri", skip_serializing_if = "Option::is_none")]
    pub backup_uri: Option<String>,
    /// Backup conditions
    #[serde(default)]
    pub conditions: Conditions<BackupConditionType>,
}

impl MysqlBackup {
    /// The effective backup URL, preferring `backupURL` over the deprecated field
    #[inline]
    #[must_use]
    pub fn backup_url(&self) -> Option<&str> {
        self.spec
            .backup_url
            .as_deref()
            .or(self.spec.backup_uri.as_deref())
            .filter(|url| !url.is_empty())
    }

    /// The effective remote delete policy
    #[inline]
    #[must_use]
    pub fn delete_policy(&self) -> DeletePolicy {
        self.spec.remote_delete_policy.unwrap_or_default()
    }

    /// Whether the backup finished
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.completed)
    }

    /// Whether the remote storage finalizer is set
    #[inline]
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == REMOTE_STORAGE_FINALIZER))
    }
}

#[cfg(test)]
mod test {
    use garde::Validate;

    use super::*;

    #[test]
    fn backup_url_prefers_new_field() {
        let mut backup = MysqlBackup::new(
            "b",
            MysqlBackupSpec {
                cluster_name: "c".to_owned(),
                backup_uri: Some("gs://old/a.xbackup.gz".to_owned()),
                ..MysqlBackupSpec::default()
            },
        );
        assert_eq!(backup.backup_url(), Some("gs://old/a.xbackup.gz"));
        backup.spec.backup_url = Some("gs://new/a.xbackup.gz".to_owned());
        assert_eq!(backup.backup_url(), Some("gs://new/a.xbackup.gz"));
        assert_eq!(backup.delete_policy(), DeletePolicy::Retain);
        assert!(!backup.has_finalizer());
    }

    #[test]
    fn cluster_name_is_required() {
        assert!(Validate::validate(&MysqlBackupSpec::default(), &()).is_err());
    }

    #[test]
    fn status_deserialize() {
        let status: MysqlBackupStatus = serde_yaml::from_str(
            r"
completed: true
backupUri: gs://bucket/b.xbackup.gz
conditions:
  - type: Complete
    status: 'True'
    lastTransitionTime: '2023-01-01T00:00:00Z'
",
        )
        .unwrap();
        assert!(status.completed);
        assert!(status.conditions.is_true(BackupConditionType::Complete));
    }
}
