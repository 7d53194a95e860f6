use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crd_api::v1alpha1::{
    BackupConditionType, ConditionStatus, MysqlBackup, MysqlCluster, NodeConditionType,
    ResourceName,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, PodSpec, PodTemplateSpec, SecretEnvSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use utils::consts::RCLONE_CONFIG_FILE;

use crate::config::OperatorOptions;
use crate::consts::LABEL_BACKUP_CLUSTER;
use crate::manager::cluster::{Factory, BACKUP_PASSWORD_KEY, BACKUP_USER_KEY};

/// The extension of backup archives
const BACKUP_SUFFIX: &str = "xbackup.gz";
/// Label on deletion jobs with the backup name
pub(crate) const LABEL_BACKUP: &str = "backup";
/// Label marking deletion jobs
pub(crate) const LABEL_CLEANUP_JOB: &str = "cleanup-job";

/// Backup URL resolution failure
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("can't get bucketURI")]
pub(crate) struct NoBucket;

/// Name of the Job taking the backup
pub(crate) fn backup_job_name(backup: &str) -> String {
    format!("{backup}-bjob")
}

/// Name of the Job removing the remote archive
pub(crate) fn deletion_job_name(backup: &str) -> String {
    format!("{backup}-backup-cleanup")
}

/// Compose the archive URL of a backup.
///
/// An explicit URL already pointing to an archive is used as is, an explicit
/// bucket gets `<backup>-<timestamp>.xbackup.gz` appended, the cluster bucket
/// is the last resort.
pub(crate) fn compose_backup_url(
    backup_name: &str,
    explicit: Option<&str>,
    cluster_bucket: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String, NoBucket> {
    if let Some(url) = explicit.filter(|u| u.ends_with(BACKUP_SUFFIX)) {
        return Ok(url.to_owned());
    }
    let bucket = explicit
        .or(cluster_bucket)
        .filter(|u| !u.is_empty())
        .ok_or(NoBucket)?;
    Ok(format!(
        "{}/{backup_name}-{}.{BACKUP_SUFFIX}",
        bucket.trim_end_matches('/'),
        now.format("%Y-%m-%dT%H:%M:%S")
    ))
}

/// The bucket of the cluster backups, preferring `backupURL`
pub(crate) fn cluster_bucket(cluster: &MysqlCluster) -> Option<&str> {
    cluster
        .spec
        .backup_url
        .as_deref()
        .filter(|u| !u.is_empty())
        .or(cluster.spec.backup_uri.as_deref())
        .filter(|u| !u.is_empty())
}

/// Fill the backup URL and secret from the cluster.
/// Returns true if the spec changed.
///
/// The composed URL lands in `spec.backupURL`, not in the status: the stored
/// object keeps the archive location across restarts, and completed backups
/// that only carry the legacy `status.backupUri` are moved there by
/// [`migrate_backup`].
pub(crate) fn set_backup_defaults(
    backup: &mut MysqlBackup,
    cluster: &MysqlCluster,
    now: DateTime<Utc>,
) -> Result<bool, NoBucket> {
    let mut changed = false;
    let explicit = backup.backup_url().map(ToOwned::to_owned);
    let url = compose_backup_url(
        &backup.name_any(),
        explicit.as_deref(),
        cluster_bucket(cluster),
        now,
    )?;
    if explicit.as_deref() != Some(url.as_str()) {
        backup.spec.backup_url = Some(url);
        changed = true;
    }
    if backup.spec.backup_secret_name.as_deref().map_or(true, str::is_empty) {
        if let Some(secret) = cluster
            .spec
            .backup_secret_name
            .as_ref()
            .filter(|s| !s.is_empty())
        {
            backup.spec.backup_secret_name = Some(secret.clone());
            changed = true;
        }
    }
    Ok(changed)
}

/// Copy the URL of a backup completed by an older operator into the spec.
/// Returns true if the spec changed.
pub(crate) fn migrate_backup(backup: &mut MysqlBackup) -> bool {
    if backup.backup_url().is_some() || !backup.is_completed() {
        return false;
    }
    let Some(uri) = backup
        .status
        .as_ref()
        .and_then(|status| status.backup_uri.clone())
        .filter(|u| !u.is_empty())
    else {
        return false;
    };
    backup.spec.backup_url = Some(uri);
    true
}

/// The node to take the backup from: the configured one, else the first
/// healthy replica, else node 0
pub(crate) fn backup_candidate(backup: &MysqlBackup, cluster: &MysqlCluster) -> String {
    if let Some(node) = backup.spec.candidate_node.as_ref().filter(|n| !n.is_empty()) {
        return node.clone();
    }
    let healthy_replica = cluster.status.as_ref().and_then(|status| {
        status.nodes.iter().find(|node| {
            let conditions = &node.conditions;
            match (
                conditions.status(NodeConditionType::Master),
                conditions.status(NodeConditionType::Replicating),
                conditions.status(NodeConditionType::Lagged),
            ) {
                (Some(master), Some(replicating), Some(lagged)) => {
                    master != ConditionStatus::True
                        && replicating == ConditionStatus::True
                        && lagged != ConditionStatus::True
                }
                _ => false,
            }
        })
    });
    healthy_replica.map_or_else(|| cluster.pod_hostname(0), |node| node.name.clone())
}

/// Env from the given secret
fn secret_env_from(name: &str) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: Some(name.to_owned()),
            optional: None,
        }),
        ..EnvFromSource::default()
    }
}

/// A one container job owned by `owner`
fn one_shot_job(
    name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    owner: &MysqlBackup,
    pod: PodSpec,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace,
            labels: Some(labels),
            owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_owned()),
                    ..pod
                }),
            },
            ..JobSpec::default()
        }),
        ..Job::default()
    }
}

/// The job streaming a backup from the candidate node to the bucket
pub(crate) fn backup_job(
    backup: &MysqlBackup,
    cluster: &MysqlCluster,
    url: &str,
    options: &OperatorOptions,
) -> Job {
    let operated = cluster.name_for(ResourceName::OperatedSecret);
    let container = Container {
        name: "backup".to_owned(),
        image: Some(options.sidecar_image.clone()),
        image_pull_policy: Some(options.image_pull_policy.clone()),
        args: Some(vec![
            "take-backup-to".to_owned(),
            backup_candidate(backup, cluster),
            url.to_owned(),
        ]),
        env: Some(vec![
            Factory::secret_env("MYSQL_BACKUP_USER", &operated, BACKUP_USER_KEY, true),
            Factory::secret_env("MYSQL_BACKUP_PASSWORD", &operated, BACKUP_PASSWORD_KEY, true),
        ]),
        env_from: backup
            .spec
            .backup_secret_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| vec![secret_env_from(s)]),
        ..Container::default()
    };
    one_shot_job(
        backup_job_name(&backup.name_any()),
        backup.namespace(),
        [(LABEL_BACKUP_CLUSTER.to_owned(), backup.spec.cluster_name.clone())].into(),
        backup,
        PodSpec {
            containers: vec![container],
            image_pull_secrets: cluster.spec.pod_spec.image_pull_secrets.clone(),
            ..PodSpec::default()
        },
    )
}

/// The rclone remote of a bucket URL, `gs://bucket/a` becomes `gs:bucket/a`
pub(crate) fn rclone_remote(url: &str) -> String {
    url.replacen("://", ":", 1)
}

/// The job removing the remote archive of a backup.
/// The cluster may already be gone, its service account and pull secrets are
/// used when known.
pub(crate) fn deletion_job(
    backup: &MysqlBackup,
    cluster: Option<&MysqlCluster>,
    url: &str,
    options: &OperatorOptions,
) -> Job {
    let pod_spec = cluster.map(|c| &c.spec.pod_spec);
    let container = Container {
        name: "delete".to_owned(),
        image: Some(options.sidecar_image.clone()),
        image_pull_policy: Some(options.image_pull_policy.clone()),
        args: Some(vec![
            "rclone".to_owned(),
            format!("--config={RCLONE_CONFIG_FILE}"),
            "delete".to_owned(),
            rclone_remote(url),
        ]),
        env_from: backup
            .spec
            .backup_secret_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| vec![secret_env_from(s)]),
        ..Container::default()
    };
    one_shot_job(
        deletion_job_name(&backup.name_any()),
        backup.namespace(),
        [
            (LABEL_BACKUP.to_owned(), backup.name_any()),
            (LABEL_CLEANUP_JOB.to_owned(), "true".to_owned()),
        ]
        .into(),
        backup,
        PodSpec {
            containers: vec![container],
            service_account_name: pod_spec.and_then(|p| p.service_account_name.clone()),
            image_pull_secrets: pod_spec.and_then(|p| p.image_pull_secrets.clone()),
            ..PodSpec::default()
        },
    )
}

/// Parse a kubernetes condition status
fn parse_status(status: &str) -> ConditionStatus {
    match status {
        "True" => ConditionStatus::True,
        "False" => ConditionStatus::False,
        _ => ConditionStatus::Unknown,
    }
}

/// Terminal state of a job
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct JobOutcome {
    /// `Complete=True`
    pub(crate) complete: bool,
    /// `Failed=True`
    pub(crate) failed: bool,
}

/// The terminal state of a job
pub(crate) fn job_outcome(job: &Job) -> JobOutcome {
    let is_true = |type_: &str| {
        job.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == type_ && parse_status(&c.status) == ConditionStatus::True)
            })
    };
    JobOutcome {
        complete: is_true("Complete"),
        failed: is_true("Failed"),
    }
}

/// Project the job conditions on the backup status.
/// Returns true if the status changed.
pub(crate) fn project_job_status(backup: &mut MysqlBackup, job: &Job, now: DateTime<Utc>) -> bool {
    let conditions = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    let status = backup.status.get_or_insert_with(Default::default);
    let before = status.clone();
    for (job_type, backup_type) in [
        ("Complete", BackupConditionType::Complete),
        ("Failed", BackupConditionType::Failed),
    ] {
        let Some(cond) = conditions.iter().find(|c| c.type_ == job_type) else {
            continue;
        };
        let cond_status = parse_status(&cond.status);
        let _ig = status.conditions.set(
            backup_type,
            cond_status,
            cond.reason.clone().unwrap_or_default(),
            cond.message.clone().unwrap_or_default(),
            now,
        );
        if backup_type == BackupConditionType::Complete && cond_status == ConditionStatus::True {
            status.completed = true;
        }
    }
    *status != before
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use crd_api::v1alpha1::{MysqlBackupSpec, MysqlBackupStatus, MysqlClusterSpec, MysqlClusterStatus};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 5, 16, 13, 15, 5).unwrap()
    }

    fn cluster() -> MysqlCluster {
        let mut cluster = MysqlCluster::new(
            "foo",
            MysqlClusterSpec {
                replicas: Some(3),
                secret_name: "foo-secret".to_owned(),
                backup_url: Some("gs://b/".to_owned()),
                backup_secret_name: Some("bucket-secret".to_owned()),
                ..MysqlClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_owned());
        cluster
    }

    fn backup(name: &str) -> MysqlBackup {
        let mut backup = MysqlBackup::new(
            name,
            MysqlBackupSpec {
                cluster_name: "foo".to_owned(),
                ..MysqlBackupSpec::default()
            },
        );
        backup.metadata.namespace = Some("default".to_owned());
        backup
    }

    fn job_with(conditions: &[(&str, &str)]) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|&(t, s)| JobCondition {
                            type_: t.to_owned(),
                            status: s.to_owned(),
                            reason: Some("Reason".to_owned()),
                            ..JobCondition::default()
                        })
                        .collect(),
                ),
                ..JobStatus::default()
            }),
            ..Job::default()
        }
    }

    #[test]
    fn url_from_cluster_bucket() {
        let url = compose_backup_url("bk1", None, Some("gs://b/"), now()).unwrap();
        assert_eq!(url, "gs://b/bk1-2018-05-16T13:15:05.xbackup.gz");
    }

    #[test]
    fn url_precedence() {
        let url = compose_backup_url("bk1", Some("s3://x/y.xbackup.gz"), Some("gs://b"), now());
        assert_eq!(url.unwrap(), "s3://x/y.xbackup.gz");
        let url = compose_backup_url("bk1", Some("s3://x"), Some("gs://b"), now());
        assert_eq!(url.unwrap(), "s3://x/bk1-2018-05-16T13:15:05.xbackup.gz");
        assert_eq!(compose_backup_url("bk1", None, Some(""), now()), Err(NoBucket));
        assert_eq!(compose_backup_url("bk1", None, None, now()), Err(NoBucket));
    }

    #[test]
    fn defaults_come_from_cluster() {
        let mut b = backup("bk1");
        assert!(set_backup_defaults(&mut b, &cluster(), now()).unwrap());
        assert_eq!(
            b.backup_url(),
            Some("gs://b/bk1-2018-05-16T13:15:05.xbackup.gz")
        );
        assert_eq!(b.spec.backup_secret_name.as_deref(), Some("bucket-secret"));
        assert_eq!(
            b.spec.backup_url.as_deref(),
            Some("gs://b/bk1-2018-05-16T13:15:05.xbackup.gz")
        );
        assert!(b.status.as_ref().map_or(true, |s| s.backup_uri.is_none()));
        assert!(
            !set_backup_defaults(&mut b, &cluster(), now()).unwrap(),
            "the second pass is a no-op"
        );
    }

    #[test]
    fn legacy_status_uri_moves_to_spec() {
        let mut b = backup("old");
        assert!(!migrate_backup(&mut b));
        b.status = Some(MysqlBackupStatus {
            completed: true,
            backup_uri: Some("gs://b/old.xbackup.gz".to_owned()),
            ..MysqlBackupStatus::default()
        });
        assert!(migrate_backup(&mut b));
        assert_eq!(b.backup_url(), Some("gs://b/old.xbackup.gz"));
        assert!(!migrate_backup(&mut b));
    }

    #[test]
    fn candidate_is_a_healthy_replica() {
        let mut c = cluster();
        let b = backup("bk1");
        assert_eq!(backup_candidate(&b, &c), "foo-mysql-0.mysql.default");

        let mut status = MysqlClusterStatus::default();
        let set = |status: &mut MysqlClusterStatus, node: &str, m, r, l| {
            let _ig = status.set_node_condition(node, NodeConditionType::Master, m, now());
            let _ig = status.set_node_condition(node, NodeConditionType::Replicating, r, now());
            let _ig = status.set_node_condition(node, NodeConditionType::Lagged, l, now());
        };
        use ConditionStatus::{False, True};
        set(&mut status, "foo-mysql-0.mysql.default", True, False, False);
        set(&mut status, "foo-mysql-1.mysql.default", False, True, True);
        set(&mut status, "foo-mysql-2.mysql.default", False, True, False);
        c.status = Some(status);
        assert_eq!(backup_candidate(&b, &c), "foo-mysql-2.mysql.default");

        let mut b = backup("bk2");
        b.spec.candidate_node = Some("foo-mysql-1.mysql.default".to_owned());
        assert_eq!(backup_candidate(&b, &c), "foo-mysql-1.mysql.default");
    }

    #[test]
    fn backup_job_spec() {
        let c = cluster();
        let mut b = backup("bk1");
        let _ig = set_backup_defaults(&mut b, &c, now());
        let job = backup_job(&b, &c, "gs://b/x.xbackup.gz", &OperatorOptions::default());
        assert_eq!(job.metadata.name.as_deref(), Some("bk1-bjob"));
        assert_eq!(job.metadata.labels.unwrap()["cluster"], "foo");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.name, "backup");
        assert_eq!(
            container.args.clone().unwrap(),
            ["take-backup-to", "foo-mysql-0.mysql.default", "gs://b/x.xbackup.gz"]
        );
        let env = container.env.clone().unwrap();
        assert_eq!(env[0].name, "MYSQL_BACKUP_USER");
        let from = container.env_from.clone().unwrap();
        assert_eq!(
            from[0].secret_ref.as_ref().and_then(|s| s.name.as_deref()),
            Some("bucket-secret")
        );
    }

    #[test]
    fn deletion_job_spec() {
        let mut c = cluster();
        c.spec.pod_spec.service_account_name = Some("mysql-sa".to_owned());
        let b = backup("bk1");
        let job = deletion_job(&b, Some(&c), "gs://b/bk1.xbackup.gz", &OperatorOptions::default());
        assert_eq!(job.metadata.name.as_deref(), Some("bk1-backup-cleanup"));
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_BACKUP], "bk1");
        assert_eq!(labels[LABEL_CLEANUP_JOB], "true");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("mysql-sa"));
        assert_eq!(
            pod.containers[0].args.clone().unwrap(),
            ["rclone", "--config=/etc/rclone.conf", "delete", "gs:b/bk1.xbackup.gz"]
        );

        let orphan = deletion_job(&b, None, "gs://b/bk1.xbackup.gz", &OperatorOptions::default());
        assert!(orphan.spec.unwrap().template.spec.unwrap().service_account_name.is_none());
    }

    #[test]
    fn job_conditions_are_projected() {
        let mut b = backup("bk1");
        assert!(!project_job_status(&mut b, &Job::default(), now()));
        assert!(!b.is_completed());

        let job = job_with(&[("Complete", "True")]);
        assert!(project_job_status(&mut b, &job, now()));
        assert!(b.is_completed());
        assert!(!project_job_status(&mut b, &job, now()));
        assert_eq!(job_outcome(&job), JobOutcome { complete: true, failed: false });

        let mut b = backup("bk2");
        let job = job_with(&[("Failed", "True")]);
        assert!(project_job_status(&mut b, &job, now()));
        assert!(!b.is_completed());
        let conditions = &b.status.as_ref().unwrap().conditions;
        assert!(conditions.is_true(BackupConditionType::Failed));
        assert_eq!(job_outcome(&job), JobOutcome { complete: false, failed: true });
    }
}
