use std::time::Duration;

/// The default requeue duration to achieve eventual consistency
pub(crate) const DEFAULT_REQUEUE_DURATION: Duration = Duration::from_secs(600);
/// The requeue duration after a failed reconcile
pub(crate) const ERROR_REQUEUE_DURATION: Duration = Duration::from_secs(5);
/// The field manager identifier of mysql operator
pub(crate) const FIELD_MANAGER: &str = "mysql.presslabs.org/operator";
/// The name reported on published events
pub(crate) const EVENT_REPORTER: &str = "mysql-operator";
/// The annotation holding the structural version of a cluster
pub(crate) const ANNOTATION_VERSION: &str = "mysql.presslabs.org/version";
/// Cluster annotation disabling the purged GTID set restore on new replicas
pub(crate) const ANNOTATION_SKIP_GTID_PURGED: &str = "mysql.presslabs.org/SkipGTIDPurged";
/// The structural version this operator converges clusters to
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 300;
/// Pod label holding the node role
pub(crate) const LABEL_ROLE: &str = "role";
/// Pod label telling if the node may serve traffic
pub(crate) const LABEL_HEALTHY: &str = "healthy";
/// Label on backups created by the scheduler
pub(crate) const LABEL_RECURRENT: &str = "recurrent";
/// Label with the cluster name on backups and jobs
pub(crate) const LABEL_BACKUP_CLUSTER: &str = "cluster";
/// The `app.kubernetes.io/managed-by` label key
pub(crate) const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Pod condition set once the node was configured
pub(crate) const NODE_INITIALIZED_CONDITION: &str = "mysql.presslabs.org/NodeInitialized";
/// Default mysql version
pub(crate) const DEFAULT_MYSQL_VERSION: &str = "5.7";
/// Mysql uid and gid inside the images
pub(crate) const MYSQL_UID: i64 = 999;
/// The orchestrator reconcile tick
pub(crate) const DEFAULT_TOPOLOGY_PERIOD: u64 = 5;
