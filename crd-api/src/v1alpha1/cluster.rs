// The `JsonSchema` and `CustomResource` macro generates codes that does not pass the clippy lint.
#![allow(clippy::str_to_string)]
#![allow(clippy::missing_docs_in_private_items)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use garde::Validate;
use k8s_openapi::api::core::v1::{
    Affinity, EmptyDirVolumeSource, HostPathVolumeSource, LocalObjectReference,
    PersistentVolumeClaimSpec, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::serde::{Deserialize, Serialize};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;

use super::condition::{ConditionStatus, Conditions};

/// The value of the `app.kubernetes.io/managed-by` label on managed objects
pub const MANAGED_BY: &str = "mysql.presslabs.org";
/// The label holding the owning cluster name
pub const LABEL_CLUSTER: &str = "mysql.presslabs.org/cluster";
/// The headless service shared by all clusters in a namespace
pub const HEADLESS_SERVICE_NAME: &str = "mysql";
/// Default number of replicas when `.spec.replicas` is not set
pub const DEFAULT_REPLICAS: i32 = 1;

/// Mysql cluster specification
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema, Validate)]
#[kube(
    group = "mysql.presslabs.org",
    version = "v1alpha1",
    kind = "MysqlCluster",
    singular = "mysqlcluster",
    plural = "mysqlclusters",
    namespaced,
    status = "MysqlClusterStatus",
    shortname = "mysql",
    scale = r#"{"specReplicasPath":".spec.replicas", "statusReplicasPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type == 'Ready')].status"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
#[garde(allow_unvalidated)]
pub struct MysqlClusterSpec {
    /// The number of mysql nodes, defaults to 1
    #[garde(range(min = 0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// The secret holding `ROOT_PASSWORD` and optional user credentials
    #[garde(length(min = 1))]
    #[serde(default)]
    pub secret_name: String,
    /// The mysql version, used to pick the image, defaults to 5.7
    #[garde(pattern(r"^\d+\.\d+(\.\d+)?$"))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_version: Option<String>,
    /// Overrides the mysql image picked by version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Bucket URL to initialize the cluster from
    #[serde(rename = "initBucketURL", skip_serializing_if = "Option::is_none")]
    pub init_bucket_url: Option<String>,
    /// Deprecated alias of `initBucketURL`
    #[serde(rename = "initBucketURI", skip_serializing_if = "Option::is_none")]
    pub init_bucket_uri: Option<String>,
    /// The secret with credentials to access the init bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_bucket_secret_name: Option<String>,
    /// The minimum number of available pods, enables the PodDisruptionBudget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_available: Option<String>,
    /// Cron expression of the recurrent backups
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_schedule: Option<String>,
    /// Bucket URL where backups are stored
    #[serde(rename = "backupURL", skip_serializing_if = "Option::is_none")]
    pub backup_url: Option<String>,
    /// Deprecated alias of `backupURL`
    #[serde(rename = "backupUri", skip_serializing_if = "Option::is_none")]
    pub backup_uri: Option<String>,
    /// What happens with the remote data of scheduled backups when they are removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_remote_delete_policy: Option<DeletePolicy>,
    /// The secret with credentials to access the backup bucket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_secret_name: Option<String>,
    /// How many scheduled backups are kept, unlimited if not set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_schedule_jobs_history_limit: Option<usize>,
    /// Extra `my.cnf` options for the `[mysqld]` section
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mysql_conf: BTreeMap<String, IntOrString>,
    /// Pod level settings
    #[serde(default)]
    pub pod_spec: PodSpec,
    /// Storage of the mysql data
    #[garde(custom(volume_spec_is_set))]
    #[serde(default)]
    pub volume_spec: VolumeSpec,
    /// Replication lag in seconds after which a node is considered lagged, defaults to 30
    #[garde(range(min = 0))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_slave_latency: Option<i64>,
    /// Enables pt-kill with the given limits
    #[garde(dive)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_limits: Option<QueryLimits>,
    /// Set the whole cluster read only
    #[serde(default)]
    pub read_only: bool,
    /// Offset added to the mysql `server-id` of every node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id_offset: Option<i32>,
}

/// Remote storage policy when a backup is deleted
#[allow(clippy::exhaustive_enums)] // the policy is either keep or remove
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Keep the remote data
    #[default]
    Retain,
    /// Remove the remote data, gated by a finalizer
    Delete,
}

/// Pod level settings of the mysql statefulset
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Image pull policy of all containers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Image pull secrets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,
    /// Extra pod labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Extra pod annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Resources of the mysql container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Pod affinity, defaults to a preferred anti-affinity between nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    /// Node selector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Priority class
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    /// Tolerations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    /// Service account of the pods, also used by backup jobs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Storage of the mysql data, exactly one source is expected
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Ephemeral storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    /// Host path storage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    /// Persistent storage, one claim per pod
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimSpec>,
}

/// Check that a storage source is specified
fn volume_spec_is_set(spec: &VolumeSpec, _ctx: &()) -> garde::Result {
    if spec.empty_dir.is_none() && spec.host_path.is_none() && spec.persistent_volume_claim.is_none()
    {
        return Err(garde::Error::new("no .spec.volumeSpec is specified"));
    }
    Ok(())
}

/// pt-kill settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
#[garde(allow_unvalidated)]
pub struct QueryLimits {
    /// Kill connections idle for longer than this, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_time: Option<i32>,
    /// Kill queries running for longer than this, in seconds
    #[garde(range(min = 1))]
    pub max_query_time: i32,
    /// Which queries to kill when many match, e.g. `oldest`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill: Option<String>,
    /// Kill the `query` or the whole `connection`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_mode: Option<String>,
    /// Databases to ignore
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_db: Vec<String>,
    /// Commands to ignore
    #[serde(default, rename = "ignoreCommands", skip_serializing_if = "Vec::is_empty")]
    pub ignore_command: Vec<String>,
    /// Users to ignore
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_user: Vec<String>,
}

/// Cluster level condition types
#[allow(clippy::exhaustive_enums)] // new types need a new api version
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum ClusterConditionType {
    /// All nodes are ready and replicating from a master
    Ready,
    /// Some failover recovery is not acknowledged yet
    #[serde(rename = "PendingFailoverAck")]
    FailoverAck,
    /// The cluster is in read only mode
    ReadOnly,
    /// A failover is in progress
    FailoverInProgress,
}

/// Per node condition types
#[allow(clippy::exhaustive_enums)] // new types need a new api version
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum NodeConditionType {
    /// Replication lag exceeds the configured limit
    Lagged,
    /// Both replication threads are running
    Replicating,
    /// The node is the writable master
    Master,
    /// The node is read only
    ReadOnly,
}

/// Observed state of a single node
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// The node hostname
    pub name: String,
    /// Node conditions
    #[serde(default)]
    pub conditions: Conditions<NodeConditionType>,
}

/// Mysql cluster status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MysqlClusterStatus {
    /// Ready replicas of the statefulset
    #[serde(default)]
    pub ready_nodes: i32,
    /// Cluster conditions
    #[serde(default)]
    pub conditions: Conditions<ClusterConditionType>,
    /// Node statuses in the order they were first observed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeStatus>,
}

impl MysqlClusterStatus {
    /// Returns the status of the node, if known
    #[inline]
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Returns the status of the node, appending an empty one if missing
    #[inline]
    pub fn node_mut(&mut self, name: &str) -> &mut NodeStatus {
        let position = if let Some(position) = self.nodes.iter().position(|n| n.name == name) {
            position
        } else {
            self.nodes.push(NodeStatus {
                name: name.to_owned(),
                conditions: Conditions::default(),
            });
            self.nodes.len().saturating_sub(1)
        };
        let Some(node) = self.nodes.get_mut(position) else {
            unreachable!("the node status is just found or inserted")
        };
        node
    }

    /// Returns the node condition status, if set
    #[inline]
    #[must_use]
    pub fn node_condition(&self, name: &str, type_: NodeConditionType) -> Option<ConditionStatus> {
        self.node(name).and_then(|node| node.conditions.status(type_))
    }

    /// Set a node condition, returns true if the status changed
    #[inline]
    pub fn set_node_condition(
        &mut self,
        name: &str,
        type_: NodeConditionType,
        status: ConditionStatus,
        now: DateTime<Utc>,
    ) -> bool {
        self.node_mut(name)
            .conditions
            .set(type_, status, "", "", now)
    }

    /// Set a cluster condition, returns true if the status changed
    #[inline]
    pub fn set_condition(
        &mut self,
        type_: ClusterConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.conditions.set(type_, status, reason, message, now)
    }
}

/// Names of the objects owned by a cluster
#[allow(clippy::exhaustive_enums)] // the owned objects are fixed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceName {
    /// The mysql statefulset
    StatefulSet,
    /// `my.cnf` config map
    ConfigMap,
    /// The service selecting the master
    MasterService,
    /// The service selecting healthy nodes
    HealthyNodesService,
    /// The service selecting healthy replicas
    HealthyReplicasService,
    /// The shared headless service
    HeadlessService,
    /// The per cluster headless service used before schema version 300
    OldHeadlessService,
    /// The pod disruption budget
    PodDisruptionBudget,
    /// The secret with operator managed credentials
    OperatedSecret,
}

impl ResourceName {
    /// Returns the object name for cluster `cluster_name`
    #[inline]
    #[must_use]
    pub fn for_cluster(self, cluster_name: &str) -> String {
        match self {
            Self::StatefulSet
            | Self::ConfigMap
            | Self::HealthyNodesService
            | Self::PodDisruptionBudget => format!("{cluster_name}-mysql"),
            Self::MasterService => format!("{cluster_name}-mysql-master"),
            Self::HealthyReplicasService => format!("{cluster_name}-mysql-replicas"),
            Self::HeadlessService => HEADLESS_SERVICE_NAME.to_owned(),
            Self::OldHeadlessService => format!("{cluster_name}-mysql-nodes"),
            Self::OperatedSecret => format!("{cluster_name}-mysql-operated"),
        }
    }
}

impl MysqlCluster {
    /// The desired number of replicas
    #[inline]
    #[must_use]
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    /// The name of an owned object
    #[inline]
    #[must_use]
    pub fn name_for(&self, resource: ResourceName) -> String {
        resource.for_cluster(&self.name_any())
    }

    /// The namespace, empty for objects not yet bound to one
    #[inline]
    #[must_use]
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_default()
    }

    /// The hostname of the pod with ordinal `index`
    #[inline]
    #[must_use]
    pub fn pod_hostname(&self, index: i32) -> String {
        format!(
            "{}-{index}.{}.{}",
            self.name_for(ResourceName::StatefulSet),
            self.name_for(ResourceName::HeadlessService),
            self.namespace_or_default()
        )
    }

    /// The alias of this cluster in orchestrator
    #[inline]
    #[must_use]
    pub fn cluster_alias(&self) -> String {
        format!("{}.{}", self.name_any(), self.namespace_or_default())
    }

    /// The host the replicas should follow: the node with a `Master=True`
    /// condition, node 0 if none
    #[inline]
    #[must_use]
    pub fn master_host(&self) -> String {
        self.status
            .as_ref()
            .and_then(|status| {
                status
                    .nodes
                    .iter()
                    .rev()
                    .find(|node| node.conditions.is_true(NodeConditionType::Master))
            })
            .map_or_else(|| self.pod_hostname(0), |node| node.name.clone())
    }

    /// The cluster condition status, if set
    #[inline]
    #[must_use]
    pub fn condition(&self, type_: ClusterConditionType) -> Option<ConditionStatus> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.status(type_))
    }

    /// The maximum accepted replication lag
    #[inline]
    #[must_use]
    pub fn max_slave_latency(&self, default: i64) -> i64 {
        self.spec.max_slave_latency.unwrap_or(default)
    }

    /// Labels used to select the pods of this cluster
    #[inline]
    #[must_use]
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        [
            (LABEL_CLUSTER, self.name_any()),
            ("app.kubernetes.io/name", "mysql".to_owned()),
            ("app.kubernetes.io/managed-by", MANAGED_BY.to_owned()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
    }

    /// All labels set on the owned objects.
    /// `instance`, `component` and `part-of` can be overridden by cluster annotations.
    #[inline]
    #[must_use]
    pub fn labels_with_version(&self, version: &str) -> BTreeMap<String, String> {
        let annotations = self.annotations();
        let mut labels = self.selector_labels();
        let instance = annotations
            .get("app.kubernetes.io/instance")
            .cloned()
            .unwrap_or_else(|| self.name_any());
        let component = annotations
            .get("app.kubernetes.io/component")
            .cloned()
            .unwrap_or_else(|| "database".to_owned());
        let _prev = labels.insert("app.kubernetes.io/instance".to_owned(), instance);
        let _prev = labels.insert("app.kubernetes.io/component".to_owned(), component);
        let _prev = labels.insert("app.kubernetes.io/version".to_owned(), version.to_owned());
        if let Some(part_of) = annotations.get("app.kubernetes.io/part-of") {
            let _prev = labels.insert("app.kubernetes.io/part-of".to_owned(), part_of.clone());
        }
        labels
    }
}
