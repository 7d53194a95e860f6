use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crd_api::v1alpha1::{MysqlCluster, ResourceName};
use k8s_openapi::api::core::v1::{Pod, PodCondition, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use regex::Regex;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::OperatorOptions;
use crate::consts::{ANNOTATION_SKIP_GTID_PURGED, NODE_INITIALIZED_CONDITION};
use crate::controller::{Controller, ControllerMetrics, MetricsLabeled};
use crate::manager::cluster::{
    OPERATOR_PASSWORD_KEY, OPERATOR_USER_KEY, REPLICATION_PASSWORD_KEY, REPLICATION_USER_KEY,
};

use self::sql::{MysqlNode, NodeSql, SqlError};

/// Queries run on the nodes
mod sql;

/// Pods named after the statefulset of their cluster
const POD_NAME_PATTERN: &str = r"^(.+)-mysql-\d+$";
/// `SELECT 1` attempts before giving up on a node
const WAIT_ATTEMPTS: usize = 10;
/// Sleep before each `SELECT 1` attempt
const WAIT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Node initialization errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    /// Kubernetes api error
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// Query error
    #[error(transparent)]
    Sql(#[from] SqlError),
    /// The pod name does not tell its cluster
    #[error("pod name {0} can't be parsed")]
    PodName(String),
    /// The cluster of the pod does not exist
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
    /// The operated secret misses credentials
    #[error("validation error: some credentials are empty in secret {0}")]
    EmptyCredentials(String),
    /// The node never answered `SELECT 1`
    #[error("timeout: mysql is not ready on {0}")]
    NotReady(String),
    /// The initialization did not finish in time
    #[error("timeout initializing {0}")]
    Timeout(String),
    /// The pod is not namespaced
    #[error("pod {0} has no namespace")]
    MissingNamespace(String),
}

impl MetricsLabeled for Error {
    fn labels(&self) -> Vec<&str> {
        match *self {
            Self::Kube(ref err) => err.labels(),
            Self::Sql(_) => vec!["mysql error"],
            Self::NotReady(_) | Self::Timeout(_) => vec!["node not ready"],
            Self::PodName(_) | Self::MissingNamespace(_) => vec!["invalid pod"],
            Self::ClusterNotFound(_) => vec!["cluster not found"],
            Self::EmptyCredentials(_) => vec!["invalid secret"],
        }
    }
}

/// Controller result
type Result<T> = std::result::Result<T, Error>;

/// The credentials used to configure a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Credentials {
    /// Operator user
    pub(crate) user: String,
    /// Operator password
    pub(crate) password: String,
    /// Replication user
    pub(crate) replication_user: String,
    /// Replication password
    pub(crate) replication_password: String,
}

impl Credentials {
    /// Read the credentials from the operated secret, none may be empty
    pub(crate) fn from_secret(secret: &Secret) -> Result<Self> {
        let get = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| String::from_utf8_lossy(&value.0).into_owned())
                .unwrap_or_default()
        };
        let creds = Self {
            user: get(OPERATOR_USER_KEY),
            password: get(OPERATOR_PASSWORD_KEY),
            replication_user: get(REPLICATION_USER_KEY),
            replication_password: get(REPLICATION_PASSWORD_KEY),
        };
        if [
            &creds.user,
            &creds.password,
            &creds.replication_user,
            &creds.replication_password,
        ]
        .iter()
        .any(|s| s.is_empty())
        {
            return Err(Error::EmptyCredentials(secret.name_any()));
        }
        Ok(creds)
    }
}

/// Whether the pod reports `Ready=True`
pub(crate) fn is_ready(pod: &Pod) -> bool {
    pod_condition(pod, "Ready").is_some_and(|c| c.status == "True")
}

/// Whether the node of the pod was initialized
pub(crate) fn is_initialized(pod: &Pod) -> bool {
    pod_condition(pod, NODE_INITIALIZED_CONDITION).is_some_and(|c| c.status == "True")
}

/// A condition of the pod
fn pod_condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

/// The cluster a pod belongs to
pub(crate) fn cluster_name<'a>(pattern: &Regex, pod_name: &'a str) -> Option<&'a str> {
    pattern
        .captures(pod_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// The initialized condition of a pod, the transition time moves only when
/// the status changes
pub(crate) fn initialized_condition(
    pod: &Pod,
    status: bool,
    reason: &str,
    message: String,
    now: Time,
) -> PodCondition {
    let status = if status { "True" } else { "False" };
    let last_transition_time = match pod_condition(pod, NODE_INITIALIZED_CONDITION) {
        Some(prev) if prev.status == status => prev.last_transition_time.clone(),
        _ => Some(now),
    };
    PodCondition {
        type_: NODE_INITIALIZED_CONDITION.to_owned(),
        status: status.to_owned(),
        reason: Some(reason.to_owned()),
        message: Some(message),
        last_transition_time,
        last_probe_time: None,
    }
}

/// The address of the node of `pod`, reachable through the headless service
pub(crate) fn node_host(pod: &Pod, cluster: &MysqlCluster) -> String {
    let hostname = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.hostname.clone())
        .unwrap_or_else(|| pod.name_any());
    format!(
        "{hostname}.{}.{}",
        cluster.name_for(ResourceName::HeadlessService),
        pod.namespace().unwrap_or_default()
    )
}

/// Wait for the node to answer `SELECT 1`
async fn wait_ready(node: &dyn NodeSql) -> Result<()> {
    for attempt in 1..=WAIT_ATTEMPTS {
        tokio::time::sleep(WAIT_RETRY_DELAY).await;
        match node.ping().await {
            Ok(()) => return Ok(()),
            Err(err) => debug!(attempt, "mysql on {} is not ready: {err}", node.host()),
        }
    }
    Err(Error::NotReady(node.host().to_owned()))
}

/// How a node joins its cluster
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeRole<'a> {
    /// Address of the cluster master
    pub(crate) master_host: &'a str,
    /// Whether a replica takes the purged GTID set of its restored backup
    pub(crate) purge_gtid: bool,
}

impl<'a> NodeRole<'a> {
    /// The role in `cluster`, the skip annotation disables the GTID restore
    pub(crate) fn of(cluster: &MysqlCluster, master_host: &'a str) -> Self {
        Self {
            master_host,
            purge_gtid: !cluster.annotations().contains_key(ANNOTATION_SKIP_GTID_PURGED),
        }
    }
}

/// Configure a freshly started node: replicate from the master unless the
/// node is the master, then mark it configured. Super read only is restored
/// whatever the outcome, the writable switch belongs to the topology
/// reconcile.
pub(crate) async fn initialize(node: &dyn NodeSql, role: NodeRole<'_>, creds: &Credentials) -> Result<()> {
    wait_ready(node).await?;
    if node.is_configured().await? {
        debug!("mysql on {} is already configured, skip", node.host());
        return Ok(());
    }
    node.disable_super_read_only().await?;
    let result = configure(node, role, creds).await;
    if let Err(err) = node.enable_super_read_only().await {
        error!("failed to set super read only on {}: {err}", node.host());
    }
    result
}

/// The configuration done with super read only disabled
async fn configure(node: &dyn NodeSql, role: NodeRole<'_>, creds: &Credentials) -> Result<()> {
    let master_host = role.master_host;
    if node.host() != master_host {
        info!("configure {} as slave of {master_host}", node.host());
        if role.purge_gtid && node.set_purged_gtid().await? {
            info!("gtid purged of {} set from its backup", node.host());
        }
        node.change_master_to(master_host, &creds.replication_user, &creds.replication_password)
            .await?;
    }
    node.mark_configured().await?;
    Ok(())
}

/// Initializes the mysql pods once they are ready
pub(crate) struct NodeController {
    /// Kubernetes client
    pub(crate) kube_client: Client,
    /// Operator options
    pub(crate) options: Arc<OperatorOptions>,
    /// Pod name pattern
    pub(crate) pod_name: Regex,
    /// Node metrics
    pub(crate) metrics: ControllerMetrics,
}

impl NodeController {
    /// New a node controller
    pub(crate) fn new(
        kube_client: Client,
        options: Arc<OperatorOptions>,
        metrics: ControllerMetrics,
    ) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            kube_client,
            options,
            pod_name: Regex::new(POD_NAME_PATTERN)?,
            metrics,
        })
    }

    /// Resolve the credentials and configure the node
    async fn initialize_node(&self, pod: &Pod, cluster: &MysqlCluster) -> Result<()> {
        let secrets: Api<Secret> =
            Api::namespaced(self.kube_client.clone(), &cluster.namespace_or_default());
        let secret = secrets
            .get(&cluster.name_for(ResourceName::OperatedSecret))
            .await?;
        let creds = Credentials::from_secret(&secret)?;
        let host = node_host(pod, cluster);
        let node = MysqlNode::new(host.clone(), &creds.user, &creds.password);
        let master_host = cluster.master_host();
        tokio::time::timeout(
            self.options.node_reconcile_timeout,
            initialize(&node, NodeRole::of(cluster, &master_host), &creds),
        )
        .await
        .map_err(|_elapsed| Error::Timeout(host))?
    }

    /// Persist the initialized condition
    async fn update_condition(&self, api: &Api<Pod>, name: &str, condition: PodCondition) -> Result<()> {
        // pod conditions merge by type
        let patch = json!({ "status": { "conditions": [condition] } });
        let _pod = api
            .patch_status(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Controller<Pod> for NodeController {
    type Error = Error;
    type Metrics = ControllerMetrics;

    fn metrics(&self) -> &Self::Metrics {
        &self.metrics
    }

    async fn reconcile_once(&self, pod: &Arc<Pod>) -> Result<()> {
        let name = pod.name_any();
        let Some(namespace) = pod.namespace() else {
            return Err(Error::MissingNamespace(name));
        };
        let pods: Api<Pod> = Api::namespaced(self.kube_client.clone(), &namespace);
        let Some(pod) = pods.get_opt(&name).await? else {
            return Ok(());
        };
        if is_initialized(&pod) || !is_ready(&pod) {
            return Ok(());
        }
        let owner =
            cluster_name(&self.pod_name, &name).ok_or_else(|| Error::PodName(name.clone()))?;
        let clusters: Api<MysqlCluster> = Api::namespaced(self.kube_client.clone(), &namespace);
        let Some(cluster) = clusters.get_opt(owner).await? else {
            return Err(Error::ClusterNotFound(owner.to_owned()));
        };
        if cluster.metadata.deletion_timestamp.is_some() {
            debug!("cluster {owner} is deleted, nothing to do for {name}");
            return Ok(());
        }

        info!("initializing mysql node {namespace}/{name}");
        let result = self.initialize_node(&pod, &cluster).await;
        let now = Time(Utc::now());
        let condition = match result {
            Ok(()) => initialized_condition(
                &pod,
                true,
                "mysqlInitializationSucceeded",
                "success".to_owned(),
                now,
            ),
            Err(ref err) => initialized_condition(
                &pod,
                false,
                "mysqlInitializationFailed",
                err.to_string(),
                now,
            ),
        };
        if let Err(err) = self.update_condition(&pods, &name, condition).await {
            warn!("failed to update the conditions of pod {name}: {err}");
            return Err(err);
        }
        result
    }

    fn handle_error(&self, resource: &Arc<Pod>, err: &Self::Error) {
        error!("{:?} node initialization error: {}", resource.metadata.name, err);
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use crd_api::v1alpha1::MysqlClusterSpec;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::ByteString;

    use super::sql::fake::FakeNode;
    use super::*;

    const MASTER: &str = "foo-mysql-0.mysql.default";
    const REPLICA: &str = "foo-mysql-1.mysql.default";

    fn role() -> NodeRole<'static> {
        NodeRole {
            master_host: MASTER,
            purge_gtid: true,
        }
    }

    fn creds() -> Credentials {
        Credentials {
            user: "sys_operator".to_owned(),
            password: "op".to_owned(),
            replication_user: "repl".to_owned(),
            replication_password: "rp".to_owned(),
        }
    }

    fn pod(conditions: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("foo-mysql-1".to_owned());
        pod.metadata.namespace = Some("default".to_owned());
        pod.spec = Some(PodSpec {
            hostname: Some("foo-mysql-1".to_owned()),
            ..PodSpec::default()
        });
        pod.status = Some(PodStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|&(type_, status)| PodCondition {
                        type_: type_.to_owned(),
                        status: status.to_owned(),
                        ..PodCondition::default()
                    })
                    .collect(),
            ),
            ..PodStatus::default()
        });
        pod
    }

    #[test]
    fn cluster_is_resolved_from_the_pod_name() {
        let pattern = Regex::new(POD_NAME_PATTERN).unwrap();
        assert_eq!(cluster_name(&pattern, "foo-mysql-0"), Some("foo"));
        assert_eq!(cluster_name(&pattern, "my-db-mysql-12"), Some("my-db"));
        assert_eq!(cluster_name(&pattern, "foo-0"), None);
        assert_eq!(cluster_name(&pattern, "foo-mysql-"), None);
    }

    #[test]
    fn readiness_and_initialization_come_from_conditions() {
        assert!(!is_ready(&pod(&[])));
        assert!(is_ready(&pod(&[("Ready", "True")])));
        assert!(!is_initialized(&pod(&[("Ready", "True")])));
        assert!(!is_initialized(&pod(&[(NODE_INITIALIZED_CONDITION, "False")])));
        assert!(is_initialized(&pod(&[(NODE_INITIALIZED_CONDITION, "True")])));
    }

    #[test]
    fn node_host_uses_the_headless_service() {
        let mut cluster = MysqlCluster::new("foo", MysqlClusterSpec::default());
        cluster.metadata.namespace = Some("default".to_owned());
        assert_eq!(node_host(&pod(&[]), &cluster), REPLICA);
    }

    #[test]
    fn credentials_must_all_be_set() {
        let mut secret = Secret::default();
        secret.metadata.name = Some("foo-mysql-operated".to_owned());
        let mut data: BTreeMap<String, ByteString> = [
            (OPERATOR_USER_KEY, "sys_operator"),
            (OPERATOR_PASSWORD_KEY, "op"),
            (REPLICATION_USER_KEY, "repl"),
            (REPLICATION_PASSWORD_KEY, "rp"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), ByteString(v.as_bytes().to_vec())))
        .collect();
        secret.data = Some(data.clone());
        assert_eq!(Credentials::from_secret(&secret).unwrap(), creds());

        let _prev = data.insert(REPLICATION_PASSWORD_KEY.to_owned(), ByteString(Vec::new()));
        secret.data = Some(data);
        assert!(matches!(
            Credentials::from_secret(&secret),
            Err(Error::EmptyCredentials(_))
        ));
    }

    #[test]
    fn transition_time_moves_on_status_change() {
        let then = Time(Utc::now() - chrono::Duration::seconds(60));
        let mut failed = pod(&[("Ready", "True")]);
        let cond = initialized_condition(&failed, false, "mysqlInitializationFailed", "boom".to_owned(), then.clone());
        failed.status.as_mut().unwrap().conditions.as_mut().unwrap().push(cond);

        let now = Time(Utc::now());
        let again = initialized_condition(&failed, false, "mysqlInitializationFailed", "boom".to_owned(), now.clone());
        assert_eq!(again.last_transition_time, Some(then));
        let done = initialized_condition(&failed, true, "mysqlInitializationSucceeded", "success".to_owned(), now.clone());
        assert_eq!(done.last_transition_time, Some(now));
        assert_eq!(done.status, "True");
        assert_eq!(done.type_, NODE_INITIALIZED_CONDITION);
    }

    #[tokio::test(start_paused = true)]
    async fn replica_follows_the_master() {
        let node = FakeNode::new(REPLICA);
        initialize(&node, role(), &creds()).await.unwrap();
        assert_eq!(
            node.calls(),
            [
                "disable_super_read_only".to_owned(),
                format!("change_master_to {MASTER} repl"),
                "mark_configured".to_owned(),
                "enable_super_read_only".to_owned(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn master_is_not_replicated() {
        let node = FakeNode::new(MASTER);
        initialize(&node, role(), &creds()).await.unwrap();
        assert_eq!(
            node.calls(),
            ["disable_super_read_only", "mark_configured", "enable_super_read_only"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn configured_node_is_skipped() {
        let node = FakeNode {
            configured: true,
            ..FakeNode::new(REPLICA)
        };
        initialize(&node, role(), &creds()).await.unwrap();
        assert!(node.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn node_is_awaited() {
        let node = FakeNode {
            failing_pings: AtomicUsize::new(3),
            ..FakeNode::new(REPLICA)
        };
        initialize(&node, role(), &creds()).await.unwrap();
        assert_eq!(node.pings(), 4);

        let down = FakeNode {
            failing_pings: AtomicUsize::new(usize::MAX),
            ..FakeNode::new(REPLICA)
        };
        assert!(matches!(
            initialize(&down, role(), &creds()).await,
            Err(Error::NotReady(_))
        ));
        assert_eq!(down.pings(), WAIT_ATTEMPTS);
        assert!(down.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_replication_restores_super_read_only() {
        let node = FakeNode {
            change_master_fails: true,
            ..FakeNode::new(REPLICA)
        };
        assert!(matches!(
            initialize(&node, role(), &creds()).await,
            Err(Error::Sql(_))
        ));
        let calls = node.calls();
        assert!(!calls.contains(&"mark_configured".to_owned()));
        assert_eq!(calls.last().map(String::as_str), Some("enable_super_read_only"));
    }

    #[tokio::test(start_paused = true)]
    async fn restored_replica_takes_the_backup_gtid() {
        let node = FakeNode {
            backup_gtid_purged: Some("uuid:1-10".to_owned()),
            ..FakeNode::new(REPLICA)
        };
        initialize(&node, role(), &creds()).await.unwrap();
        assert_eq!(
            node.calls(),
            [
                "disable_super_read_only".to_owned(),
                "set_purged_gtid uuid:1-10".to_owned(),
                format!("change_master_to {MASTER} repl"),
                "mark_configured".to_owned(),
                "enable_super_read_only".to_owned(),
            ]
        );

        let master = FakeNode {
            backup_gtid_purged: Some("uuid:1-10".to_owned()),
            ..FakeNode::new(MASTER)
        };
        initialize(&master, role(), &creds()).await.unwrap();
        assert!(!master.calls().iter().any(|c| c.starts_with("set_purged_gtid")));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_annotation_keeps_the_gtid() {
        let mut cluster = MysqlCluster::new("foo", MysqlClusterSpec::default());
        let _prev = cluster
            .annotations_mut()
            .insert(ANNOTATION_SKIP_GTID_PURGED.to_owned(), "true".to_owned());
        let skipped = NodeRole::of(&cluster, MASTER);
        assert!(!skipped.purge_gtid);
        assert!(NodeRole::of(&MysqlCluster::new("foo", MysqlClusterSpec::default()), MASTER).purge_gtid);

        let node = FakeNode {
            backup_gtid_purged: Some("uuid:1-10".to_owned()),
            ..FakeNode::new(REPLICA)
        };
        initialize(&node, skipped, &creds()).await.unwrap();
        assert!(!node.calls().iter().any(|c| c.starts_with("set_purged_gtid")));
        assert!(node.calls().contains(&"mark_configured".to_owned()));
    }
}
