use chrono::{DateTime, Utc};
use crd_api::v1alpha1::{
    ClusterConditionType, ConditionStatus, MysqlCluster, MysqlClusterStatus, NodeConditionType,
    ResourceName,
};
use kube::ResourceExt;
use orchestrator_api::{determine_master, Instance, InstanceKey, Orchestrator, TopologyRecovery};
use regex::Regex;
use tracing::{debug, info, warn};
use utils::consts::MYSQL_PORT;

use crate::consts::{ANNOTATION_VERSION, CURRENT_SCHEMA_VERSION};

/// Seconds the cluster must be ready, and a recovery must be old, before it is acknowledged
pub(crate) const RECOVERY_GRACE_SECS: i64 = 600;
/// Seconds the cluster must be ready before extra hosts are forgotten
const FORGET_GRACE_SECS: i64 = 30;
/// Replication lag tolerated when the cluster does not set one
const DEFAULT_MAX_SLAVE_LATENCY: i64 = 30;
/// A freshly started server is left alone for this many seconds
const UPTIME_GRACE_SECS: u64 = 15;
/// Hostnames under the per cluster headless service contain this
const OLD_SERVICE_SUFFIX: &str = "-mysql-nodes";
/// Hostnames of statefulset pods, under either headless service
const NODE_HOSTNAME_PATTERN: &str = r"^[\w-]+-mysql-(\d*)\.[\w-]*mysql(?:-nodes)?\.[\w-]+$";

/// Extracts the statefulset ordinal out of a node hostname
#[derive(Debug, Clone)]
pub(crate) struct NodeNames {
    /// Hostname pattern
    regex: Regex,
}

impl NodeNames {
    /// Compile the hostname pattern
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(NODE_HOSTNAME_PATTERN)?,
        })
    }

    /// The ordinal of `host`, `None` if it cannot be parsed
    pub(crate) fn ordinal(&self, host: &str) -> Option<i32> {
        self.regex
            .captures(host)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// The result of one topology pass
#[derive(Debug)]
pub(crate) struct SyncOutcome {
    /// The status to write back
    pub(crate) status: MysqlClusterStatus,
    /// Recoveries acknowledged in this pass
    pub(crate) acked: Vec<i64>,
}

/// What to do with the hosts orchestrator knows about
#[derive(Debug, Default)]
struct NodePlan {
    /// Instances known to both kubernetes and orchestrator
    present: Vec<Instance>,
    /// Ready hosts orchestrator does not know yet
    discover: Vec<InstanceKey>,
    /// Hosts orchestrator knows but that are not part of the cluster
    forget: Vec<InstanceKey>,
}

/// Reconcile the status of `cluster` against orchestrator.
/// Read-only flags, discovery, forgetting and recovery acks are applied on
/// orchestrator; the new status is returned for the caller to persist.
pub(crate) async fn sync(
    orc: &dyn Orchestrator,
    cluster: &MysqlCluster,
    names: &NodeNames,
    now: DateTime<Utc>,
) -> orchestrator_api::Result<SyncOutcome> {
    let alias = cluster.cluster_alias();
    let (instances, master) = fetch(orc, &alias).await?;
    let mut status = cluster.status.clone().unwrap_or_default();
    let deleting = cluster.metadata.deletion_timestamp.is_some();

    let plan = plan_nodes(cluster, &instances, deleting);
    for key in &plan.discover {
        info!(host = key.hostname.as_str(), "discovering node in orchestrator");
        if let Err(err) = orc.discover(&key.hostname, key.port).await {
            warn!("failed to discover {}: {err}", key.hostname);
        }
    }
    mark_missing_unknown(&mut status, cluster, &plan.present, now);
    trim_nodes(&mut status, cluster, names);
    mark_read_only(orc, cluster, &status, &plan.present, master.as_ref()).await;

    let recoveries = match orc.audit_recovery(&alias).await {
        Ok(recoveries) => recoveries,
        Err(err) => {
            debug!("can't get recoveries of {alias}: {err}");
            Vec::new()
        }
    };

    update_nodes(&mut status, cluster, &plan.present, master.as_ref(), now);
    update_failover_in_progress(&mut status, &recoveries, master.as_ref(), now);
    update_read_only(&mut status, &plan.present, now);
    update_ready(&mut status, cluster, now);
    update_failover_ack(&mut status, &recoveries, now);

    if deleting || ready_for(&status, now, FORGET_GRACE_SECS) {
        for key in &plan.forget {
            info!(host = key.hostname.as_str(), "forgetting node in orchestrator");
            if let Err(err) = orc.forget(&key.hostname, key.port).await {
                warn!("failed to forget {}: {err}", key.hostname);
            }
        }
    }

    let acked = ack_recoveries(orc, cluster, &status, &recoveries, now).await;
    Ok(SyncOutcome { status, acked })
}

/// The instances of the cluster and its master. The master is only trusted
/// when orchestrator and the instance list agree on it.
async fn fetch(
    orc: &dyn Orchestrator,
    alias: &str,
) -> orchestrator_api::Result<(Vec<Instance>, Option<Instance>)> {
    let instances = match orc.cluster(alias).await {
        Ok(instances) => instances,
        Err(err) if err.is_not_found() => {
            debug!("cluster {alias} not found in orchestrator");
            return Ok((Vec::new(), None));
        }
        Err(err) => return Err(err),
    };
    let master = match orc.master(alias).await {
        Ok(master) => Some(master),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err),
    };
    let agreed = match (master.as_ref(), determine_master(&instances)) {
        (Some(reported), Ok(determined)) => reported.key.hostname == determined.key.hostname,
        (_, Err(err)) => {
            debug!("cannot determine the master of {alias}: {err}");
            false
        }
        (None, Ok(_)) => false,
    };
    if !agreed {
        warn!("master clash in {alias} between orchestrator and the topology");
        return Ok((instances, None));
    }
    Ok((instances, master))
}

/// Split the orchestrator instances into present, to discover and to forget
fn plan_nodes(cluster: &MysqlCluster, instances: &[Instance], deleting: bool) -> NodePlan {
    let ready_nodes = cluster.status.as_ref().map_or(0, |s| s.ready_nodes);
    let mut plan = NodePlan::default();
    for index in 0..cluster.replicas() {
        let host = cluster.pod_hostname(index);
        if let Some(inst) = instances.iter().find(|inst| inst.key.hostname == host) {
            plan.present.push(inst.clone());
        } else if index < ready_nodes {
            plan.discover.push(InstanceKey::new(host, MYSQL_PORT));
        } else {
            debug!("{host} is not ready yet, skip discovery");
        }
    }
    if deleting {
        plan.discover.clear();
        plan.forget = instances.iter().map(|inst| inst.key.clone()).collect();
        return plan;
    }
    plan.forget = instances
        .iter()
        .filter(|inst| !plan.present.iter().any(|p| p.key == inst.key))
        .map(|inst| inst.key.clone())
        .collect();
    plan
}

/// Nodes orchestrator does not report are set to `Unknown`
fn mark_missing_unknown(
    status: &mut MysqlClusterStatus,
    cluster: &MysqlCluster,
    present: &[Instance],
    now: DateTime<Utc>,
) {
    let mut hosts: Vec<String> = status.nodes.iter().map(|n| n.name.clone()).collect();
    for index in 0..cluster.replicas() {
        let host = cluster.pod_hostname(index);
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    for host in hosts {
        if present.iter().any(|inst| inst.key.hostname == host) {
            continue;
        }
        for type_ in [
            NodeConditionType::Lagged,
            NodeConditionType::Replicating,
            NodeConditionType::Master,
            NodeConditionType::ReadOnly,
        ] {
            let _changed = status.set_node_condition(&host, type_, ConditionStatus::Unknown, now);
        }
    }
}

/// Drop the nodes left behind by a scale down or by the old headless service
fn trim_nodes(status: &mut MysqlClusterStatus, cluster: &MysqlCluster, names: &NodeNames) {
    let upgraded = cluster
        .annotations()
        .get(ANNOTATION_VERSION)
        .is_some_and(|v| *v == CURRENT_SCHEMA_VERSION.to_string());
    let replicas = cluster.replicas();
    status.nodes.retain(|node| {
        if upgraded && node.name.contains(OLD_SERVICE_SUFFIX) {
            return false;
        }
        match names.ordinal(&node.name) {
            Some(ordinal) => ordinal < replicas,
            None => {
                debug!("cannot parse the ordinal of {}, keeping it", node.name);
                true
            }
        }
    });
}

/// Enforce `read_only` on the servers: the master is writable unless the
/// cluster is read only, everything else is read only
async fn mark_read_only(
    orc: &dyn Orchestrator,
    cluster: &MysqlCluster,
    status: &MysqlClusterStatus,
    present: &[Instance],
    master: Option<&Instance>,
) {
    if status
        .conditions
        .is_true(ClusterConditionType::FailoverInProgress)
    {
        info!("failover in progress on {}, skip setting read only", cluster.name_any());
        return;
    }
    for inst in present {
        if !inst.is_up_to_date || inst.uptime < UPTIME_GRACE_SECS {
            debug!(host = inst.key.hostname.as_str(), "skip set read-only/writable");
            continue;
        }
        let writable = !cluster.spec.read_only
            && master.is_some_and(|m| m.key.hostname == inst.key.hostname);
        let res = if writable && inst.read_only {
            info!(host = inst.key.hostname.as_str(), "set node writable");
            orc.set_host_writable(&inst.key).await
        } else if !writable && !inst.read_only {
            info!(host = inst.key.hostname.as_str(), "set node read only");
            orc.set_host_read_only(&inst.key).await
        } else {
            Ok(())
        };
        if let Err(err) = res {
            warn!("failed to set read only flag of {}: {err}", inst.key.hostname);
        }
    }
}

/// Project the instance flags on the node conditions
fn update_nodes(
    status: &mut MysqlClusterStatus,
    cluster: &MysqlCluster,
    present: &[Instance],
    master: Option<&Instance>,
    now: DateTime<Utc>,
) {
    let max_latency = cluster.max_slave_latency(DEFAULT_MAX_SLAVE_LATENCY);
    for inst in present {
        let host = inst.key.hostname.as_str();
        if !inst.is_up_to_date {
            debug!(host, "orchestrator reports the host as stale");
            if !inst.is_last_check_valid {
                for type_ in [
                    NodeConditionType::Lagged,
                    NodeConditionType::Replicating,
                    NodeConditionType::Master,
                ] {
                    let _changed =
                        status.set_node_condition(host, type_, ConditionStatus::Unknown, now);
                }
            }
            continue;
        }
        let is_master = master.is_some_and(|m| m.key.hostname == host);
        // the heartbeat of a master may be slow, a master is never lagged
        let lagged = if is_master {
            ConditionStatus::False
        } else {
            inst.seconds_behind_master
                .value()
                .map_or(ConditionStatus::Unknown, |lag| {
                    ConditionStatus::from_bool(lag > max_latency)
                })
        };
        let _changed = status.set_node_condition(host, NodeConditionType::Lagged, lagged, now);
        let _changed = status.set_node_condition(
            host,
            NodeConditionType::Replicating,
            ConditionStatus::from_bool(inst.is_replicating()),
            now,
        );
        let _changed = status.set_node_condition(
            host,
            NodeConditionType::Master,
            ConditionStatus::from_bool(!inst.read_only),
            now,
        );
        let _changed = status.set_node_condition(
            host,
            NodeConditionType::ReadOnly,
            ConditionStatus::from_bool(inst.read_only),
            now,
        );
    }
}

/// `FailoverInProgress` follows the unacknowledged recoveries still running
fn update_failover_in_progress(
    status: &mut MysqlClusterStatus,
    recoveries: &[TopologyRecovery],
    master: Option<&Instance>,
    now: DateTime<Utc>,
) {
    if recoveries.iter().any(|r| r.is_active && !r.acknowledged) {
        let _changed = status.set_condition(
            ClusterConditionType::FailoverInProgress,
            ConditionStatus::True,
            "FailoverInProgress",
            "A failover is in progress",
            now,
        );
    } else if master.is_some() {
        let _changed = status.set_condition(
            ClusterConditionType::FailoverInProgress,
            ConditionStatus::False,
            "ClusterMasterHealthy",
            "Master is healthy in orchestrator",
            now,
        );
    } else {
        debug!("no master and no running recovery, FailoverInProgress unchanged");
    }
}

/// The cluster is read only when no node is writable
fn update_read_only(status: &mut MysqlClusterStatus, present: &[Instance], now: DateTime<Utc>) {
    let (read_only, writable): (Vec<&Instance>, Vec<&Instance>) =
        present.iter().partition(|inst| inst.read_only);
    let hosts = |list: Vec<&Instance>| {
        list.iter()
            .map(|inst| inst.key.hostname.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    };
    let _changed = if writable.is_empty() {
        status.set_condition(
            ClusterConditionType::ReadOnly,
            ConditionStatus::True,
            "ClusterReadOnlyTrue",
            &format!("read-only nodes: {}", hosts(read_only)),
            now,
        )
    } else {
        status.set_condition(
            ClusterConditionType::ReadOnly,
            ConditionStatus::False,
            "ClusterReadOnlyFalse",
            &format!("writable nodes: {}", hosts(writable)),
            now,
        )
    };
}

/// The cluster is ready when every node is up, one is master and the others replicate
fn update_ready(status: &mut MysqlClusterStatus, cluster: &MysqlCluster, now: DateTime<Utc>) {
    let replicas = cluster.replicas();
    if status.ready_nodes != replicas {
        let _changed = status.set_condition(
            ClusterConditionType::Ready,
            ConditionStatus::False,
            "StatefulSetNotReady",
            "StatefulSet is not ready",
            now,
        );
        return;
    }
    let mut has_master = false;
    for index in 0..replicas {
        let host = cluster.pod_hostname(index);
        let is_true = |type_| status.node_condition(&host, type_) == Some(ConditionStatus::True);
        if is_true(NodeConditionType::Master) {
            has_master = true;
        } else if !is_true(NodeConditionType::Replicating) {
            let _changed = status.set_condition(
                ClusterConditionType::Ready,
                ConditionStatus::False,
                "NotReplicating",
                &format!("Node {host} is part of topology and not replicating"),
                now,
            );
            return;
        } else {
            // a replicating replica
        }
    }
    if !has_master && !cluster.spec.read_only && replicas > 0 {
        let _changed = status.set_condition(
            ClusterConditionType::Ready,
            ConditionStatus::False,
            "NoMaster",
            "Cluster has no designated master",
            now,
        );
        return;
    }
    let _changed = status.set_condition(
        ClusterConditionType::Ready,
        ConditionStatus::True,
        "ClusterReady",
        "Cluster is ready",
        now,
    );
}

/// `FailoverAck` is true while some recovery waits for an acknowledgement
fn update_failover_ack(
    status: &mut MysqlClusterStatus,
    recoveries: &[TopologyRecovery],
    now: DateTime<Utc>,
) {
    let pending: Vec<String> = recoveries
        .iter()
        .filter(|r| !r.acknowledged)
        .map(TopologyRecovery::describe)
        .collect();
    let _changed = if pending.is_empty() {
        status.set_condition(
            ClusterConditionType::FailoverAck,
            ConditionStatus::False,
            "NoPendingFailoverAckExists",
            "no pending ack",
            now,
        )
    } else {
        status.set_condition(
            ClusterConditionType::FailoverAck,
            ConditionStatus::True,
            "PendingFailoverAckExists",
            &pending.join(" "),
            now,
        )
    };
}

/// Whether the cluster has been ready for more than `secs` seconds
fn ready_for(status: &MysqlClusterStatus, now: DateTime<Utc>, secs: i64) -> bool {
    status
        .conditions
        .get(ClusterConditionType::Ready)
        .is_some_and(|ready| {
            ready.status == ConditionStatus::True
                && now
                    .signed_duration_since(ready.last_transition_time.0)
                    .num_seconds()
                    > secs
        })
}

/// Acknowledge the old recoveries of a cluster that is ready for long enough.
/// Returns the acknowledged ids.
async fn ack_recoveries(
    orc: &dyn Orchestrator,
    cluster: &MysqlCluster,
    status: &MysqlClusterStatus,
    recoveries: &[TopologyRecovery],
    now: DateTime<Utc>,
) -> Vec<i64> {
    let mut acked = Vec::new();
    if recoveries.iter().all(|r| r.acknowledged) {
        return acked;
    }
    if !ready_for(status, now, RECOVERY_GRACE_SECS) {
        info!(
            "cluster {} not ready for {RECOVERY_GRACE_SECS}s, skip acknowledging recoveries",
            cluster.name_any()
        );
        return acked;
    }
    let comment = format!(
        "Statefulset '{}' is healthy for more than {RECOVERY_GRACE_SECS} seconds",
        cluster.name_for(ResourceName::StatefulSet)
    );
    for recovery in recoveries.iter().filter(|r| !r.acknowledged) {
        let start = match DateTime::parse_from_rfc3339(&recovery.recovery_start_timestamp) {
            Ok(start) => start.with_timezone(&Utc),
            Err(err) => {
                warn!("cannot parse start time of recovery {}: {err}", recovery.id);
                continue;
            }
        };
        if now.signed_duration_since(start).num_seconds() < RECOVERY_GRACE_SECS {
            debug!("recovery {} is too recent to be acknowledged", recovery.id);
            continue;
        }
        if let Err(err) = orc.ack_recovery(recovery.id, &comment).await {
            warn!("failed to acknowledge recovery {}: {err}", recovery.id);
            break;
        }
        acked.push(recovery.id);
    }
    acked
}

#[cfg(test)]
mod test {
    use chrono::Duration;
    use crd_api::v1alpha1::MysqlClusterSpec;
    use orchestrator_api::fake::FakeOrchestrator;

    use super::*;

    const ALIAS: &str = "foo.default";
    const HOST0: &str = "foo-mysql-0.mysql.default";
    const HOST1: &str = "foo-mysql-1.mysql.default";

    fn cluster(replicas: i32, ready_nodes: i32) -> MysqlCluster {
        let mut cluster = MysqlCluster::new(
            "foo",
            MysqlClusterSpec {
                replicas: Some(replicas),
                ..MysqlClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_owned());
        cluster.status = Some(MysqlClusterStatus {
            ready_nodes,
            ..MysqlClusterStatus::default()
        });
        cluster
    }

    /// A cluster that turned ready `secs` seconds ago
    fn ready_since(mut cluster: MysqlCluster, secs: i64) -> MysqlCluster {
        if let Some(status) = cluster.status.as_mut() {
            let _changed = status.set_condition(
                ClusterConditionType::Ready,
                ConditionStatus::True,
                "ClusterReady",
                "Cluster is ready",
                Utc::now() - Duration::seconds(secs),
            );
        }
        cluster
    }

    async fn healthy_orc(lag: i64) -> FakeOrchestrator {
        let orc = FakeOrchestrator::new();
        orc.add_instance(ALIAS, HOST0, true, "", Some(0), false, true)
            .await;
        orc.add_instance(ALIAS, HOST1, false, HOST0, Some(lag), true, true)
            .await;
        orc
    }

    fn node(status: &MysqlClusterStatus, host: &str, type_: NodeConditionType) -> Option<ConditionStatus> {
        status.node_condition(host, type_)
    }

    #[test]
    fn ordinals_are_parsed_from_hostnames() {
        let names = NodeNames::new().unwrap();
        assert_eq!(names.ordinal(HOST1), Some(1));
        assert_eq!(names.ordinal("foo-mysql-12.foo-mysql-nodes.default"), Some(12));
        assert_eq!(names.ordinal("some-host"), None);
    }

    #[tokio::test]
    async fn unknown_cluster_is_discovered() {
        let orc = FakeOrchestrator::new();
        let names = NodeNames::new().unwrap();
        let outcome = sync(&orc, &cluster(2, 2), &names, Utc::now()).await.unwrap();
        let discovered: Vec<_> = orc.discovered().await.into_iter().map(|k| k.hostname).collect();
        assert_eq!(discovered, [HOST0, HOST1]);
        for host in [HOST0, HOST1] {
            assert_eq!(node(&outcome.status, host, NodeConditionType::Master), Some(ConditionStatus::Unknown));
            assert_eq!(node(&outcome.status, host, NodeConditionType::ReadOnly), Some(ConditionStatus::Unknown));
        }
        let ready = outcome.status.conditions.get(ClusterConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "NotReplicating");
    }

    #[tokio::test]
    async fn only_ready_nodes_are_discovered() {
        let orc = FakeOrchestrator::new();
        let names = NodeNames::new().unwrap();
        let outcome = sync(&orc, &cluster(3, 1), &names, Utc::now()).await.unwrap();
        assert_eq!(orc.discovered().await.len(), 1);
        let ready = outcome.status.conditions.get(ClusterConditionType::Ready).unwrap();
        assert_eq!(ready.reason, "StatefulSetNotReady");
    }

    #[tokio::test]
    async fn healthy_topology_is_ready() {
        let orc = healthy_orc(0).await;
        let names = NodeNames::new().unwrap();
        let outcome = sync(&orc, &cluster(2, 2), &names, Utc::now()).await.unwrap();
        let status = &outcome.status;
        assert_eq!(node(status, HOST0, NodeConditionType::Master), Some(ConditionStatus::True));
        assert_eq!(node(status, HOST0, NodeConditionType::Lagged), Some(ConditionStatus::False));
        assert_eq!(node(status, HOST1, NodeConditionType::Master), Some(ConditionStatus::False));
        assert_eq!(node(status, HOST1, NodeConditionType::Replicating), Some(ConditionStatus::True));
        assert_eq!(node(status, HOST1, NodeConditionType::ReadOnly), Some(ConditionStatus::True));

        let ready = status.conditions.get(ClusterConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, "ClusterReady");
        let read_only = status.conditions.get(ClusterConditionType::ReadOnly).unwrap();
        assert_eq!(read_only.status, ConditionStatus::False);
        assert_eq!(read_only.message, format!("writable nodes: {HOST0}"));
        assert_eq!(
            status.conditions.status(ClusterConditionType::FailoverAck),
            Some(ConditionStatus::False)
        );
        assert!(orc.writable_calls().await.is_empty());
        assert!(orc.read_only_calls().await.is_empty());
        assert!(orc.discovered().await.is_empty());
    }

    #[tokio::test]
    async fn lag_over_the_limit_is_reported() {
        let orc = healthy_orc(100).await;
        let names = NodeNames::new().unwrap();
        let outcome = sync(&orc, &cluster(2, 2), &names, Utc::now()).await.unwrap();
        assert_eq!(
            node(&outcome.status, HOST1, NodeConditionType::Lagged),
            Some(ConditionStatus::True)
        );
        let mut relaxed = cluster(2, 2);
        relaxed.spec.max_slave_latency = Some(200);
        let outcome = sync(&orc, &relaxed, &names, Utc::now()).await.unwrap();
        assert_eq!(
            node(&outcome.status, HOST1, NodeConditionType::Lagged),
            Some(ConditionStatus::False)
        );
    }

    #[tokio::test]
    async fn read_only_cluster_turns_the_master_read_only() {
        let orc = healthy_orc(0).await;
        let names = NodeNames::new().unwrap();
        let mut cluster = cluster(2, 2);
        cluster.spec.read_only = true;
        let _outcome = sync(&orc, &cluster, &names, Utc::now()).await.unwrap();
        let calls: Vec<_> = orc.read_only_calls().await.into_iter().map(|k| k.hostname).collect();
        assert_eq!(calls, [HOST0]);
    }

    #[tokio::test]
    async fn replica_left_writable_is_fixed() {
        let orc = FakeOrchestrator::new();
        orc.add_instance(ALIAS, HOST0, true, "", Some(0), false, true)
            .await;
        orc.insert_instance(
            ALIAS,
            Instance {
                key: InstanceKey::new(HOST1, MYSQL_PORT),
                uptime: 3600,
                read_only: false,
                master_key: InstanceKey::new(HOST0, MYSQL_PORT),
                is_up_to_date: true,
                is_last_check_valid: true,
                ..Instance::default()
            },
        )
        .await;
        let names = NodeNames::new().unwrap();
        let _outcome = sync(&orc, &cluster(2, 2), &names, Utc::now()).await.unwrap();
        let calls: Vec<_> = orc.read_only_calls().await.into_iter().map(|k| k.hostname).collect();
        assert_eq!(calls, [HOST1]);
    }

    #[tokio::test]
    async fn scaled_down_nodes_are_forgotten_and_trimmed() {
        let orc = healthy_orc(0).await;
        let extra = "foo-mysql-2.mysql.default";
        orc.add_instance(ALIAS, extra, false, HOST0, Some(0), true, true)
            .await;
        let names = NodeNames::new().unwrap();
        let mut cluster = ready_since(cluster(2, 2), 60);
        if let Some(status) = cluster.status.as_mut() {
            let _changed =
                status.set_node_condition(extra, NodeConditionType::Master, ConditionStatus::False, Utc::now());
        }
        let outcome = sync(&orc, &cluster, &names, Utc::now()).await.unwrap();
        let forgotten: Vec<_> = orc.forgotten().await.into_iter().map(|k| k.hostname).collect();
        assert_eq!(forgotten, [extra]);
        assert!(outcome.status.node(extra).is_none());
        assert_eq!(outcome.status.nodes.len(), 2);
    }

    #[tokio::test]
    async fn nothing_is_forgotten_before_the_grace_time() {
        let orc = healthy_orc(0).await;
        orc.add_instance(ALIAS, "foo-mysql-2.mysql.default", false, HOST0, Some(0), true, true)
            .await;
        let names = NodeNames::new().unwrap();
        let cluster = ready_since(cluster(2, 2), 5);
        let _outcome = sync(&orc, &cluster, &names, Utc::now()).await.unwrap();
        assert!(orc.forgotten().await.is_empty());
    }

    #[tokio::test]
    async fn deleted_cluster_is_forgotten() {
        let orc = healthy_orc(0).await;
        let names = NodeNames::new().unwrap();
        let mut cluster = cluster(2, 2);
        cluster.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()));
        let _outcome = sync(&orc, &cluster, &names, Utc::now()).await.unwrap();
        assert_eq!(orc.forgotten().await.len(), 2);
    }

    #[tokio::test]
    async fn old_recoveries_are_acked_on_a_ready_cluster() {
        let orc = healthy_orc(0).await;
        let id = orc.add_recovery(ALIAS, false, false).await;
        let names = NodeNames::new().unwrap();
        let cluster = ready_since(cluster(2, 2), 700);
        let outcome = sync(&orc, &cluster, &names, Utc::now()).await.unwrap();
        assert_eq!(outcome.acked, [id]);
        assert_eq!(orc.acked().await, [id]);
        let ack = outcome.status.conditions.get(ClusterConditionType::FailoverAck).unwrap();
        assert_eq!(ack.status, ConditionStatus::True);
        assert_eq!(ack.reason, "PendingFailoverAckExists");
    }

    #[tokio::test]
    async fn recoveries_wait_for_the_cluster_to_settle() {
        let orc = healthy_orc(0).await;
        let _id = orc.add_recovery(ALIAS, false, false).await;
        let names = NodeNames::new().unwrap();
        let cluster = ready_since(cluster(2, 2), 100);
        let outcome = sync(&orc, &cluster, &names, Utc::now()).await.unwrap();
        assert!(outcome.acked.is_empty());
        assert!(orc.acked().await.is_empty());
    }

    #[tokio::test]
    async fn running_recovery_blocks_read_only_changes() {
        let orc = healthy_orc(0).await;
        let _id = orc.add_recovery(ALIAS, false, true).await;
        let names = NodeNames::new().unwrap();
        let mut cluster = cluster(2, 2);
        cluster.spec.read_only = true;
        let outcome = sync(&orc, &cluster, &names, Utc::now()).await.unwrap();
        assert_eq!(
            outcome.status.conditions.status(ClusterConditionType::FailoverInProgress),
            Some(ConditionStatus::True)
        );
        let outcome_cluster = MysqlCluster {
            status: Some(outcome.status),
            ..cluster
        };
        let _outcome = sync(&orc, &outcome_cluster, &names, Utc::now()).await.unwrap();
        assert_eq!(orc.read_only_calls().await.len(), 1, "no change while failing over");
    }

    #[tokio::test]
    async fn unreachable_orchestrator_is_an_error() {
        let orc = healthy_orc(0).await;
        orc.make_unreachable().await;
        let names = NodeNames::new().unwrap();
        assert!(sync(&orc, &cluster(2, 2), &names, Utc::now()).await.is_err());
    }
}
