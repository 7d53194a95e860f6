use std::collections::BTreeMap;
use std::fmt::Debug;

use crd_api::v1alpha1::{ConditionStatus, MysqlCluster, MysqlClusterStatus, NodeConditionType};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::events::EventType;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use super::{ClusterController, Error, Result};
use crate::consts::{FIELD_MANAGER, LABEL_HEALTHY, LABEL_ROLE};
use crate::controller::{is_not_found, publish_event};
use crate::manager::cluster::Role;

/// Value of the `healthy` label of a node serving traffic
const HEALTHY: &str = "yes";
/// Value of the `healthy` label of a node not serving traffic
const NOT_HEALTHY: &str = "no";

impl ClusterController {
    /// Server side apply an object, returns the stored object
    pub(super) async fn apply<R>(&self, namespace: &str, res: R) -> Result<R>
    where
        R: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Serialize,
    {
        let name = res.name_any();
        let api: Api<R> = Api::namespaced(self.kube_client.clone(), namespace);
        let applied = api
            .patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(res))
            .await?;
        Ok(applied)
    }

    /// Create an object only if it does not exist yet, returns true if created
    pub(super) async fn create_if_missing<R>(&self, namespace: &str, res: R) -> Result<bool>
    where
        R: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Serialize,
    {
        let api: Api<R> = Api::namespaced(self.kube_client.clone(), namespace);
        if api.get_opt(&res.name_any()).await?.is_some() {
            return Ok(false);
        }
        match api.create(&PostParams::default(), &res).await {
            Ok(_created) => Ok(true),
            Err(kube::Error::Api(ref resp)) if resp.code == 409 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Set the `role` and `healthy` labels of the pod of `host`
    pub(super) async fn sync_pod_labels(&self, cluster: &MysqlCluster, host: &str) -> Result<()> {
        let namespace = cluster.namespace_or_default();
        let pod_name = pod_name_for_host(host);
        let api: Api<Pod> = Api::namespaced(self.kube_client.clone(), &namespace);
        let pod = match api.get(pod_name).await {
            Ok(pod) => pod,
            Err(ref err) if is_not_found(err) => {
                return Err(Error::PodNotFound(pod_name.to_owned()))
            }
            Err(err) => return Err(err.into()),
        };
        let desired = desired_pod_labels(cluster.status.as_ref(), host)?;
        let current = pod.labels();
        if current.get(LABEL_ROLE) == desired.get(LABEL_ROLE)
            && current.get(LABEL_HEALTHY) == desired.get(LABEL_HEALTHY)
        {
            return Ok(());
        }
        info!(
            pod = pod_name,
            role = desired.get(LABEL_ROLE).map(String::as_str),
            healthy = desired.get(LABEL_HEALTHY).map(String::as_str),
            "node labels updated"
        );
        let events = label_events(current, &desired, cluster.status.as_ref(), host);
        let patch = json!({ "metadata": { "labels": desired } });
        let _pod = api
            .patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        for (type_, reason, note) in events {
            publish_event(&self.kube_client, &pod, type_, reason, note).await;
        }
        Ok(())
    }
}

/// The pod name of a node hostname, `foo-mysql-0.mysql.default` is `foo-mysql-0`
pub(crate) fn pod_name_for_host(host: &str) -> &str {
    host.split_once('.').map_or(host, |(name, _)| name)
}

/// The node hostnames in the order their pods are labeled: replicas first,
/// the master last
pub(crate) fn pod_sync_order(cluster: &MysqlCluster) -> Vec<String> {
    let status = cluster.status.as_ref();
    let (mut replicas, masters): (Vec<_>, Vec<_>) = (0..cluster.replicas().max(0))
        .map(|i| cluster.pod_hostname(i))
        .partition(|host| {
            status.and_then(|s| s.node_condition(host, NodeConditionType::Master))
                != Some(ConditionStatus::True)
        });
    replicas.extend(masters);
    replicas
}

/// The `role` and `healthy` labels a node should carry
pub(crate) fn desired_pod_labels(
    status: Option<&MysqlClusterStatus>,
    host: &str,
) -> Result<BTreeMap<String, String>> {
    let condition = |type_| status.and_then(|s| s.node_condition(host, type_));
    let Some(master) = condition(NodeConditionType::Master) else {
        return Err(Error::MissingMasterCondition(host.to_owned()));
    };
    let is_master = master == ConditionStatus::True;
    let is_replicating = condition(NodeConditionType::Replicating) == Some(ConditionStatus::True);
    let is_lagged = condition(NodeConditionType::Lagged) == Some(ConditionStatus::True);

    let role = if is_master { Role::Master } else { Role::Replica };
    let healthy = is_master || (is_replicating && !is_lagged);
    Ok([
        (LABEL_ROLE.to_owned(), role.label().to_owned()),
        (
            LABEL_HEALTHY.to_owned(),
            if healthy { HEALTHY } else { NOT_HEALTHY }.to_owned(),
        ),
    ]
    .into())
}

/// Events describing a label transition of a node
fn label_events(
    current: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    status: Option<&MysqlClusterStatus>,
    host: &str,
) -> Vec<(EventType, &'static str, String)> {
    let mut events = Vec::new();
    let master_label = Role::Master.label();
    let was_master = current.get(LABEL_ROLE).map(String::as_str) == Some(master_label);
    let is_master = desired.get(LABEL_ROLE).map(String::as_str) == Some(master_label);
    if is_master && !was_master {
        events.push((EventType::Normal, "PromoteMaster", format!("{host} is the new master")));
    }
    if was_master && !is_master {
        events.push((EventType::Warning, "DemoteMaster", format!("{host} is no longer the master")));
    }
    let was_healthy = current.get(LABEL_HEALTHY).map(String::as_str) == Some(HEALTHY);
    let is_healthy = desired.get(LABEL_HEALTHY).map(String::as_str) == Some(HEALTHY);
    if is_healthy && !was_healthy && !is_master {
        events.push((
            EventType::Normal,
            "ReplicationRunning",
            format!("{host} is replicating"),
        ));
    }
    if was_healthy && !is_healthy {
        let lagged = status.and_then(|s| s.node_condition(host, NodeConditionType::Lagged))
            == Some(ConditionStatus::True);
        if lagged {
            events.push((EventType::Warning, "LagDetected", format!("{host} is lagged")));
        } else {
            events.push((
                EventType::Warning,
                "ReplicationStopped",
                format!("{host} is not replicating"),
            ));
        }
    }
    debug!("{} label events for {host}", events.len());
    events
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use crd_api::v1alpha1::MysqlClusterSpec;

    use super::*;

    fn cluster(master: Option<i32>) -> MysqlCluster {
        let mut cluster = MysqlCluster::new(
            "foo",
            MysqlClusterSpec {
                replicas: Some(3),
                ..MysqlClusterSpec::default()
            },
        );
        cluster.metadata.namespace = Some("default".to_owned());
        let mut status = MysqlClusterStatus::default();
        for i in 0..3 {
            let host = cluster.pod_hostname(i);
            let _ig = status.set_node_condition(
                &host,
                NodeConditionType::Master,
                ConditionStatus::from_bool(Some(i) == master),
                Utc::now(),
            );
        }
        cluster.status = Some(status);
        cluster
    }

    #[test]
    fn master_is_labeled_last() {
        let order = pod_sync_order(&cluster(Some(0)));
        assert_eq!(
            order,
            [
                "foo-mysql-1.mysql.default",
                "foo-mysql-2.mysql.default",
                "foo-mysql-0.mysql.default"
            ]
        );
        let order = pod_sync_order(&cluster(Some(1)));
        assert_eq!(order.last().map(String::as_str), Some("foo-mysql-1.mysql.default"));
        let order = pod_sync_order(&cluster(None));
        assert_eq!(order.first().map(String::as_str), Some("foo-mysql-0.mysql.default"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn labels_follow_conditions() {
        let mut status = MysqlClusterStatus::default();
        let host = "foo-mysql-1.mysql.default";
        assert!(matches!(
            desired_pod_labels(Some(&status), host),
            Err(Error::MissingMasterCondition(_))
        ));
        let now = Utc::now();
        let _ig = status.set_node_condition(host, NodeConditionType::Master, ConditionStatus::False, now);
        let labels = desired_pod_labels(Some(&status), host).unwrap();
        assert_eq!(labels[LABEL_ROLE], "replica");
        assert_eq!(labels[LABEL_HEALTHY], "no");

        let _ig = status.set_node_condition(host, NodeConditionType::Replicating, ConditionStatus::True, now);
        let _ig = status.set_node_condition(host, NodeConditionType::Lagged, ConditionStatus::False, now);
        let labels = desired_pod_labels(Some(&status), host).unwrap();
        assert_eq!(labels[LABEL_HEALTHY], "yes");

        let _ig = status.set_node_condition(host, NodeConditionType::Lagged, ConditionStatus::True, now);
        assert_eq!(desired_pod_labels(Some(&status), host).unwrap()[LABEL_HEALTHY], "no");

        let _ig = status.set_node_condition(host, NodeConditionType::Master, ConditionStatus::True, now);
        let labels = desired_pod_labels(Some(&status), host).unwrap();
        assert_eq!(labels[LABEL_ROLE], "master");
        assert_eq!(labels[LABEL_HEALTHY], "yes");
    }

    #[test]
    fn transitions_produce_events() {
        let host = "foo-mysql-1.mysql.default";
        let labels = |role: &str, healthy: &str| -> BTreeMap<String, String> {
            [
                (LABEL_ROLE.to_owned(), role.to_owned()),
                (LABEL_HEALTHY.to_owned(), healthy.to_owned()),
            ]
            .into()
        };
        let events = label_events(&labels("replica", "yes"), &labels("master", "yes"), None, host);
        let reasons: Vec<_> = events.iter().map(|e| e.1).collect();
        assert_eq!(reasons, ["PromoteMaster"]);

        let mut status = MysqlClusterStatus::default();
        let _ig = status.set_node_condition(host, NodeConditionType::Lagged, ConditionStatus::True, Utc::now());
        let events = label_events(&labels("replica", "yes"), &labels("replica", "no"), Some(&status), host);
        assert_eq!(events.iter().map(|e| e.1).collect::<Vec<_>>(), ["LagDetected"]);

        let events = label_events(&BTreeMap::new(), &labels("replica", "yes"), None, host);
        assert_eq!(events.iter().map(|e| e.1).collect::<Vec<_>>(), ["ReplicationRunning"]);
    }

    #[test]
    fn pod_name_from_host() {
        assert_eq!(pod_name_for_host("foo-mysql-0.mysql.default"), "foo-mysql-0");
        assert_eq!(pod_name_for_host("foo-mysql-0"), "foo-mysql-0");
    }
}
