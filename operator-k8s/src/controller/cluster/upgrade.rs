use std::collections::BTreeMap;

use crd_api::v1alpha1::{MysqlCluster, ResourceName};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use orchestrator_api::{determine_master, Instance};
use serde_json::json;
use tracing::{debug, info};
use utils::consts::MYSQL_PORT;
use utils::version::SchemaVersion;

use super::{ClusterController, Error, Result};
use crate::consts::{ANNOTATION_VERSION, CURRENT_SCHEMA_VERSION};
use crate::controller::is_not_found;

/// Node 0 may be behind its old master by at most this many seconds
const MAX_NODE0_LAG: i64 = 3;

/// Whether the cluster resources predate the current layout
pub(crate) fn needs_upgrade(cluster: &MysqlCluster) -> bool {
    SchemaVersion::new(CURRENT_SCHEMA_VERSION)
        .is_newer_than_annotation(cluster.annotations().get(ANNOTATION_VERSION).map(String::as_str))
}

/// The hostname of node `index` behind the per cluster headless service
pub(crate) fn old_hostname(cluster: &MysqlCluster, index: i32) -> String {
    format!(
        "{}-{index}.{}.{}",
        cluster.name_for(ResourceName::StatefulSet),
        cluster.name_for(ResourceName::OldHeadlessService),
        cluster.namespace_or_default()
    )
}

/// Check that node 0 can take over alone: it is known to orchestrator, it is
/// the only master or detached one, and it is not lagged
pub(crate) fn check_node0(instances: &[Instance], host: &str) -> Result<()> {
    let Some(node0) = instances.iter().find(|inst| inst.key.hostname == host) else {
        return Err(Error::Upgrade("node-0 not found in orchestrator".to_owned()));
    };
    if !node0.master_key.hostname.is_empty() && !node0.is_detached_master {
        return Err(Error::Upgrade("node-0 not yet master".to_owned()));
    }
    let master = determine_master(instances)?;
    if master.key.hostname != host {
        return Err(Error::Upgrade(format!(
            "{} is the master, not node-0",
            master.key.hostname
        )));
    }
    if node0
        .seconds_behind_master
        .value()
        .is_some_and(|lag| lag > MAX_NODE0_LAG)
    {
        return Err(Error::Upgrade("node-0 is lagged".to_owned()));
    }
    Ok(())
}

impl ClusterController {
    /// Move a cluster to the shared headless service layout.
    /// The statefulset is shrunk to node 0, then removed with the old
    /// headless service so it is recreated by the syncers.
    pub(super) async fn upgrade(&self, cluster: &MysqlCluster) -> Result<()> {
        let namespace = cluster.namespace_or_default();
        let sts_api: Api<StatefulSet> = Api::namespaced(self.kube_client.clone(), &namespace);
        let sts_name = cluster.name_for(ResourceName::StatefulSet);
        let Some(sts) = sts_api.get_opt(&sts_name).await? else {
            debug!("no statefulset for {}, nothing to upgrade", cluster.name_any());
            return self.mark_upgraded(cluster).await;
        };
        info!("upgrading cluster {} to version {CURRENT_SCHEMA_VERSION}", cluster.name_any());

        let instances = match self.orchestrator.cluster(&cluster.cluster_alias()).await {
            Ok(instances) => instances,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        if sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1) > 1 {
            let scale = json!({ "spec": { "replicas": 1 } });
            let _sts = sts_api
                .patch(&sts_name, &PatchParams::default(), &Patch::Merge(&scale))
                .await?;
            let clusters: Api<MysqlCluster> = Api::namespaced(self.kube_client.clone(), &namespace);
            let ready = json!({ "status": { "readyNodes": 0 } });
            let _cluster = clusters
                .patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&ready))
                .await?;
        }

        if sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0) > 1 {
            return Err(Error::Upgrade(
                "statefulset has more than one running pods".to_owned(),
            ));
        }
        check_node0(&instances, &old_hostname(cluster, 0))?;

        for index in 0..cluster.replicas() {
            self.orchestrator
                .forget(&old_hostname(cluster, index), MYSQL_PORT)
                .await?;
        }

        let _sts = sts_api.delete(&sts_name, &DeleteParams::default()).await?;
        let svc_api: Api<Service> = Api::namespaced(self.kube_client.clone(), &namespace);
        match svc_api
            .delete(
                &cluster.name_for(ResourceName::OldHeadlessService),
                &DeleteParams::default(),
            )
            .await
        {
            Ok(_svc) => {}
            Err(ref err) if is_not_found(err) => {}
            Err(err) => return Err(err.into()),
        }
        self.mark_upgraded(cluster).await
    }

    /// Stamp the current schema version on the cluster
    async fn mark_upgraded(&self, cluster: &MysqlCluster) -> Result<()> {
        let api: Api<MysqlCluster> =
            Api::namespaced(self.kube_client.clone(), &cluster.namespace_or_default());
        let annotations: BTreeMap<&str, String> =
            [(ANNOTATION_VERSION, CURRENT_SCHEMA_VERSION.to_string())].into();
        let patch = json!({ "metadata": { "annotations": annotations } });
        let _cluster = api
            .patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crd_api::v1alpha1::MysqlClusterSpec;
    use orchestrator_api::{InstanceKey, NullInt64};

    use super::*;

    fn cluster(version: Option<&str>) -> MysqlCluster {
        let mut cluster = MysqlCluster::new("foo", MysqlClusterSpec::default());
        cluster.metadata.namespace = Some("default".to_owned());
        if let Some(version) = version {
            let _prev = cluster
                .annotations_mut()
                .insert(ANNOTATION_VERSION.to_owned(), version.to_owned());
        }
        cluster
    }

    fn node0(master: Option<&str>, detached: bool, lag: i64) -> Instance {
        Instance {
            key: InstanceKey::new("foo-mysql-0.foo-mysql-nodes.default", 3306),
            master_key: master.map(|m| InstanceKey::new(m, 3306)).unwrap_or_default(),
            is_detached_master: detached,
            seconds_behind_master: NullInt64::some(lag),
            ..Instance::default()
        }
    }

    #[test]
    fn upgrade_is_gated_by_annotation() {
        assert!(needs_upgrade(&cluster(None)));
        assert!(needs_upgrade(&cluster(Some("garbage"))));
        assert!(needs_upgrade(&cluster(Some("200"))));
        assert!(!needs_upgrade(&cluster(Some("300"))));
    }

    #[test]
    fn old_hostnames_use_the_old_service() {
        assert_eq!(
            old_hostname(&cluster(None), 1),
            "foo-mysql-1.foo-mysql-nodes.default"
        );
    }

    #[test]
    fn node0_checks() {
        let host = "foo-mysql-0.foo-mysql-nodes.default";
        assert!(check_node0(&[], host).is_err());
        assert!(check_node0(&[node0(None, false, 0)], host).is_ok());
        assert!(check_node0(&[node0(Some("foo-mysql-1"), false, 0)], host).is_err());
        assert!(check_node0(&[node0(Some("foo-mysql-1"), true, 2)], host).is_ok());
        assert!(check_node0(&[node0(None, false, 4)], host).is_err());
        let other_master = Instance {
            key: InstanceKey::new("foo-mysql-1.foo-mysql-nodes.default", 3306),
            ..Instance::default()
        };
        assert!(matches!(
            check_node0(&[node0(None, false, 0), other_master], host),
            Err(Error::Orchestrator(_))
        ));
    }
}
