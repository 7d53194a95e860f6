pub use backup::{
    BackupConditionType, MysqlBackup, MysqlBackupSpec, MysqlBackupStatus, REMOTE_STORAGE_FINALIZER,
};
pub use cluster::{
    ClusterConditionType, DeletePolicy, MysqlCluster, MysqlClusterSpec, MysqlClusterStatus,
    NodeConditionType, NodeStatus, PodSpec, QueryLimits, ResourceName, VolumeSpec, LABEL_CLUSTER,
    MANAGED_BY,
};
pub use condition::{Condition, ConditionStatus, Conditions};

mod backup;
mod cluster;
mod condition;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::core::crd::merge_crds;
use kube::{Api, Client, CustomResourceExt, Resource};
use tracing::{debug, info};

use crate::wait_crd_established;

/// Field manager of the CRDs
const FIELD_MANAGER: &str = "mysql.presslabs.org/crd";

/// Setup all CRDs of this version
pub(super) async fn set_up(kube_client: &Client, manage_crd: bool) -> anyhow::Result<()> {
    if !manage_crd {
        info!("--manage-crd set to false, skip checking CRD");
        return Ok(());
    }
    set_up_one::<MysqlCluster>(kube_client).await?;
    set_up_one::<MysqlBackup>(kube_client).await?;
    Ok(())
}

/// Install the CRD of `K`, or add the current version to an installed one
async fn set_up_one<K>(kube_client: &Client) -> anyhow::Result<()>
where
    K: CustomResourceExt + Resource<DynamicType = ()>,
{
    let crd_api: Api<CustomResourceDefinition> = Api::all(kube_client.clone());
    let definition = K::crd();
    let current_version = K::version(&());
    let kind = K::kind(&());

    let ret = crd_api.get(K::crd_name()).await;
    if let Err(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. })) = ret {
        // the following code needs `customresourcedefinitions` write permission
        debug!("cannot found {kind} CRD, try to init it");
        _ = crd_api
            .patch(
                K::crd_name(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Apply(definition),
            )
            .await?;
        wait_crd_established(crd_api, K::crd_name()).await?;
        return Ok(());
    }

    let installed = ret?;
    if installed
        .spec
        .versions
        .iter()
        .any(|ver| ver.name == current_version.as_ref())
    {
        debug!("found {kind} CRD with version {current_version}");
        return Ok(());
    }

    let mut storage = current_version.to_string();
    let mut crds = installed
        .spec
        .versions
        .iter()
        .cloned()
        .map(|ver| {
            let mut crd = definition.clone();
            if ver.storage {
                storage = ver.name.clone();
            }
            crd.spec.versions = vec![ver];
            crd
        })
        .collect::<Vec<_>>();
    crds.push(definition);

    let merged_crd = merge_crds(crds, &storage)?;
    debug!("try to add version {current_version} to {kind} CRD");
    _ = crd_api
        .patch(
            K::crd_name(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Apply(merged_crd),
        )
        .await?;
    wait_crd_established(crd_api, K::crd_name()).await?;
    Ok(())
}
