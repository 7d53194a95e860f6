//! Custom resources of the mysql operator: `MysqlCluster` and `MysqlBackup`

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client};

/// The only served version
pub mod v1alpha1;

/// How long to wait for a CRD to become established
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(20);

/// Install or update the CRDs when `manage_crd` is set
///
/// # Errors
///
/// Return error when the api server rejects the CRDs or they are not established in time
#[inline]
pub async fn setup(kube_client: &Client, manage_crd: bool) -> anyhow::Result<()> {
    v1alpha1::set_up(kube_client, manage_crd).await
}

/// Wait for a CRD to be established
async fn wait_crd_established(
    crd_api: Api<CustomResourceDefinition>,
    crd_name: &str,
) -> anyhow::Result<()> {
    let establish = await_condition(crd_api, crd_name, conditions::is_crd_established());
    let _crd = tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, establish)
        .await
        .map_err(|_elapsed| anyhow::anyhow!("timeout waiting for CRD {crd_name} to be established"))??;
    Ok(())
}
