//! Print the CRDs of the mysql operator
use anyhow::Result;
use crd_api::v1alpha1::{MysqlBackup, MysqlCluster};
use kube::CustomResourceExt;

#[allow(clippy::print_stdout)] // the crds are written to stdout
fn main() -> Result<()> {
    let cluster = serde_yaml::to_string(&MysqlCluster::crd())?;
    let backup = serde_yaml::to_string(&MysqlBackup::crd())?;
    println!("{cluster}---\n{backup}");
    Ok(())
}
