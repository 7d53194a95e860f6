use crd_api::v1alpha1::MysqlCluster;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{DeleteParams, ListParams};
use kube::runtime::events::EventType;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use super::{ClusterController, Result};
use crate::controller::publish_event;

/// The ordinal of a claim created from a statefulset template, e.g. `data-foo-mysql-2`
fn claim_ordinal(name: &str) -> Option<i32> {
    let (_, ordinal) = name.rsplit_once('-')?;
    ordinal.parse().ok()
}

/// The claims left behind by a scale down, highest ordinal first.
/// Claims being deleted and the claim of node 0 are never returned.
pub(crate) fn claims_to_delete(claims: &[PersistentVolumeClaim], replicas: i32) -> Vec<String> {
    let mut orphans: Vec<(i32, String)> = claims
        .iter()
        .filter(|pvc| pvc.metadata.deletion_timestamp.is_none())
        .filter_map(|pvc| {
            let name = pvc.name_any();
            claim_ordinal(&name).map(|ordinal| (ordinal, name))
        })
        .filter(|&(ordinal, _)| ordinal > 0 && ordinal >= replicas)
        .collect();
    orphans.sort_by(|a, b| b.0.cmp(&a.0));
    orphans.into_iter().map(|(_, name)| name).collect()
}

impl ClusterController {
    /// Delete the data claims of the nodes removed by a scale down
    pub(super) async fn clean_claims(&self, cluster: &MysqlCluster) -> Result<()> {
        if cluster.metadata.deletion_timestamp.is_some() {
            debug!("cluster {} is being deleted, skip claims cleanup", cluster.name_any());
            return Ok(());
        }
        let namespace = cluster.namespace_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.kube_client.clone(), &namespace);
        let selector = cluster
            .selector_labels()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let claims = api.list(&ListParams::default().labels(&selector)).await?;
        for name in claims_to_delete(&claims.items, cluster.replicas()) {
            info!(pvc = name.as_str(), "cleaning up orphan claim");
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_deleted) => {
                    publish_event(
                        &self.kube_client,
                        cluster,
                        EventType::Normal,
                        "SuccessfulDelete",
                        format!("delete Claim {name} of cluster {} successful", cluster.name_any()),
                    )
                    .await;
                }
                Err(err) => {
                    warn!("failed to delete claim {name}: {err}");
                    publish_event(
                        &self.kube_client,
                        cluster,
                        EventType::Warning,
                        "FailedDelete",
                        format!("delete Claim {name} of cluster {} failed", cluster.name_any()),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use super::*;

    fn claim(name: &str, deleting: bool) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                ..ObjectMeta::default()
            },
            ..PersistentVolumeClaim::default()
        }
    }

    fn claims() -> Vec<PersistentVolumeClaim> {
        (0..5).map(|i| claim(&format!("data-foo-mysql-{i}"), false)).collect()
    }

    #[test]
    fn scale_down_removes_highest_first() {
        assert_eq!(
            claims_to_delete(&claims(), 3),
            ["data-foo-mysql-4", "data-foo-mysql-3"]
        );
        let remaining: Vec<_> = claims().into_iter().take(3).collect();
        assert!(claims_to_delete(&remaining, 3).is_empty(), "second pass is a no-op");
    }

    #[test]
    fn node_zero_is_kept() {
        let names = claims_to_delete(&claims(), 0);
        assert_eq!(names.len(), 4);
        assert!(!names.contains(&"data-foo-mysql-0".to_owned()));
    }

    #[test]
    fn skips_deleting_and_foreign_claims() {
        let claims = vec![
            claim("data-foo-mysql-3", true),
            claim("scratch", false),
            claim("data-foo-mysql-4", false),
        ];
        assert_eq!(claims_to_delete(&claims, 1), ["data-foo-mysql-4"]);
    }
}
