//! Per-project quota enforcement on create paths.

use corral_common::config::CorralConfig;
use corral_common::{Error, Result, QUOTA_RESOURCE_CLUSTER};
use corral_store::SqliteStore;

/// Check that one more cluster fits the project's quota.
///
/// An explicit quota row wins over the configured default cap. The
/// check runs before any trustee or certificate work so a rejected
/// create leaves nothing behind.
pub fn check_cluster_quota(
    store: &SqliteStore,
    config: &CorralConfig,
    project_id: &str,
) -> Result<()> {
    let hard_limit = store
        .get_quota(project_id, QUOTA_RESOURCE_CLUSTER)?
        .map(|quota| quota.hard_limit)
        .unwrap_or(config.quotas.max_cluster_per_project);

    let current = store.count_clusters_in_project(project_id)?;
    if current >= hard_limit {
        return Err(Error::quota_exceeded(
            project_id,
            QUOTA_RESOURCE_CLUSTER,
            hard_limit,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use corral_common::status::Coe;
    use corral_store::{Cluster, ClusterTemplate, Quota};

    fn seed_clusters(store: &SqliteStore, project: &str, count: usize) {
        let template =
            ClusterTemplate::new("t", project, "u1", "img", "fedora-coreos", Coe::Kubernetes);
        store.create_cluster_template(&template).unwrap();
        for i in 0..count {
            store
                .create_cluster(&Cluster::new(
                    format!("k{}", i),
                    project,
                    "u1",
                    &template,
                    60,
                ))
                .unwrap();
        }
    }

    #[test]
    fn explicit_quota_row_wins() {
        let store = SqliteStore::in_memory().unwrap();
        let config = CorralConfig::default();
        store
            .create_quota(&Quota {
                project_id: "p1".into(),
                resource: QUOTA_RESOURCE_CLUSTER.into(),
                hard_limit: 2,
                created_at: Utc::now(),
            })
            .unwrap();
        seed_clusters(&store, "p1", 2);

        let err = check_cluster_quota(&store, &config, "p1").unwrap_err();
        assert_eq!(err.kind(), "QuotaExceeded");
        assert!(err.to_string().contains("limit is 2"));
    }

    #[test]
    fn default_cap_applies_without_row() {
        let store = SqliteStore::in_memory().unwrap();
        let mut config = CorralConfig::default();
        config.quotas.max_cluster_per_project = 1;
        seed_clusters(&store, "p1", 1);

        assert_eq!(
            check_cluster_quota(&store, &config, "p1").unwrap_err().kind(),
            "QuotaExceeded"
        );
        // Another project is unaffected
        check_cluster_quota(&store, &config, "p2").unwrap();
    }

    #[test]
    fn under_limit_passes() {
        let store = SqliteStore::in_memory().unwrap();
        let config = CorralConfig::default();
        seed_clusters(&store, "p1", 3);
        check_cluster_quota(&store, &config, "p1").unwrap();
    }
}
