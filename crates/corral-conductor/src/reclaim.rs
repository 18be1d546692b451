//! Pre-deletion resource reclamation.
//!
//! Load balancers and floating IPs created on a cluster's behalf
//! outlive the stack that created them; destroying the stack first
//! would leak them into the tenant. Before any driver delete, the
//! conductor removes every balancer whose description carries the
//! cluster marker, waits for the cascades to finish, then releases the
//! floating IPs that were attached to the balancers' VIP ports.
//!
//! Any balancer in a transitional state fails the whole delete: racing
//! an in-flight LB operation produces half-deleted listener trees the
//! tenant cannot clean up themselves.

use std::time::Duration;

use tracing::{debug, info};

use corral_cloud::network::FloatingIpFilters;
use corral_cloud::{LoadBalancerClient, NetworkClient, ProvisioningStatus};
use corral_common::config::StackOpts;
use corral_common::{cluster_resource_marker, Error, Result};

/// Remove all cluster-owned load balancers and floating IPs.
///
/// Returns `PreDeletionFailed` on the first problem; the caller must
/// not proceed to the driver delete in that case.
pub async fn reclaim_cluster_resources(
    loadbalancer: &dyn LoadBalancerClient,
    network: &dyn NetworkClient,
    opts: &StackOpts,
    cluster_uuid: &str,
) -> Result<()> {
    let marker = cluster_resource_marker(cluster_uuid);

    let owned: Vec<_> = loadbalancer
        .load_balancer_list()
        .await
        .map_err(|e| Error::pre_deletion_failed(cluster_uuid, e.to_string()))?
        .into_iter()
        .filter(|lb| lb.description.contains(&marker))
        .collect();

    if owned.is_empty() {
        debug!(cluster = %cluster_uuid, "no load balancers to reclaim");
        return Ok(());
    }

    // Refuse while anything is mid-operation; the user retries the
    // delete once the balancer settles.
    for lb in &owned {
        if lb.provisioning_status.is_transitional() {
            return Err(Error::pre_deletion_failed(
                cluster_uuid,
                format!(
                    "load balancer {} is in status {:?}",
                    lb.id, lb.provisioning_status
                ),
            ));
        }
    }

    // VIP ports are collected before deleting; the floating IPs bound
    // to them are looked up afterwards.
    let vip_ports: Vec<String> = owned.iter().filter_map(|lb| lb.vip_port_id.clone()).collect();

    // Cascade deletes run concurrently; each balancer tears down its
    // own listener tree independently.
    let deletions: Vec<_> = owned
        .iter()
        .filter(|lb| lb.provisioning_status.is_deletable())
        .map(|lb| async move {
            info!(cluster = %cluster_uuid, lb = %lb.id, "deleting cluster load balancer");
            loadbalancer
                .load_balancer_delete(&lb.id, true)
                .await
                .map_err(|e| {
                    Error::pre_deletion_failed(
                        cluster_uuid,
                        format!("deleting load balancer {}: {}", lb.id, e),
                    )
                })
        })
        .collect();
    futures::future::try_join_all(deletions).await?;

    wait_for_lb_deletion(loadbalancer, opts, cluster_uuid, &owned).await?;

    for port_id in vip_ports {
        let fips = network
            .list_floatingips(&FloatingIpFilters {
                port_id: Some(port_id.clone()),
            })
            .await
            .map_err(|e| Error::pre_deletion_failed(cluster_uuid, e.to_string()))?;
        for fip in fips {
            if fip.description.contains(&marker) {
                info!(cluster = %cluster_uuid, fip = %fip.id, port = %port_id, "deleting floating IP");
                network.delete_floatingip(&fip.id).await.map_err(|e| {
                    Error::pre_deletion_failed(
                        cluster_uuid,
                        format!("deleting floating IP {}: {}", fip.id, e),
                    )
                })?;
            }
        }
    }

    Ok(())
}

/// Wait until every deleted balancer reports DELETED or disappears.
async fn wait_for_lb_deletion(
    loadbalancer: &dyn LoadBalancerClient,
    opts: &StackOpts,
    cluster_uuid: &str,
    owned: &[corral_cloud::LoadBalancer],
) -> Result<()> {
    let timeout = opts.pre_delete_lb_timeout();
    let poll_every = Duration::from_millis(250).min(timeout);
    let deadline = tokio::time::Instant::now() + timeout;

    let mut pending: Vec<&corral_cloud::LoadBalancer> = owned.iter().collect();
    loop {
        let mut still_there = Vec::new();
        for lb in pending {
            match loadbalancer
                .load_balancer_get(&lb.id)
                .await
                .map_err(|e| Error::pre_deletion_failed(cluster_uuid, e.to_string()))?
            {
                None => {}
                Some(current) if current.provisioning_status == ProvisioningStatus::Deleted => {}
                Some(_) => still_there.push(lb),
            }
        }
        if still_there.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::pre_deletion_failed(
                cluster_uuid,
                format!(
                    "{} load balancer(s) not deleted within {}s",
                    still_there.len(),
                    timeout.as_secs()
                ),
            ));
        }
        pending = still_there;
        tokio::time::sleep(poll_every).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_cloud::memory::{MemoryLoadBalancers, MemoryNetwork};

    fn opts() -> StackOpts {
        StackOpts {
            pre_delete_lb_timeout_secs: 1,
            ..Default::default()
        }
    }

    const CLUSTER: &str = "11111111-2222-3333-4444-555555555555";

    #[tokio::test]
    async fn reclaims_marked_lbs_and_fips() {
        let lbs = MemoryLoadBalancers::new();
        let net = MemoryNetwork::new();
        let marker = cluster_resource_marker(CLUSTER);

        lbs.seed(
            format!("api lb {}", marker),
            ProvisioningStatus::Active,
            Some("port-1".into()),
        );
        lbs.seed(
            format!("ingress lb {}", marker),
            ProvisioningStatus::Error,
            Some("port-2".into()),
        );
        // Unrelated balancer survives
        lbs.seed("someone else's", ProvisioningStatus::Active, None);

        net.seed_floatingip("198.51.100.7", Some("port-1".into()), format!("vip {}", marker));
        // FIP on the VIP port but without the marker stays
        net.seed_floatingip("198.51.100.8", Some("port-2".into()), "manually attached");

        reclaim_cluster_resources(&lbs, &net, &opts(), CLUSTER)
            .await
            .unwrap();

        assert_eq!(lbs.deleted_ids().len(), 2);
        assert_eq!(lbs.remaining(), 1);
        assert_eq!(net.deleted_floatingips().len(), 1);
        assert_eq!(net.remaining_floatingips(), 1);
    }

    #[tokio::test]
    async fn transitional_lb_fails_the_delete() {
        let lbs = MemoryLoadBalancers::new();
        let net = MemoryNetwork::new();
        let marker = cluster_resource_marker(CLUSTER);

        lbs.seed(
            format!("api lb {}", marker),
            ProvisioningStatus::PendingUpdate,
            None,
        );

        let err = reclaim_cluster_resources(&lbs, &net, &opts(), CLUSTER)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PreDeletionFailed");
        // Nothing was deleted
        assert!(lbs.deleted_ids().is_empty());
        assert_eq!(lbs.remaining(), 1);
    }

    #[tokio::test]
    async fn lb_delete_error_fails_the_delete() {
        let lbs = MemoryLoadBalancers::new();
        let net = MemoryNetwork::new();
        let marker = cluster_resource_marker(CLUSTER);
        lbs.seed(format!("api lb {}", marker), ProvisioningStatus::Active, None);
        *lbs.fail_delete.lock().unwrap() = true;

        let err = reclaim_cluster_resources(&lbs, &net, &opts(), CLUSTER)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "PreDeletionFailed");
    }

    #[tokio::test]
    async fn no_marked_resources_is_a_noop() {
        let lbs = MemoryLoadBalancers::new();
        let net = MemoryNetwork::new();
        lbs.seed("unrelated", ProvisioningStatus::Active, None);

        reclaim_cluster_resources(&lbs, &net, &opts(), CLUSTER)
            .await
            .unwrap();
        assert!(lbs.deleted_ids().is_empty());
    }
}
