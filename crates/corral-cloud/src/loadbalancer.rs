//! Load-balancer service contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use corral_common::Result;

/// Provisioning status reported by the load-balancer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    Active,
    Error,
    Deleted,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl ProvisioningStatus {
    /// Transitional statuses cannot be acted on; a delete issued against
    /// one would race the in-flight operation.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ProvisioningStatus::PendingCreate
                | ProvisioningStatus::PendingUpdate
                | ProvisioningStatus::PendingDelete
        )
    }

    /// Statuses from which a cascade delete may be issued.
    pub fn is_deletable(&self) -> bool {
        matches!(self, ProvisioningStatus::Active | ProvisioningStatus::Error)
    }
}

/// A load balancer as seen by the reclamation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    /// Free-form description; cluster-owned LBs carry the cluster marker
    pub description: String,
    pub provisioning_status: ProvisioningStatus,
    /// Port carrying the VIP; floating IPs attach here
    pub vip_port_id: Option<String>,
}

/// Operations the conductor invokes on the load-balancer service.
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    /// All load balancers visible to the service user.
    async fn load_balancer_list(&self) -> Result<Vec<LoadBalancer>>;

    /// A single load balancer, or None once it is gone.
    async fn load_balancer_get(&self, id: &str) -> Result<Option<LoadBalancer>>;

    /// Delete a load balancer; `cascade` removes listeners, pools, and
    /// members with it.
    async fn load_balancer_delete(&self, id: &str, cascade: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitional_statuses() {
        assert!(ProvisioningStatus::PendingUpdate.is_transitional());
        assert!(ProvisioningStatus::PendingDelete.is_transitional());
        assert!(!ProvisioningStatus::Active.is_transitional());
    }

    #[test]
    fn deletable_statuses() {
        assert!(ProvisioningStatus::Active.is_deletable());
        assert!(ProvisioningStatus::Error.is_deletable());
        assert!(!ProvisioningStatus::Deleted.is_deletable());
        assert!(!ProvisioningStatus::PendingCreate.is_deletable());
    }
}
