//! Network-service contract: floating IPs, networks, subnets.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use corral_common::Result;

/// A floating IP attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    /// Port the address is bound to, if any
    pub port_id: Option<String>,
    pub description: String,
}

/// A tenant network (lookup only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub external: bool,
}

/// A subnet within a network (lookup only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub name: String,
    pub network_id: String,
    pub cidr: String,
}

/// Filters for floating-IP lookups.
#[derive(Debug, Clone, Default)]
pub struct FloatingIpFilters {
    pub port_id: Option<String>,
}

/// Operations the conductor invokes on the network service.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn list_floatingips(&self, filters: &FloatingIpFilters) -> Result<Vec<FloatingIp>>;

    /// Delete a floating IP. Deleting an unknown id is not an error.
    async fn delete_floatingip(&self, id: &str) -> Result<()>;

    async fn list_networks(&self, name: Option<&str>) -> Result<Vec<Network>>;

    async fn list_subnets(&self, network_id: Option<&str>) -> Result<Vec<Subnet>>;
}
