//! Persisted entity types.
//!
//! These are plain data rows; behavior lives in the conductor. Mapping
//! collections (`labels`, `health_status_reason`, `node_addresses`,
//! federation members/properties) persist as JSON text columns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use corral_common::status::{
    ClusterStatus, Coe, HealthStatus, NodeGroupRole, ServerType,
};

/// Immutable recipe for creating clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTemplate {
    pub uuid: String,
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    pub image_ref: String,
    pub flavor: Option<String>,
    pub master_flavor: Option<String>,
    pub keypair: Option<String>,
    pub external_network: Option<String>,
    pub fixed_network: Option<String>,
    pub fixed_subnet: Option<String>,
    pub network_driver: Option<String>,
    pub volume_driver: Option<String>,
    pub dns_nameserver: Option<String>,
    pub apiserver_port: Option<u16>,
    pub docker_volume_size: Option<i64>,
    pub docker_storage_driver: Option<String>,
    pub cluster_distro: String,
    pub coe: Coe,
    pub labels: BTreeMap<String, String>,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
    pub registry_enabled: bool,
    pub tls_disabled: bool,
    /// Cross-tenant readable
    pub public: bool,
    /// Not listed unless explicitly requested
    pub hidden: bool,
    pub server_type: ServerType,
    pub insecure_registry: Option<String>,
    pub master_lb_enabled: bool,
    pub floating_ip_enabled: bool,
    pub tags: Option<String>,
    /// Explicit driver selector bypassing descriptor matching
    pub driver: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ClusterTemplate {
    /// Minimal template; the remaining attributes default to None/false.
    pub fn new(
        name: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        image_ref: impl Into<String>,
        cluster_distro: impl Into<String>,
        coe: Coe,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            image_ref: image_ref.into(),
            flavor: None,
            master_flavor: None,
            keypair: None,
            external_network: None,
            fixed_network: None,
            fixed_subnet: None,
            network_driver: None,
            volume_driver: None,
            dns_nameserver: None,
            apiserver_port: None,
            docker_volume_size: None,
            docker_storage_driver: None,
            cluster_distro: cluster_distro.into(),
            coe,
            labels: BTreeMap::new(),
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            registry_enabled: false,
            tls_disabled: false,
            public: false,
            hidden: false,
            server_type: ServerType::Vm,
            insecure_registry: None,
            master_lb_enabled: false,
            floating_ip_enabled: true,
            tags: None,
            driver: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// A living provisioned cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub uuid: String,
    pub name: String,
    pub project_id: String,
    pub user_id: String,
    /// Weak reference to the template by uuid
    pub cluster_template_id: String,
    /// Opaque handle from the driver's engine
    pub stack_id: Option<String>,
    pub status: ClusterStatus,
    pub status_reason: Option<String>,
    pub health_status: HealthStatus,
    pub health_status_reason: BTreeMap<String, String>,
    pub create_timeout_minutes: u32,
    pub api_address: Option<String>,
    pub discovery_url: Option<String>,
    pub coe_version: Option<String>,
    pub container_version: Option<String>,
    pub trustee_username: Option<String>,
    pub trustee_user_id: Option<String>,
    pub trustee_password: Option<String>,
    pub trust_id: Option<String>,
    pub ca_cert_ref: Option<String>,
    pub client_cert_ref: Option<String>,
    pub etcd_ca_cert_ref: Option<String>,
    pub front_proxy_ca_cert_ref: Option<String>,
    pub keypair: Option<String>,
    pub docker_volume_size: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub master_flavor_id: Option<String>,
    pub flavor_id: Option<String>,
    pub fixed_network: Option<String>,
    pub fixed_subnet: Option<String>,
    pub floating_ip_enabled: bool,
    pub master_lb_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cluster {
    /// A new cluster in CREATE_IN_PROGRESS, inheriting shape from its template.
    pub fn new(
        name: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        template: &ClusterTemplate,
        create_timeout_minutes: u32,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            name: name.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            cluster_template_id: template.uuid.clone(),
            stack_id: None,
            status: ClusterStatus::CreateInProgress,
            status_reason: None,
            health_status: HealthStatus::Unknown,
            health_status_reason: BTreeMap::new(),
            create_timeout_minutes,
            api_address: None,
            discovery_url: None,
            coe_version: None,
            container_version: None,
            trustee_username: None,
            trustee_user_id: None,
            trustee_password: None,
            trust_id: None,
            ca_cert_ref: None,
            client_cert_ref: None,
            etcd_ca_cert_ref: None,
            front_proxy_ca_cert_ref: None,
            keypair: template.keypair.clone(),
            docker_volume_size: template.docker_volume_size,
            labels: template.labels.clone(),
            master_flavor_id: template.master_flavor.clone(),
            flavor_id: template.flavor.clone(),
            fixed_network: template.fixed_network.clone(),
            fixed_subnet: template.fixed_subnet.clone(),
            floating_ip_enabled: template.floating_ip_enabled,
            master_lb_enabled: template.master_lb_enabled,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// All secret-store references recorded on this cluster.
    pub fn cert_refs(&self) -> Vec<&str> {
        [
            self.ca_cert_ref.as_deref(),
            self.client_cert_ref.as_deref(),
            self.etcd_ca_cert_ref.as_deref(),
            self.front_proxy_ca_cert_ref.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// A homogeneous group of worker or master nodes within a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub uuid: String,
    pub cluster_id: String,
    pub project_id: String,
    pub name: String,
    pub role: NodeGroupRole,
    pub flavor_id: Option<String>,
    pub image_id: Option<String>,
    pub node_count: u32,
    pub min_node_count: u32,
    pub max_node_count: Option<u32>,
    /// Ordered node addresses reported by the engine
    pub node_addresses: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub status: ClusterStatus,
    pub status_reason: Option<String>,
    pub version: Option<String>,
    pub stack_id: Option<String>,
    /// The two node groups created implicitly with the cluster
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl NodeGroup {
    pub fn new(
        cluster: &Cluster,
        name: impl Into<String>,
        role: NodeGroupRole,
        node_count: u32,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            cluster_id: cluster.uuid.clone(),
            project_id: cluster.project_id.clone(),
            name: name.into(),
            role,
            flavor_id: match role {
                NodeGroupRole::Master => cluster.master_flavor_id.clone(),
                NodeGroupRole::Worker => cluster.flavor_id.clone(),
            },
            image_id: None,
            node_count,
            min_node_count: if role == NodeGroupRole::Master { 1 } else { 0 },
            max_node_count: None,
            node_addresses: Vec::new(),
            labels: cluster.labels.clone(),
            status: ClusterStatus::CreateInProgress,
            status_reason: None,
            version: None,
            stack_id: None,
            is_default: false,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Validate `min_node_count <= node_count <= max_node_count`.
    pub fn validate_counts(&self) -> corral_common::Result<()> {
        if self.node_count < self.min_node_count {
            return Err(corral_common::Error::invalid_field(
                "node_count",
                format!(
                    "node_count {} is below min_node_count {}",
                    self.node_count, self.min_node_count
                ),
            ));
        }
        if let Some(max) = self.max_node_count {
            if self.node_count > max {
                return Err(corral_common::Error::invalid_field(
                    "node_count",
                    format!("node_count {} exceeds max_node_count {}", self.node_count, max),
                ));
            }
        }
        Ok(())
    }
}

/// An issued certificate, owned by exactly one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X509KeyPair {
    pub uuid: String,
    pub cluster_uuid: String,
    pub project_id: String,
    pub user_id: String,
    /// Well-known name within the cluster ("ca", "etcd-ca", "front-proxy-ca", "client")
    pub name: String,
    /// PEM certificate
    pub certificate: String,
    /// PEM private key, encrypted at rest
    pub private_key: String,
    pub private_key_passphrase: Option<String>,
    pub intermediates: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-project cap on a named resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub project_id: String,
    pub resource: String,
    pub hard_limit: i64,
    pub created_at: DateTime<Utc>,
}

/// Liveness record for a conductor worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub host: String,
    pub binary: String,
    pub last_seen_up: DateTime<Utc>,
    pub report_count: u64,
    pub disabled: bool,
    pub forced_down: bool,
    pub disabled_reason: Option<String>,
}

/// Row-level exclusivity primitive for per-cluster serialization.
#[derive(Debug, Clone)]
pub struct ClusterLockRow {
    pub cluster_uuid: String,
    pub conductor_id: String,
    pub taken_at: DateTime<Utc>,
}

/// Ordered set of member clusters with a designated host cluster.
///
/// Lifecycle transitions are reserved; only the entity and its CRUD are
/// implemented today.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Federation {
    pub uuid: String,
    pub name: String,
    pub project_id: String,
    pub hostcluster_id: String,
    pub member_ids: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub status: ClusterStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Aggregate returned by `cluster_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub cluster_count: u64,
    pub total_node_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ClusterTemplate {
        ClusterTemplate::new("kT", "p1", "u1", "fcos-1", "fedora-coreos", Coe::Kubernetes)
    }

    #[test]
    fn cluster_inherits_template_shape() {
        let mut t = template();
        t.flavor = Some("m1.small".into());
        t.master_flavor = Some("m1.medium".into());
        t.labels.insert("cni".into(), "calico".into());

        let c = Cluster::new("k1", "p1", "u1", &t, 60);
        assert_eq!(c.cluster_template_id, t.uuid);
        assert_eq!(c.flavor_id.as_deref(), Some("m1.small"));
        assert_eq!(c.master_flavor_id.as_deref(), Some("m1.medium"));
        assert_eq!(c.labels.get("cni").map(String::as_str), Some("calico"));
        assert_eq!(c.status, ClusterStatus::CreateInProgress);
        assert_eq!(c.health_status, HealthStatus::Unknown);
    }

    #[test]
    fn nodegroup_count_bounds() {
        let t = template();
        let c = Cluster::new("k1", "p1", "u1", &t, 60);
        let mut ng = NodeGroup::new(&c, "default-worker", NodeGroupRole::Worker, 3);
        assert!(ng.validate_counts().is_ok());

        ng.min_node_count = 5;
        assert!(ng.validate_counts().is_err());

        ng.min_node_count = 1;
        ng.max_node_count = Some(2);
        assert!(ng.validate_counts().is_err());
    }

    #[test]
    fn master_nodegroup_has_min_one() {
        let t = template();
        let c = Cluster::new("k1", "p1", "u1", &t, 60);
        let ng = NodeGroup::new(&c, "default-master", NodeGroupRole::Master, 1);
        assert_eq!(ng.min_node_count, 1);
    }

    #[test]
    fn cert_refs_skips_unset() {
        let t = template();
        let mut c = Cluster::new("k1", "p1", "u1", &t, 60);
        assert!(c.cert_refs().is_empty());
        c.ca_cert_ref = Some("secret://1".into());
        c.etcd_ca_cert_ref = Some("secret://2".into());
        assert_eq!(c.cert_refs(), vec!["secret://1", "secret://2"]);
    }
}
