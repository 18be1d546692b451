//! Typed configuration for the conductor
//!
//! Options are grouped into the namespaces operators know from the
//! service's configuration file (`cluster.*`, `cluster_heat.*`,
//! `drivers.*`, `trust.*`, `certificates.*`, `quotas.*`,
//! `capi_driver.*`, `conductor.*`). The whole tree is deserialized once
//! at process start and handed to the conductor context; nothing reads
//! configuration after startup.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Root configuration tree, one field per option group
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorralConfig {
    /// Cluster defaults (`cluster.*`)
    pub cluster: ClusterOpts,
    /// Stack-engine polling and reclamation (`cluster_heat.*`)
    pub cluster_heat: StackOpts,
    /// Driver registry filtering (`drivers.*`)
    pub drivers: DriverOpts,
    /// Trustee identity and delegation (`trust.*`)
    pub trust: TrustOpts,
    /// PKI and certificate storage (`certificates.*`)
    pub certificates: CertificateOpts,
    /// Per-project caps (`quotas.*`)
    pub quotas: QuotaOpts,
    /// Management-cluster driver (`capi_driver.*`)
    pub capi_driver: CapiDriverOpts,
    /// Worker-process identity and locking (`conductor.*`)
    pub conductor: ConductorOpts,
}

impl CorralConfig {
    /// Parse a YAML configuration document
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        serde_yaml::from_str(text)
            .map_err(|e| Error::invalid_parameter(format!("bad configuration: {}", e)))
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_parameter(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }
}

/// Cluster-level defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterOpts {
    /// Default creation timeout handed to drivers, in minutes
    pub default_create_timeout_minutes: u32,
    /// Prefix prepended to engine stack names
    pub stack_name_prefix: String,
}

impl Default for ClusterOpts {
    fn default() -> Self {
        Self {
            default_create_timeout_minutes: 60,
            stack_name_prefix: "corral-".to_string(),
        }
    }
}

/// Stack-engine polling, timeouts, and pre-deletion reclamation
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackOpts {
    /// Maximum poll ticks before an in-progress operation is failed with
    /// reason "timeout" (2160 ticks at the default interval is six hours)
    pub max_attempts: u32,
    /// Seconds between poll ticks
    pub wait_interval_secs: u64,
    /// Bound, in seconds, on waiting for a load balancer to cascade-delete
    /// during pre-deletion reclamation
    pub pre_delete_lb_timeout_secs: u64,
}

impl Default for StackOpts {
    fn default() -> Self {
        Self {
            max_attempts: 2160,
            wait_interval_secs: 10,
            pre_delete_lb_timeout_secs: 60,
        }
    }
}

impl StackOpts {
    /// Poll interval as a `Duration`
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }

    /// LB reclamation bound as a `Duration`
    pub fn pre_delete_lb_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_delete_lb_timeout_secs)
    }
}

/// Driver registry filtering
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverOpts {
    /// Names of drivers to enable; empty enables every registered driver
    pub enabled_drivers: Vec<String>,
}

/// Trustee identity and trust delegation
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustOpts {
    /// Identity-service domain trustee users are created in
    pub trustee_domain_id: String,
    /// Project roles granted to the trustee user
    pub roles: Vec<String>,
    /// Whether the trust delegates with impersonation enabled
    pub allow_impersonation: bool,
}

impl Default for TrustOpts {
    fn default() -> Self {
        Self {
            trustee_domain_id: "trustee".to_string(),
            roles: vec!["member".to_string()],
            allow_impersonation: true,
        }
    }
}

/// Where issued certificates and CA private keys are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertManagerType {
    /// Payloads live in the external secret store; the cluster row holds
    /// opaque references
    #[default]
    SecretStore,
    /// Payloads live in the object store's keypair table (small or
    /// air-gapped deployments)
    Database,
}

/// Elliptic-curve profile used for generated CA and server keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyProfile {
    /// NIST P-256 (default)
    #[default]
    P256,
    /// NIST P-384
    P384,
}

/// PKI behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CertificateOpts {
    /// Storage backend for certificates and encrypted keys
    pub cert_manager_type: CertManagerType,
    /// Curve for generated CA/server keys
    pub key_profile: KeyProfile,
    /// Validity of the cluster server certificate, in days
    pub cert_validity_days: i64,
    /// Validity of generated CA certificates, in days
    pub ca_validity_days: i64,
    /// Upper bound on caller-requested validity for signed CSRs, in days
    pub max_sign_validity_days: i64,
    /// Minimum RSA modulus accepted in user CSRs, in bits
    pub min_rsa_key_bits: usize,
}

impl Default for CertificateOpts {
    fn default() -> Self {
        Self {
            cert_manager_type: CertManagerType::default(),
            key_profile: KeyProfile::default(),
            cert_validity_days: 365,
            ca_validity_days: 3650,
            max_sign_validity_days: 365,
            min_rsa_key_bits: 2048,
        }
    }
}

/// Per-project caps
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaOpts {
    /// Cluster cap applied when a project has no explicit quota row
    pub max_cluster_per_project: i64,
}

impl Default for QuotaOpts {
    fn default() -> Self {
        Self {
            max_cluster_per_project: 20,
        }
    }
}

/// Management-cluster driver options
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CapiDriverOpts {
    /// Namespace cluster manifests are reconciled into on the
    /// management cluster
    pub namespace: String,
    /// Label selector value identifying objects owned by this service
    pub owner_label: String,
}

impl Default for CapiDriverOpts {
    fn default() -> Self {
        Self {
            namespace: "corral-clusters".to_string(),
            owner_label: "corral".to_string(),
        }
    }
}

/// Worker-process identity, heartbeat, and locking
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConductorOpts {
    /// Hostname recorded in this worker's service record; defaults to the
    /// HOSTNAME environment variable
    pub host: Option<String>,
    /// Seconds between service-record heartbeats
    pub heartbeat_interval_secs: u64,
    /// Age, in seconds, after which a non-renewing lock holder is
    /// considered dead and its locks become stealable (order 4x the
    /// heartbeat interval)
    pub life_check_timeout_secs: u64,
    /// Bound, in seconds, on waiting to acquire a cluster lock before the
    /// caller reports the cluster busy
    pub lock_acquire_timeout_secs: u64,
}

impl Default for ConductorOpts {
    fn default() -> Self {
        Self {
            host: None,
            heartbeat_interval_secs: 10,
            life_check_timeout_secs: 40,
            lock_acquire_timeout_secs: 10,
        }
    }
}

impl ConductorOpts {
    /// Resolved worker hostname
    pub fn hostname(&self) -> String {
        self.host
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Heartbeat period as a `Duration`
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Stale-holder threshold as a `Duration`
    pub fn life_check_timeout(&self) -> Duration {
        Duration::from_secs(self.life_check_timeout_secs)
    }

    /// Lock wait bound as a `Duration`
    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_acquire_timeout_secs)
    }
}
