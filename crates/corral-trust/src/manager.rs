//! Certificate and trust lifecycle manager.
//!
//! Issues the per-cluster CA bundle, persists it through the configured
//! backend (secret store or keypair table), signs user CSRs against the
//! cluster CA, and tears everything down when the cluster goes away.
//! Certificates are always handed around by opaque reference; PEM never
//! lands on the cluster row.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use corral_cloud::{IdentityClient, SecretStore};
use corral_common::config::{CertManagerType, CertificateOpts, TrustOpts};
use corral_common::retry::{retry_with_backoff, RetryConfig};
use corral_common::status::Coe;
use corral_common::{Error, RequestContext, Result};
use corral_store::{Cluster, SqliteStore, X509KeyPair};

use crate::encrypt;
use crate::pki::{self, CertificateAuthority};
use crate::trustee::{self, TrusteeCredentials};

/// Which CA of the bundle a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaKind {
    /// The main cluster CA
    Ca,
    /// The etcd CA (k8s distros only)
    EtcdCa,
    /// The front-proxy CA (k8s distros only)
    FrontProxyCa,
}

/// References to everything issued for a cluster.
#[derive(Debug, Clone, Default)]
pub struct CertBundle {
    pub ca_ref: String,
    pub client_ref: String,
    pub etcd_ca_ref: Option<String>,
    pub front_proxy_ca_ref: Option<String>,
}

/// Persisted shape of one keypair (secret-store payloads use this JSON;
/// the keypair table carries the same fields as columns).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeyPair {
    name: String,
    certificate: String,
    /// Encrypted PEM, see [`crate::encrypt`]
    private_key: String,
    private_key_passphrase: String,
}

/// Trust & certificate manager for the conductor.
pub struct TrustCertManager {
    identity: Arc<dyn IdentityClient>,
    secrets: Arc<dyn SecretStore>,
    store: Arc<SqliteStore>,
    certs: CertificateOpts,
    trust: TrustOpts,
}

impl TrustCertManager {
    pub fn new(
        identity: Arc<dyn IdentityClient>,
        secrets: Arc<dyn SecretStore>,
        store: Arc<SqliteStore>,
        certs: CertificateOpts,
        trust: TrustOpts,
    ) -> Self {
        Self {
            identity,
            secrets,
            store,
            certs,
            trust,
        }
    }

    /// Mint the trustee user and trust for a cluster being created.
    pub async fn provision_trustee(
        &self,
        ctx: &RequestContext,
        cluster_uuid: &str,
    ) -> Result<TrusteeCredentials> {
        trustee::provision(self.identity.as_ref(), ctx, &self.trust, cluster_uuid).await
    }

    /// Generate and persist the CA bundle plus the conductor's client
    /// certificate; record the references on the cluster.
    ///
    /// Kubernetes distros additionally get `etcd` and `front-proxy` CAs.
    /// On failure every payload stored so far is removed again.
    pub async fn provision_certificates(
        &self,
        ctx: &RequestContext,
        cluster: &mut Cluster,
        coe: Coe,
    ) -> Result<CertBundle> {
        let mut stored_refs: Vec<String> = Vec::new();
        let result = self
            .provision_certificates_inner(ctx, cluster, coe, &mut stored_refs)
            .await;
        match result {
            Ok(bundle) => Ok(bundle),
            Err(e) => {
                for secret_ref in &stored_refs {
                    self.delete_ref(secret_ref).await;
                }
                Err(Error::certificates_failed(&cluster.uuid, e.to_string()))
            }
        }
    }

    async fn provision_certificates_inner(
        &self,
        ctx: &RequestContext,
        cluster: &mut Cluster,
        coe: Coe,
        stored_refs: &mut Vec<String>,
    ) -> Result<CertBundle> {
        let ca = self.generate_ca(&cluster.uuid)?;
        let ca_ref = self
            .persist_keypair(ctx, cluster, "ca", ca.ca_cert_pem(), ca.ca_key_pem())
            .await?;
        stored_refs.push(ca_ref.clone());

        // Client certificate the conductor presents to the cluster API
        let (client_cert, client_key) = ca
            .issue_server_cert(
                "admin",
                &[cluster.name.as_str()],
                self.certs.key_profile,
                self.certs.cert_validity_days,
            )
            .map_err(|e| Error::certificates_failed(&cluster.uuid, e.to_string()))?;
        let client_ref = self
            .persist_keypair(ctx, cluster, "client", &client_cert, &client_key)
            .await?;
        stored_refs.push(client_ref.clone());

        let mut bundle = CertBundle {
            ca_ref: ca_ref.clone(),
            client_ref: client_ref.clone(),
            ..Default::default()
        };

        if coe == Coe::Kubernetes {
            let etcd_ca = self.generate_ca(&format!("{}-etcd", cluster.uuid))?;
            let etcd_ref = self
                .persist_keypair(
                    ctx,
                    cluster,
                    "etcd-ca",
                    etcd_ca.ca_cert_pem(),
                    etcd_ca.ca_key_pem(),
                )
                .await?;
            stored_refs.push(etcd_ref.clone());

            let fp_ca = self.generate_ca(&format!("{}-front-proxy", cluster.uuid))?;
            let fp_ref = self
                .persist_keypair(
                    ctx,
                    cluster,
                    "front-proxy-ca",
                    fp_ca.ca_cert_pem(),
                    fp_ca.ca_key_pem(),
                )
                .await?;
            stored_refs.push(fp_ref.clone());

            bundle.etcd_ca_ref = Some(etcd_ref);
            bundle.front_proxy_ca_ref = Some(fp_ref);
        }

        cluster.ca_cert_ref = Some(bundle.ca_ref.clone());
        cluster.client_cert_ref = Some(bundle.client_ref.clone());
        cluster.etcd_ca_cert_ref = bundle.etcd_ca_ref.clone();
        cluster.front_proxy_ca_cert_ref = bundle.front_proxy_ca_ref.clone();

        debug!(cluster = %cluster.uuid, backend = ?self.certs.cert_manager_type, "issued cluster CA bundle");
        Ok(bundle)
    }

    fn generate_ca(&self, common_name: &str) -> Result<CertificateAuthority> {
        CertificateAuthority::new(
            common_name,
            self.certs.key_profile,
            self.certs.ca_validity_days,
        )
        .map_err(|e| Error::certificates_failed(common_name, e.to_string()))
    }

    async fn persist_keypair(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        name: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<String> {
        let passphrase = encrypt::random_passphrase()
            .map_err(|e| Error::certificates_failed(&cluster.uuid, e.to_string()))?;
        let sealed = encrypt::encrypt(key_pem.as_bytes(), &passphrase)
            .map_err(|e| Error::certificates_failed(&cluster.uuid, e.to_string()))?;

        match self.certs.cert_manager_type {
            CertManagerType::SecretStore => {
                let payload = serde_json::to_vec(&StoredKeyPair {
                    name: name.to_string(),
                    certificate: cert_pem.to_string(),
                    private_key: sealed,
                    private_key_passphrase: passphrase,
                })
                .map_err(|e| Error::internal("cert-manager", e.to_string()))?;
                self.secrets
                    .store(&format!("{}-{}", cluster.uuid, name), &payload)
                    .await
            }
            CertManagerType::Database => {
                let row = X509KeyPair {
                    uuid: Uuid::new_v4().to_string(),
                    cluster_uuid: cluster.uuid.clone(),
                    project_id: cluster.project_id.clone(),
                    user_id: ctx.user_id.clone(),
                    name: name.to_string(),
                    certificate: cert_pem.to_string(),
                    private_key: sealed,
                    private_key_passphrase: Some(passphrase),
                    intermediates: None,
                    created_at: Utc::now(),
                };
                self.store.create_x509keypair(&row)?;
                Ok(format!("x509://{}", row.uuid))
            }
        }
    }

    async fn load_keypair(&self, secret_ref: &str) -> Result<StoredKeyPair> {
        if let Some(uuid) = secret_ref.strip_prefix("x509://") {
            let row = self.store.get_x509keypair(uuid)?;
            Ok(StoredKeyPair {
                name: row.name,
                certificate: row.certificate,
                private_key: row.private_key,
                private_key_passphrase: row.private_key_passphrase.unwrap_or_default(),
            })
        } else {
            let payload = retry_with_backoff(
                &RetryConfig::with_max_attempts(3),
                "secret_store_get",
                || self.secrets.get(secret_ref),
            )
            .await?;
            serde_json::from_slice(&payload)
                .map_err(|e| Error::internal("cert-manager", e.to_string()))
        }
    }

    async fn delete_ref(&self, secret_ref: &str) {
        let result = if let Some(uuid) = secret_ref.strip_prefix("x509://") {
            self.store.destroy_x509keypair(uuid)
        } else {
            self.secrets.delete(secret_ref).await
        };
        if let Err(e) = result {
            warn!(secret_ref = %secret_ref, error = %e, "failed to delete certificate payload");
        }
    }

    /// Open the cluster's main CA for signing.
    async fn load_ca(&self, cluster: &Cluster) -> Result<CertificateAuthority> {
        let ca_ref = cluster
            .ca_cert_ref
            .as_deref()
            .ok_or_else(|| Error::not_found("KeyPair", format!("{} CA", cluster.uuid)))?;
        let stored = self.load_keypair(ca_ref).await?;
        let key_pem = encrypt::decrypt(&stored.private_key, &stored.private_key_passphrase)
            .map_err(|e| Error::internal("cert-manager", e.to_string()))?;
        let key_pem = String::from_utf8(key_pem)
            .map_err(|e| Error::internal("cert-manager", e.to_string()))?;
        CertificateAuthority::from_pem(&stored.certificate, &key_pem)
            .map_err(|e| Error::internal("cert-manager", e.to_string()))
    }

    /// Sign a user CSR against the cluster CA.
    ///
    /// The CSR's key strength is validated first; the caller-supplied
    /// validity is clamped to the configured maximum. The CA private key
    /// is decrypted only for the duration of the signing call.
    pub async fn sign_certificate(
        &self,
        cluster: &Cluster,
        csr_pem: &str,
        validity_days: Option<i64>,
    ) -> Result<String> {
        pki::validate_csr_strength(csr_pem, self.certs.min_rsa_key_bits).map_err(|e| match e {
            pki::PkiError::WeakKey(msg) => Error::invalid_field("csr", msg),
            other => Error::invalid_field("csr", other.to_string()),
        })?;

        let validity = validity_days
            .unwrap_or(self.certs.cert_validity_days)
            .clamp(1, self.certs.max_sign_validity_days);

        let ca = self.load_ca(cluster).await?;
        ca.sign_csr(csr_pem, &cluster.uuid, validity)
            .map_err(|e| Error::certificates_failed(&cluster.uuid, e.to_string()))
    }

    /// Fetch a CA certificate (PEM) for distribution.
    pub async fn get_ca_certificate(&self, cluster: &Cluster, kind: CaKind) -> Result<String> {
        let secret_ref = match kind {
            CaKind::Ca => cluster.ca_cert_ref.as_deref(),
            CaKind::EtcdCa => cluster.etcd_ca_cert_ref.as_deref(),
            CaKind::FrontProxyCa => cluster.front_proxy_ca_cert_ref.as_deref(),
        }
        .ok_or_else(|| Error::not_found("KeyPair", format!("{} {:?}", cluster.uuid, kind)))?;
        Ok(self.load_keypair(secret_ref).await?.certificate)
    }

    /// Remove everything issued for a cluster: cert payloads, keypair
    /// rows, the trust, and the trustee user.
    ///
    /// Best-effort: a half-deleted cloud must never prevent the cluster
    /// row from being destroyed.
    pub async fn teardown(&self, cluster: &Cluster) {
        for secret_ref in cluster.cert_refs() {
            self.delete_ref(secret_ref).await;
        }
        match self.store.destroy_x509keypairs_for_cluster(&cluster.uuid) {
            Ok(0) => {}
            Ok(n) => debug!(cluster = %cluster.uuid, count = n, "removed keypair rows"),
            Err(e) => {
                warn!(cluster = %cluster.uuid, error = %e, "failed to remove keypair rows")
            }
        }
        trustee::teardown(
            self.identity.as_ref(),
            &cluster.uuid,
            cluster.trust_id.as_deref(),
            cluster.trustee_user_id.as_deref(),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_cloud::memory::{MemoryIdentity, MemorySecretStore};
    use corral_common::status::Coe;
    use corral_store::ClusterTemplate;

    fn manager_with(
        certs: CertificateOpts,
    ) -> (
        TrustCertManager,
        Arc<MemoryIdentity>,
        Arc<MemorySecretStore>,
        Arc<SqliteStore>,
    ) {
        let identity = Arc::new(MemoryIdentity::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let manager = TrustCertManager::new(
            identity.clone(),
            secrets.clone(),
            store.clone(),
            certs,
            TrustOpts::default(),
        );
        (manager, identity, secrets, store)
    }

    fn cluster() -> Cluster {
        let template = ClusterTemplate::new(
            "kT",
            "p1",
            "u1",
            "fcos-1",
            "fedora-coreos",
            Coe::Kubernetes,
        );
        Cluster::new("k1", "p1", "u1", &template, 60)
    }

    #[tokio::test]
    async fn kubernetes_gets_three_cas() {
        let (manager, _, secrets, _) = manager_with(CertificateOpts::default());
        let ctx = RequestContext::new("p1", "u1");
        let mut c = cluster();

        let bundle = manager
            .provision_certificates(&ctx, &mut c, Coe::Kubernetes)
            .await
            .unwrap();
        assert!(bundle.etcd_ca_ref.is_some());
        assert!(bundle.front_proxy_ca_ref.is_some());
        assert_eq!(c.cert_refs().len(), 4);
        // ca + client + etcd-ca + front-proxy-ca
        assert_eq!(secrets.secret_count(), 4);
    }

    #[tokio::test]
    async fn swarm_gets_single_ca() {
        let (manager, _, secrets, _) = manager_with(CertificateOpts::default());
        let ctx = RequestContext::new("p1", "u1");
        let mut c = cluster();

        let bundle = manager
            .provision_certificates(&ctx, &mut c, Coe::Swarm)
            .await
            .unwrap();
        assert!(bundle.etcd_ca_ref.is_none());
        assert_eq!(secrets.secret_count(), 2);
    }

    #[tokio::test]
    async fn database_backend_writes_keypair_rows() {
        let certs = CertificateOpts {
            cert_manager_type: CertManagerType::Database,
            ..Default::default()
        };
        let (manager, _, secrets, store) = manager_with(certs);
        let ctx = RequestContext::new("p1", "u1");
        let mut c = cluster();
        store
            .create_cluster_template(&ClusterTemplate::new(
                "kT2",
                "p1",
                "u1",
                "fcos-1",
                "fedora-coreos",
                Coe::Kubernetes,
            ))
            .unwrap();

        manager
            .provision_certificates(&ctx, &mut c, Coe::Kubernetes)
            .await
            .unwrap();
        assert_eq!(secrets.secret_count(), 0);
        assert!(c.ca_cert_ref.as_deref().unwrap().starts_with("x509://"));

        let filters = corral_store::X509Filters {
            cluster_uuid: Some(c.uuid.clone()),
            ..Default::default()
        };
        let rows = store
            .list_x509keypairs(&ctx, &filters, &corral_store::ListQuery::default())
            .unwrap();
        assert_eq!(rows.len(), 4);
        // Keys are sealed, not plaintext PEM
        assert!(rows.iter().all(|r| !r.private_key.contains("PRIVATE KEY")));
    }

    #[tokio::test]
    async fn sign_certificate_round_trip() {
        let (manager, _, _, _) = manager_with(CertificateOpts::default());
        let ctx = RequestContext::new("p1", "u1");
        let mut c = cluster();
        manager
            .provision_certificates(&ctx, &mut c, Coe::Kubernetes)
            .await
            .unwrap();

        let key = rcgen::KeyPair::generate().unwrap();
        let csr = rcgen::CertificateParams::default()
            .serialize_request(&key)
            .unwrap()
            .pem()
            .unwrap();

        let signed = manager.sign_certificate(&c, &csr, Some(30)).await.unwrap();
        let ca_pem = manager.get_ca_certificate(&c, CaKind::Ca).await.unwrap();
        assert!(pki::verify_signed_by(&signed, &ca_pem).unwrap());
    }

    #[tokio::test]
    async fn sign_clamps_validity_and_rejects_garbage() {
        let (manager, _, _, _) = manager_with(CertificateOpts::default());
        let ctx = RequestContext::new("p1", "u1");
        let mut c = cluster();
        manager
            .provision_certificates(&ctx, &mut c, Coe::Swarm)
            .await
            .unwrap();

        let err = manager
            .sign_certificate(&c, "not a csr", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidParameter");
    }

    #[tokio::test]
    async fn teardown_removes_everything() {
        let (manager, identity, secrets, _) = manager_with(CertificateOpts::default());
        let ctx = RequestContext::new("p1", "u1");
        let mut c = cluster();

        let creds = manager.provision_trustee(&ctx, &c.uuid).await.unwrap();
        c.trustee_user_id = Some(creds.user_id);
        c.trustee_username = Some(creds.username);
        c.trust_id = Some(creds.trust_id);
        manager
            .provision_certificates(&ctx, &mut c, Coe::Kubernetes)
            .await
            .unwrap();

        manager.teardown(&c).await;
        assert_eq!(secrets.secret_count(), 0);
        assert_eq!(identity.user_count(), 0);
        assert_eq!(identity.trust_count(), 0);

        // Second teardown is harmless
        manager.teardown(&c).await;
    }
}
