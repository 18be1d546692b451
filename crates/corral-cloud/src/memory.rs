//! In-process implementations of the cloud contracts.
//!
//! These back the conductor's dev mode and the test suites. They are
//! deliberately small but behave like the real services at the contract
//! level: deletes are idempotent, unknown references are tolerated where
//! the contract says so, and every mutation is recorded so tests can
//! assert on what the conductor actually did.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use corral_common::{Error, RequestContext, Result};

use crate::identity::IdentityClient;
use crate::loadbalancer::{LoadBalancer, LoadBalancerClient, ProvisioningStatus};
use crate::network::{FloatingIp, FloatingIpFilters, Network, NetworkClient, Subnet};
use crate::secrets::SecretStore;

/// A user row held by [`MemoryIdentity`].
#[derive(Debug, Clone)]
pub struct MemoryUser {
    pub id: String,
    pub name: String,
    pub password: String,
    pub domain_id: String,
    pub roles: Vec<(String, String)>,
}

/// In-memory identity service.
#[derive(Default)]
pub struct MemoryIdentity {
    users: Mutex<HashMap<String, MemoryUser>>,
    trusts: Mutex<HashMap<String, String>>,
    /// When set, `create_user` fails (for exercising teardown paths)
    pub fail_user_creation: Mutex<bool>,
}

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn trust_count(&self) -> usize {
        self.trusts.lock().unwrap().len()
    }

    pub fn find_user(&self, user_id: &str) -> Option<MemoryUser> {
        self.users.lock().unwrap().get(user_id).cloned()
    }
}

#[async_trait]
impl IdentityClient for MemoryIdentity {
    async fn create_user(&self, name: &str, password: &str, domain_id: &str) -> Result<String> {
        if *self.fail_user_creation.lock().unwrap() {
            return Err(Error::external("identity", "user creation refused"));
        }
        let id = Uuid::new_v4().to_string();
        self.users.lock().unwrap().insert(
            id.clone(),
            MemoryUser {
                id: id.clone(),
                name: name.to_string(),
                password: password.to_string(),
                domain_id: domain_id.to_string(),
                roles: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn grant_role(&self, user_id: &str, project_id: &str, role: &str) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| Error::not_found("User", user_id))?;
        user.roles.push((project_id.to_string(), role.to_string()));
        Ok(())
    }

    async fn create_trust(
        &self,
        ctx: &RequestContext,
        trustee_user_id: &str,
        _roles: &[String],
        _impersonation: bool,
    ) -> Result<String> {
        if !self.users.lock().unwrap().contains_key(trustee_user_id) {
            return Err(Error::not_found("User", trustee_user_id));
        }
        let id = Uuid::new_v4().to_string();
        self.trusts
            .lock()
            .unwrap()
            .insert(id.clone(), format!("{}->{}", ctx.user_id, trustee_user_id));
        Ok(id)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.users.lock().unwrap().remove(user_id);
        Ok(())
    }

    async fn revoke_trust(&self, trust_id: &str) -> Result<()> {
        self.trusts.lock().unwrap().remove(trust_id);
        Ok(())
    }
}

/// In-memory load-balancer service.
#[derive(Default)]
pub struct MemoryLoadBalancers {
    lbs: Mutex<HashMap<String, LoadBalancer>>,
    deleted: Mutex<Vec<String>>,
    /// When set, `load_balancer_delete` fails
    pub fail_delete: Mutex<bool>,
}

impl MemoryLoadBalancers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a load balancer; returns its id.
    pub fn seed(
        &self,
        description: impl Into<String>,
        status: ProvisioningStatus,
        vip_port_id: Option<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.lbs.lock().unwrap().insert(
            id.clone(),
            LoadBalancer {
                id: id.clone(),
                description: description.into(),
                provisioning_status: status,
                vip_port_id,
            },
        );
        id
    }

    /// Ids passed to `load_balancer_delete` so far.
    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.lbs.lock().unwrap().len()
    }
}

#[async_trait]
impl LoadBalancerClient for MemoryLoadBalancers {
    async fn load_balancer_list(&self) -> Result<Vec<LoadBalancer>> {
        Ok(self.lbs.lock().unwrap().values().cloned().collect())
    }

    async fn load_balancer_get(&self, id: &str) -> Result<Option<LoadBalancer>> {
        Ok(self.lbs.lock().unwrap().get(id).cloned())
    }

    async fn load_balancer_delete(&self, id: &str, _cascade: bool) -> Result<()> {
        if *self.fail_delete.lock().unwrap() {
            return Err(Error::external("loadbalancer", "delete refused"));
        }
        self.deleted.lock().unwrap().push(id.to_string());
        self.lbs.lock().unwrap().remove(id);
        Ok(())
    }
}

/// In-memory network service.
#[derive(Default)]
pub struct MemoryNetwork {
    fips: Mutex<HashMap<String, FloatingIp>>,
    networks: Mutex<Vec<Network>>,
    subnets: Mutex<Vec<Subnet>>,
    deleted_fips: Mutex<Vec<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a floating IP bound to a port; returns its id.
    pub fn seed_floatingip(
        &self,
        address: impl Into<String>,
        port_id: Option<String>,
        description: impl Into<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.fips.lock().unwrap().insert(
            id.clone(),
            FloatingIp {
                id: id.clone(),
                floating_ip_address: address.into(),
                port_id,
                description: description.into(),
            },
        );
        id
    }

    pub fn seed_network(&self, name: impl Into<String>, external: bool) -> String {
        let id = Uuid::new_v4().to_string();
        self.networks.lock().unwrap().push(Network {
            id: id.clone(),
            name: name.into(),
            external,
        });
        id
    }

    pub fn deleted_floatingips(&self) -> Vec<String> {
        self.deleted_fips.lock().unwrap().clone()
    }

    pub fn remaining_floatingips(&self) -> usize {
        self.fips.lock().unwrap().len()
    }
}

#[async_trait]
impl NetworkClient for MemoryNetwork {
    async fn list_floatingips(&self, filters: &FloatingIpFilters) -> Result<Vec<FloatingIp>> {
        Ok(self
            .fips
            .lock()
            .unwrap()
            .values()
            .filter(|fip| match &filters.port_id {
                Some(port) => fip.port_id.as_deref() == Some(port.as_str()),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn delete_floatingip(&self, id: &str) -> Result<()> {
        self.deleted_fips.lock().unwrap().push(id.to_string());
        self.fips.lock().unwrap().remove(id);
        Ok(())
    }

    async fn list_networks(&self, name: Option<&str>) -> Result<Vec<Network>> {
        Ok(self
            .networks
            .lock()
            .unwrap()
            .iter()
            .filter(|n| name.map_or(true, |wanted| n.name == wanted))
            .cloned()
            .collect())
    }

    async fn list_subnets(&self, network_id: Option<&str>) -> Result<Vec<Subnet>> {
        Ok(self
            .subnets
            .lock()
            .unwrap()
            .iter()
            .filter(|s| network_id.map_or(true, |wanted| s.network_id == wanted))
            .cloned()
            .collect())
    }
}

/// In-memory secret store.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secret_count(&self) -> usize {
        self.secrets.lock().unwrap().len()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn store(&self, name: &str, payload: &[u8]) -> Result<String> {
        let secret_ref = format!("secret://{}/{}", name, Uuid::new_v4());
        self.secrets
            .lock()
            .unwrap()
            .insert(secret_ref.clone(), payload.to_vec());
        Ok(secret_ref)
    }

    async fn get(&self, secret_ref: &str) -> Result<Vec<u8>> {
        self.secrets
            .lock()
            .unwrap()
            .get(secret_ref)
            .cloned()
            .ok_or_else(|| Error::not_found("Secret", secret_ref))
    }

    async fn delete(&self, secret_ref: &str) -> Result<()> {
        self.secrets.lock().unwrap().remove(secret_ref);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_user_and_trust_lifecycle() {
        let identity = MemoryIdentity::new();
        let ctx = RequestContext::new("p1", "u1");

        let user_id = identity.create_user("c1_ab12", "s3cret", "trustee").await.unwrap();
        identity.grant_role(&user_id, "p1", "member").await.unwrap();
        let trust_id = identity
            .create_trust(&ctx, &user_id, &["member".to_string()], true)
            .await
            .unwrap();
        assert_eq!(identity.user_count(), 1);
        assert_eq!(identity.trust_count(), 1);

        identity.revoke_trust(&trust_id).await.unwrap();
        identity.delete_user(&user_id).await.unwrap();
        assert_eq!(identity.user_count(), 0);
        assert_eq!(identity.trust_count(), 0);

        // Idempotent teardown
        identity.revoke_trust(&trust_id).await.unwrap();
        identity.delete_user(&user_id).await.unwrap();
    }

    #[tokio::test]
    async fn lb_delete_records_and_removes() {
        let lbs = MemoryLoadBalancers::new();
        let id = lbs.seed("api lb from cluster abc", ProvisioningStatus::Active, None);
        lbs.load_balancer_delete(&id, true).await.unwrap();
        assert_eq!(lbs.deleted_ids(), vec![id.clone()]);
        assert!(lbs.load_balancer_get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn floatingip_filter_by_port() {
        let net = MemoryNetwork::new();
        net.seed_floatingip("198.51.100.7", Some("port-1".into()), "vip from cluster abc");
        net.seed_floatingip("198.51.100.8", Some("port-2".into()), "unrelated");

        let filters = FloatingIpFilters {
            port_id: Some("port-1".into()),
        };
        let found = net.list_floatingips(&filters).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].floating_ip_address, "198.51.100.7");
    }

    #[tokio::test]
    async fn secret_store_round_trip() {
        let store = MemorySecretStore::new();
        let secret_ref = store.store("ca", b"payload").await.unwrap();
        assert_eq!(store.get(&secret_ref).await.unwrap(), b"payload");
        store.delete(&secret_ref).await.unwrap();
        assert!(store.get(&secret_ref).await.is_err());
        // Idempotent delete
        store.delete(&secret_ref).await.unwrap();
    }
}
