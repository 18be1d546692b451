//! Identity-service contract: trustee users, role grants, trusts.

use async_trait::async_trait;

use corral_common::{RequestContext, Result};

/// Operations the conductor invokes on the identity service.
///
/// Trustee users live in a dedicated service domain; trusts delegate a
/// role set from the original caller to the trustee, scoped to the
/// cluster's project.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Create a user in the given domain; returns the new user id.
    async fn create_user(&self, name: &str, password: &str, domain_id: &str) -> Result<String>;

    /// Grant `role` to `user_id` on `project_id`.
    async fn grant_role(&self, user_id: &str, project_id: &str, role: &str) -> Result<()>;

    /// Create a trust from the calling user to `trustee_user_id`,
    /// delegating `roles` on the caller's project. Returns the trust id.
    async fn create_trust(
        &self,
        ctx: &RequestContext,
        trustee_user_id: &str,
        roles: &[String],
        impersonation: bool,
    ) -> Result<String>;

    /// Delete a user. Deleting an unknown user is not an error.
    async fn delete_user(&self, user_id: &str) -> Result<()>;

    /// Revoke a trust. Revoking an unknown trust is not an error.
    async fn revoke_trust(&self, trust_id: &str) -> Result<()>;
}
