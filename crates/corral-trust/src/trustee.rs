//! Trustee user and trust delegation lifecycle.
//!
//! Each cluster gets a dedicated identity-service user in the trustee
//! domain; a trust then delegates the caller's project roles to that
//! user so the cluster can call back into tenant APIs for its whole
//! lifetime, independent of the creating user's token.

use aws_lc_rs::rand;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tracing::warn;

use corral_cloud::IdentityClient;
use corral_common::config::TrustOpts;
use corral_common::{Error, RequestContext, Result};

/// Credentials minted for one cluster.
#[derive(Debug, Clone)]
pub struct TrusteeCredentials {
    pub username: String,
    pub user_id: String,
    pub password: String,
    pub trust_id: String,
}

fn random_suffix() -> Result<String> {
    let mut raw = [0u8; 6];
    rand::fill(&mut raw)
        .map_err(|_| Error::internal("trustee", "random generation failed"))?;
    Ok(raw.iter().map(|b| format!("{:02x}", b)).collect())
}

fn random_password() -> Result<String> {
    let mut raw = [0u8; 24];
    rand::fill(&mut raw)
        .map_err(|_| Error::internal("trustee", "random generation failed"))?;
    Ok(URL_SAFE_NO_PAD.encode(raw))
}

/// Create the trustee user, grant its roles, and establish the trust.
///
/// Partial failures roll back what was already created before the error
/// is surfaced, so a failed provisioning never leaks a trustee user.
pub async fn provision(
    identity: &dyn IdentityClient,
    ctx: &RequestContext,
    opts: &TrustOpts,
    cluster_uuid: &str,
) -> Result<TrusteeCredentials> {
    let username = format!("{}_{}", cluster_uuid, random_suffix()?);
    let password = random_password()?;

    let user_id = identity
        .create_user(&username, &password, &opts.trustee_domain_id)
        .await
        .map_err(|e| Error::trustee_failed(cluster_uuid, e.to_string()))?;

    let granted = async {
        for role in &opts.roles {
            identity.grant_role(&user_id, &ctx.project_id, role).await?;
        }
        identity
            .create_trust(ctx, &user_id, &opts.roles, opts.allow_impersonation)
            .await
    }
    .await;

    match granted {
        Ok(trust_id) => Ok(TrusteeCredentials {
            username,
            user_id,
            password,
            trust_id,
        }),
        Err(e) => {
            if let Err(cleanup) = identity.delete_user(&user_id).await {
                warn!(
                    cluster = %cluster_uuid,
                    user = %user_id,
                    error = %cleanup,
                    "failed to remove trustee user after provisioning error"
                );
            }
            Err(Error::trustee_failed(cluster_uuid, e.to_string()))
        }
    }
}

/// Revoke the trust and delete the trustee user.
///
/// Best-effort: failures are logged and swallowed so teardown can never
/// block a cluster deletion from completing.
pub async fn teardown(
    identity: &dyn IdentityClient,
    cluster_uuid: &str,
    trust_id: Option<&str>,
    trustee_user_id: Option<&str>,
) {
    if let Some(trust) = trust_id {
        if let Err(e) = identity.revoke_trust(trust).await {
            warn!(cluster = %cluster_uuid, trust = %trust, error = %e, "failed to revoke trust");
        }
    }
    if let Some(user) = trustee_user_id {
        if let Err(e) = identity.delete_user(user).await {
            warn!(cluster = %cluster_uuid, user = %user, error = %e, "failed to delete trustee user");
        }
    }
}
