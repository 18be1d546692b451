//! Request context carried by every RPC into the conductor

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identity and scope of the caller, attached to every RPC envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Project (tenant) the request is scoped to
    pub project_id: String,
    /// Calling user
    pub user_id: String,
    /// Bearer token used for delegated calls into tenant services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Roles held by the caller in the scoped project
    #[serde(default)]
    pub roles: Vec<String>,
    /// Whether the caller holds an administrative role
    #[serde(default)]
    pub is_admin: bool,
    /// Admin-only flag widening list operations across tenants
    #[serde(default)]
    pub all_tenants: bool,
}

impl RequestContext {
    /// Create a plain tenant-scoped context
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Create an administrative context (used by internal tasks such as
    /// the poller, which act on entities across tenants)
    pub fn admin() -> Self {
        Self {
            project_id: String::new(),
            user_id: "corral-conductor".to_string(),
            is_admin: true,
            all_tenants: true,
            ..Default::default()
        }
    }

    /// Whether list operations may span tenants for this caller
    pub fn lists_all_tenants(&self) -> bool {
        self.is_admin && self.all_tenants
    }

    /// Check the caller may act on an entity owned by `project_id`.
    ///
    /// Admins may act on anything; tenants only within their own project.
    pub fn check_owns(&self, project_id: &str) -> Result<(), Error> {
        if self.is_admin || self.project_id == project_id {
            Ok(())
        } else {
            Err(Error::not_authorized(format!(
                "project {} may not act on resources of project {}",
                self.project_id, project_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_cannot_cross_projects() {
        let ctx = RequestContext::new("p1", "u1");
        assert!(ctx.check_owns("p1").is_ok());
        assert_eq!(ctx.check_owns("p2").unwrap_err().kind(), "NotAuthorized");
        assert!(!ctx.lists_all_tenants());
    }

    #[test]
    fn admin_spans_tenants() {
        let ctx = RequestContext::admin();
        assert!(ctx.check_owns("anything").is_ok());
        assert!(ctx.lists_all_tenants());
    }

    #[test]
    fn all_tenants_requires_admin() {
        let ctx = RequestContext {
            all_tenants: true,
            ..RequestContext::new("p1", "u1")
        };
        assert!(!ctx.lists_all_tenants());
    }
}
