//! List-operation parameters: pagination, sorting, and per-entity filters.

use corral_common::status::{ClusterStatus, NodeGroupRole};
use corral_common::Error;

/// Sort direction for list operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// Common pagination and sorting parameters accepted by every list
/// operation. `marker` paginates after the row with that uuid.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub limit: Option<u64>,
    pub marker: Option<String>,
    pub sort_key: Option<String>,
    pub sort_dir: SortDir,
}

impl ListQuery {
    /// Resolve the sort key against an entity's allowed set.
    ///
    /// Sorting by an unknown key is an input error, not a silent default.
    pub(crate) fn sort_column(&self, allowed: &[&'static str]) -> Result<&'static str, Error> {
        match &self.sort_key {
            None => Ok("created_at"),
            Some(key) => allowed
                .iter()
                .find(|candidate| **candidate == key.as_str())
                .copied()
                .ok_or_else(|| {
                    Error::invalid_field("sort_key", format!("cannot sort by '{}'", key))
                }),
        }
    }
}

/// Recognized filters for cluster listing.
#[derive(Debug, Clone, Default)]
pub struct ClusterFilters {
    pub name: Option<String>,
    pub cluster_template_id: Option<String>,
    /// Worker node total across the cluster's node groups
    pub node_count: Option<u32>,
    /// Master node total across the cluster's node groups
    pub master_count: Option<u32>,
    /// Single value or set
    pub status: Vec<ClusterStatus>,
    pub project_id: Option<String>,
}

/// Recognized filters for template listing.
#[derive(Debug, Clone, Default)]
pub struct TemplateFilters {
    pub name: Option<String>,
    pub image_id: Option<String>,
    pub project_id: Option<String>,
    pub public: Option<bool>,
    pub hidden: Option<bool>,
}

/// Recognized filters for node-group listing.
#[derive(Debug, Clone, Default)]
pub struct NodeGroupFilters {
    pub name: Option<String>,
    pub role: Option<NodeGroupRole>,
    pub flavor_id: Option<String>,
    pub node_count: Option<u32>,
    pub status: Option<ClusterStatus>,
}

/// Recognized filters for keypair listing.
#[derive(Debug, Clone, Default)]
pub struct X509Filters {
    pub cluster_uuid: Option<String>,
    pub name: Option<String>,
    pub project_id: Option<String>,
}

/// Recognized filters for quota listing.
#[derive(Debug, Clone, Default)]
pub struct QuotaFilters {
    pub project_id: Option<String>,
    pub resource: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOWED: &[&str] = &["uuid", "name", "created_at", "status"];

    #[test]
    fn default_sort_is_created_at() {
        let q = ListQuery::default();
        assert_eq!(q.sort_column(ALLOWED).unwrap(), "created_at");
    }

    #[test]
    fn known_sort_key_passes() {
        let q = ListQuery {
            sort_key: Some("status".into()),
            ..Default::default()
        };
        assert_eq!(q.sort_column(ALLOWED).unwrap(), "status");
    }

    #[test]
    fn unknown_sort_key_is_invalid_parameter() {
        let q = ListQuery {
            sort_key: Some("trustee_password".into()),
            ..Default::default()
        };
        let err = q.sort_column(ALLOWED).unwrap_err();
        assert_eq!(err.kind(), "InvalidParameter");
    }
}
