//! Error types for the Corral conductor
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information like cluster uuids,
//! resource kinds, and underlying causes. The variant set doubles as the
//! fault taxonomy surfaced over RPC, so `kind()` is stable.

use thiserror::Error;

/// Main error type for Corral operations
#[derive(Debug, Error)]
pub enum Error {
    /// A request parameter is malformed, out of range, or immutable
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Description of what's invalid
        message: String,
        /// The offending field, when known (e.g. "node_count")
        field: Option<String>,
    },

    /// The caller is not allowed to perform the operation
    #[error("not authorized: {message}")]
    NotAuthorized {
        /// Description of the denied action
        message: String,
    },

    /// A referenced entity does not exist
    #[error("{resource} {id} could not be found")]
    NotFound {
        /// Entity kind (Cluster, ClusterTemplate, NodeGroup, ...)
        resource: &'static str,
        /// Identifier used in the lookup (uuid or name)
        id: String,
    },

    /// An entity with the same identity already exists
    #[error("{resource} {id} already exists")]
    AlreadyExists {
        /// Entity kind
        resource: &'static str,
        /// Conflicting identifier
        id: String,
    },

    /// An ambiguous lookup or concurrent modification
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict
        message: String,
    },

    /// The operation is not valid for the entity's current state
    #[error("operation not supported: {message}")]
    NotSupported {
        /// Description of the rejected operation
        message: String,
    },

    /// Another operation already holds the cluster
    #[error("cluster {cluster} is busy: {message}")]
    OperationInProgress {
        /// The contended cluster uuid
        cluster: String,
        /// Who or what holds it
        message: String,
    },

    /// A per-project quota would be exceeded
    #[error("quota exceeded for project {project}: {resource} limit is {limit}")]
    QuotaExceeded {
        /// Project whose quota was hit
        project: String,
        /// Quota resource name
        resource: String,
        /// The configured hard limit
        limit: i64,
    },

    /// Pre-deletion resource reclamation failed; the delete was not started
    #[error("pre-deletion reclamation failed for cluster {cluster}: {message}")]
    PreDeletionFailed {
        /// Cluster being deleted
        cluster: String,
        /// What could not be reclaimed and why
        message: String,
    },

    /// Trustee user or trust delegation could not be created
    #[error("trustee/trust creation failed for cluster {cluster}: {message}")]
    TrusteeOrTrustCreationFailed {
        /// Cluster the credentials were for
        cluster: String,
        /// Underlying identity-service failure
        message: String,
    },

    /// CA bundle or server certificate issuance failed
    #[error("certificate creation failed for cluster {cluster}: {message}")]
    CertificatesCreationFailed {
        /// Cluster the certificates were for
        cluster: String,
        /// Underlying PKI or secret-store failure
        message: String,
    },

    /// A cloud collaborator (identity, network, LB, secret store, engine)
    /// could not be reached
    #[error("external service unreachable [{service}]: {message}")]
    ExternalServiceUnreachable {
        /// Which collaborator failed
        service: &'static str,
        /// Transport-level detail
        message: String,
    },

    /// A cluster template still referenced by clusters cannot be destroyed
    #[error("cluster template {template} is referenced by existing clusters")]
    TemplateReferenced {
        /// The referenced template uuid
        template: String,
    },

    /// A cluster with dependent rows cannot be destroyed outside a cascade
    #[error("cluster {cluster} still has dependent node groups")]
    ClusterNotEmpty {
        /// The non-empty cluster uuid
        cluster: String,
    },

    /// Persistence-layer failure
    #[error("database error: {message}")]
    Database {
        /// Underlying driver error text
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where it happened (e.g. "poller", "conductor", "registry")
        context: String,
    },
}

impl Error {
    /// Create an invalid-parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: msg.into(),
            field: None,
        }
    }

    /// Create an invalid-parameter error naming the offending field
    pub fn invalid_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-authorized error
    pub fn not_authorized(msg: impl Into<String>) -> Self {
        Self::NotAuthorized {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given resource kind and id
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(resource: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource,
            id: id.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a not-supported error (state-machine violation)
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported {
            message: msg.into(),
        }
    }

    /// Create an operation-in-progress error
    pub fn operation_in_progress(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OperationInProgress {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a quota-exceeded error
    pub fn quota_exceeded(
        project: impl Into<String>,
        resource: impl Into<String>,
        limit: i64,
    ) -> Self {
        Self::QuotaExceeded {
            project: project.into(),
            resource: resource.into(),
            limit,
        }
    }

    /// Create a pre-deletion failure
    pub fn pre_deletion_failed(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PreDeletionFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a trustee/trust creation failure
    pub fn trustee_failed(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TrusteeOrTrustCreationFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a certificate creation failure
    pub fn certificates_failed(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertificatesCreationFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an external-service failure for the named collaborator
    pub fn external(service: &'static str, msg: impl Into<String>) -> Self {
        Self::ExternalServiceUnreachable {
            service,
            message: msg.into(),
        }
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Stable machine-readable kind, surfaced in RPC faults and
    /// notification payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidParameter { .. } => "InvalidParameter",
            Error::NotAuthorized { .. } => "NotAuthorized",
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::Conflict { .. } => "Conflict",
            Error::NotSupported { .. } => "NotSupported",
            Error::OperationInProgress { .. } => "OperationInProgress",
            Error::QuotaExceeded { .. } => "QuotaExceeded",
            Error::PreDeletionFailed { .. } => "PreDeletionFailed",
            Error::TrusteeOrTrustCreationFailed { .. } => "TrusteeOrTrustCreationFailed",
            Error::CertificatesCreationFailed { .. } => "CertificatesCreationFailed",
            Error::ExternalServiceUnreachable { .. } => "ExternalServiceUnreachable",
            Error::TemplateReferenced { .. } => "TemplateReferenced",
            Error::ClusterNotEmpty { .. } => "ClusterNotEmpty",
            Error::Database { .. } => "Database",
            Error::Internal { .. } => "Internal",
        }
    }

    /// Check if this error is retryable.
    ///
    /// Validation and state-machine errors require the caller to change
    /// the request. Transport and contention errors may clear on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::OperationInProgress { .. }
                | Error::ExternalServiceUnreachable { .. }
                | Error::Database { .. }
                | Error::Internal { .. }
        )
    }

    /// Get the cluster uuid if this error is tied to a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::OperationInProgress { cluster, .. }
            | Error::PreDeletionFailed { cluster, .. }
            | Error::TrusteeOrTrustCreationFailed { cluster, .. }
            | Error::CertificatesCreationFailed { cluster, .. }
            | Error::ClusterNotEmpty { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}
