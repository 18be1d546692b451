//! Lifecycle status machine shared by clusters and node groups
//!
//! Both entities move through the same `<OP>_IN_PROGRESS -> <OP>_COMPLETE |
//! <OP>_FAILED` families. New work may only start from a `*_COMPLETE`
//! state, except deletion which may be initiated from any state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The four operation families a cluster or node group moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Initial provisioning
    Create,
    /// Any mutation of a live entity (update, resize, upgrade)
    Update,
    /// Engine-driven rollback of a failed update
    Rollback,
    /// Teardown
    Delete,
}

impl Operation {
    /// Upper-case wire name ("CREATE", ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Rollback => "ROLLBACK",
            Operation::Delete => "DELETE",
        }
    }
}

/// Lifecycle status of a cluster or node group.
///
/// `DELETE_COMPLETE` exists in the enum for driver/engine mapping but is
/// never observable in the store: the row is destroyed when deletion
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterStatus {
    /// Provisioning submitted, converging
    #[serde(rename = "CREATE_IN_PROGRESS")]
    CreateInProgress,
    /// Provisioning converged
    #[serde(rename = "CREATE_COMPLETE")]
    CreateComplete,
    /// Provisioning failed
    #[serde(rename = "CREATE_FAILED")]
    CreateFailed,
    /// Mutation submitted, converging
    #[serde(rename = "UPDATE_IN_PROGRESS")]
    UpdateInProgress,
    /// Mutation converged
    #[serde(rename = "UPDATE_COMPLETE")]
    UpdateComplete,
    /// Mutation failed
    #[serde(rename = "UPDATE_FAILED")]
    UpdateFailed,
    /// Engine rolling back a failed mutation
    #[serde(rename = "ROLLBACK_IN_PROGRESS")]
    RollbackInProgress,
    /// Rollback converged; entity is back on its previous shape
    #[serde(rename = "ROLLBACK_COMPLETE")]
    RollbackComplete,
    /// Rollback failed
    #[serde(rename = "ROLLBACK_FAILED")]
    RollbackFailed,
    /// Teardown submitted, converging
    #[serde(rename = "DELETE_IN_PROGRESS")]
    DeleteInProgress,
    /// Teardown converged (row is destroyed immediately after)
    #[serde(rename = "DELETE_COMPLETE")]
    DeleteComplete,
    /// Teardown failed
    #[serde(rename = "DELETE_FAILED")]
    DeleteFailed,
}

impl ClusterStatus {
    /// The in-progress status for an operation family
    pub fn in_progress(op: Operation) -> Self {
        match op {
            Operation::Create => ClusterStatus::CreateInProgress,
            Operation::Update => ClusterStatus::UpdateInProgress,
            Operation::Rollback => ClusterStatus::RollbackInProgress,
            Operation::Delete => ClusterStatus::DeleteInProgress,
        }
    }

    /// The complete status for an operation family
    pub fn complete(op: Operation) -> Self {
        match op {
            Operation::Create => ClusterStatus::CreateComplete,
            Operation::Update => ClusterStatus::UpdateComplete,
            Operation::Rollback => ClusterStatus::RollbackComplete,
            Operation::Delete => ClusterStatus::DeleteComplete,
        }
    }

    /// The failed status for an operation family
    pub fn failed(op: Operation) -> Self {
        match op {
            Operation::Create => ClusterStatus::CreateFailed,
            Operation::Update => ClusterStatus::UpdateFailed,
            Operation::Rollback => ClusterStatus::RollbackFailed,
            Operation::Delete => ClusterStatus::DeleteFailed,
        }
    }

    /// Which operation family this status belongs to
    pub fn operation(&self) -> Operation {
        match self {
            ClusterStatus::CreateInProgress
            | ClusterStatus::CreateComplete
            | ClusterStatus::CreateFailed => Operation::Create,
            ClusterStatus::UpdateInProgress
            | ClusterStatus::UpdateComplete
            | ClusterStatus::UpdateFailed => Operation::Update,
            ClusterStatus::RollbackInProgress
            | ClusterStatus::RollbackComplete
            | ClusterStatus::RollbackFailed => Operation::Rollback,
            ClusterStatus::DeleteInProgress
            | ClusterStatus::DeleteComplete
            | ClusterStatus::DeleteFailed => Operation::Delete,
        }
    }

    /// True for any `*_IN_PROGRESS` status
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ClusterStatus::CreateInProgress
                | ClusterStatus::UpdateInProgress
                | ClusterStatus::RollbackInProgress
                | ClusterStatus::DeleteInProgress
        )
    }

    /// True for any `*_COMPLETE` status
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            ClusterStatus::CreateComplete
                | ClusterStatus::UpdateComplete
                | ClusterStatus::RollbackComplete
                | ClusterStatus::DeleteComplete
        )
    }

    /// True for any `*_FAILED` status
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ClusterStatus::CreateFailed
                | ClusterStatus::UpdateFailed
                | ClusterStatus::RollbackFailed
                | ClusterStatus::DeleteFailed
        )
    }

    /// True when no operation is converging (complete or failed)
    pub fn is_terminal(&self) -> bool {
        !self.is_in_progress()
    }

    /// Admission check for a new mutating operation.
    ///
    /// Updates (including resize and upgrade) are only allowed from a
    /// `*_COMPLETE` state. Deletion is allowed from any state; a second
    /// delete against `DELETE_IN_PROGRESS` is handled idempotently by the
    /// caller rather than rejected here.
    pub fn check_operation_allowed(&self, op: Operation) -> Result<(), Error> {
        match op {
            Operation::Delete => Ok(()),
            Operation::Create => Err(Error::not_supported(
                "entity already exists; create is not re-runnable",
            )),
            Operation::Update | Operation::Rollback => {
                if self.is_complete() {
                    Ok(())
                } else {
                    Err(Error::not_supported(format!(
                        "cluster in status {} cannot be updated; wait for a COMPLETE state",
                        self
                    )))
                }
            }
        }
    }

    /// Upper-snake wire form ("CREATE_IN_PROGRESS", ...)
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            ClusterStatus::CreateComplete => "CREATE_COMPLETE",
            ClusterStatus::CreateFailed => "CREATE_FAILED",
            ClusterStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            ClusterStatus::UpdateComplete => "UPDATE_COMPLETE",
            ClusterStatus::UpdateFailed => "UPDATE_FAILED",
            ClusterStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            ClusterStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            ClusterStatus::RollbackFailed => "ROLLBACK_FAILED",
            ClusterStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            ClusterStatus::DeleteComplete => "DELETE_COMPLETE",
            ClusterStatus::DeleteFailed => "DELETE_FAILED",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_IN_PROGRESS" => Ok(ClusterStatus::CreateInProgress),
            "CREATE_COMPLETE" => Ok(ClusterStatus::CreateComplete),
            "CREATE_FAILED" => Ok(ClusterStatus::CreateFailed),
            "UPDATE_IN_PROGRESS" => Ok(ClusterStatus::UpdateInProgress),
            "UPDATE_COMPLETE" => Ok(ClusterStatus::UpdateComplete),
            "UPDATE_FAILED" => Ok(ClusterStatus::UpdateFailed),
            "ROLLBACK_IN_PROGRESS" => Ok(ClusterStatus::RollbackInProgress),
            "ROLLBACK_COMPLETE" => Ok(ClusterStatus::RollbackComplete),
            "ROLLBACK_FAILED" => Ok(ClusterStatus::RollbackFailed),
            "DELETE_IN_PROGRESS" => Ok(ClusterStatus::DeleteInProgress),
            "DELETE_COMPLETE" => Ok(ClusterStatus::DeleteComplete),
            "DELETE_FAILED" => Ok(ClusterStatus::DeleteFailed),
            other => Err(Error::invalid_parameter(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

/// Observed health of a running cluster, orthogonal to lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All control-plane and worker probes passing
    #[serde(rename = "HEALTHY")]
    Healthy,
    /// At least one probe failing
    #[serde(rename = "UNHEALTHY")]
    Unhealthy,
    /// Not enough data (default for new clusters)
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl HealthStatus {
    /// Upper-case wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HEALTHY" => Ok(HealthStatus::Healthy),
            "UNHEALTHY" => Ok(HealthStatus::Unhealthy),
            "UNKNOWN" => Ok(HealthStatus::Unknown),
            other => Err(Error::invalid_parameter(format!(
                "unknown health status '{}'",
                other
            ))),
        }
    }
}

/// Role of a node group within its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeGroupRole {
    /// Control-plane nodes
    Master,
    /// Workload nodes
    Worker,
}

impl NodeGroupRole {
    /// Lower-case wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeGroupRole::Master => "master",
            NodeGroupRole::Worker => "worker",
        }
    }
}

impl FromStr for NodeGroupRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(NodeGroupRole::Master),
            "worker" => Ok(NodeGroupRole::Worker),
            other => Err(Error::invalid_parameter(format!(
                "unknown node group role '{}'",
                other
            ))),
        }
    }
}

/// Container orchestration engine kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coe {
    /// Kubernetes
    Kubernetes,
    /// Docker Swarm
    Swarm,
    /// Apache Mesos
    Mesos,
}

impl Coe {
    /// Lower-case wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            Coe::Kubernetes => "kubernetes",
            Coe::Swarm => "swarm",
            Coe::Mesos => "mesos",
        }
    }
}

impl FromStr for Coe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" | "k8s" => Ok(Coe::Kubernetes),
            "swarm" => Ok(Coe::Swarm),
            "mesos" => Ok(Coe::Mesos),
            other => Err(Error::invalid_parameter(format!("unknown coe '{}'", other))),
        }
    }
}

impl fmt::Display for Coe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a template provisions virtual machines or bare metal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Virtual machines
    Vm,
    /// Bare metal
    Bm,
}

impl ServerType {
    /// Lower-case wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Vm => "vm",
            ServerType::Bm => "bm",
        }
    }
}

impl FromStr for ServerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" => Ok(ServerType::Vm),
            "bm" => Ok(ServerType::Bm),
            other => Err(Error::invalid_parameter(format!(
                "unknown server type '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_round_trips() {
        for s in [
            ClusterStatus::CreateInProgress,
            ClusterStatus::UpdateFailed,
            ClusterStatus::RollbackComplete,
            ClusterStatus::DeleteInProgress,
        ] {
            assert_eq!(s.as_str().parse::<ClusterStatus>().unwrap(), s);
        }
        assert!("BOGUS".parse::<ClusterStatus>().is_err());
    }

    #[test]
    fn update_only_from_complete_states() {
        assert!(ClusterStatus::CreateComplete
            .check_operation_allowed(Operation::Update)
            .is_ok());
        assert!(ClusterStatus::UpdateComplete
            .check_operation_allowed(Operation::Update)
            .is_ok());
        assert!(ClusterStatus::RollbackComplete
            .check_operation_allowed(Operation::Update)
            .is_ok());

        for s in [
            ClusterStatus::CreateInProgress,
            ClusterStatus::CreateFailed,
            ClusterStatus::UpdateInProgress,
            ClusterStatus::DeleteInProgress,
            ClusterStatus::DeleteFailed,
        ] {
            let err = s.check_operation_allowed(Operation::Update).unwrap_err();
            assert_eq!(err.kind(), "NotSupported");
        }
    }

    #[test]
    fn delete_allowed_from_any_state() {
        for s in [
            ClusterStatus::CreateInProgress,
            ClusterStatus::CreateFailed,
            ClusterStatus::UpdateInProgress,
            ClusterStatus::DeleteFailed,
            ClusterStatus::DeleteInProgress,
        ] {
            assert!(s.check_operation_allowed(Operation::Delete).is_ok());
        }
    }

    #[test]
    fn operation_families() {
        assert_eq!(
            ClusterStatus::RollbackFailed.operation(),
            Operation::Rollback
        );
        assert_eq!(
            ClusterStatus::failed(Operation::Delete),
            ClusterStatus::DeleteFailed
        );
        assert!(ClusterStatus::CreateFailed.is_terminal());
        assert!(!ClusterStatus::UpdateInProgress.is_terminal());
    }

    #[test]
    fn health_defaults_to_unknown() {
        assert_eq!(HealthStatus::default(), HealthStatus::Unknown);
    }

    #[test]
    fn coe_accepts_k8s_alias() {
        assert_eq!("k8s".parse::<Coe>().unwrap(), Coe::Kubernetes);
        assert_eq!("kubernetes".parse::<Coe>().unwrap(), Coe::Kubernetes);
    }
}
