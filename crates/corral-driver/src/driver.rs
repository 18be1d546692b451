//! The contract every backend driver implements.
//!
//! Submission is synchronous: a call returns once the engine has
//! accepted the work. Convergence is asynchronous and observed through
//! `poll_cluster`/`poll_nodegroup`, which return explicit status values
//! rather than raising on engine-side conditions.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use corral_common::status::{ClusterStatus, Coe, ServerType};
use corral_common::{Error, Result};
use corral_store::{Cluster, ClusterTemplate, NodeGroup};

/// Identity a driver registers under: the template triple that selects it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverDescriptor {
    pub server_type: ServerType,
    pub os_distro: String,
    pub coe: Coe,
}

impl DriverDescriptor {
    pub fn new(server_type: ServerType, os_distro: impl Into<String>, coe: Coe) -> Self {
        Self {
            server_type,
            os_distro: os_distro.into(),
            coe,
        }
    }

    /// The descriptor a template resolves to.
    pub fn of_template(template: &ClusterTemplate) -> Self {
        Self {
            server_type: template.server_type,
            os_distro: template.cluster_distro.clone(),
            coe: template.coe,
        }
    }
}

impl std::fmt::Display for DriverDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.server_type.as_str(),
            self.os_distro,
            self.coe
        )
    }
}

/// One supported (orchestrator version, container runtime version) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub coe_version: String,
    pub container_version: String,
}

impl VersionEntry {
    pub fn new(coe_version: impl Into<String>, container_version: impl Into<String>) -> Self {
        Self {
            coe_version: coe_version.into(),
            container_version: container_version.into(),
        }
    }
}

/// Engine-side status of a stack (or reconciled manifest).
///
/// RESUME/SNAPSHOT/CHECK/ADOPT families are engine maintenance actions
/// with no dedicated service-side states; they map onto the UPDATE
/// family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    UpdateInProgress,
    UpdateComplete,
    UpdateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
    SnapshotInProgress,
    SnapshotComplete,
    SnapshotFailed,
    CheckInProgress,
    CheckComplete,
    CheckFailed,
    ResumeInProgress,
    ResumeComplete,
    ResumeFailed,
    AdoptInProgress,
    AdoptComplete,
    AdoptFailed,
    /// The engine no longer knows the stack. During DELETE this is
    /// success; in any other phase it means the stack vanished.
    Missing,
}

impl StackStatus {
    /// Map the engine status onto the service state machine.
    ///
    /// Returns None for [`StackStatus::Missing`], which has no direct
    /// service state; the poller decides what it means from context.
    pub fn to_cluster_status(self) -> Option<ClusterStatus> {
        use StackStatus::*;
        let mapped = match self {
            CreateInProgress => ClusterStatus::CreateInProgress,
            CreateComplete => ClusterStatus::CreateComplete,
            CreateFailed => ClusterStatus::CreateFailed,
            UpdateInProgress | SnapshotInProgress | CheckInProgress | ResumeInProgress
            | AdoptInProgress => ClusterStatus::UpdateInProgress,
            UpdateComplete | SnapshotComplete | CheckComplete | ResumeComplete | AdoptComplete => {
                ClusterStatus::UpdateComplete
            }
            UpdateFailed | SnapshotFailed | CheckFailed | ResumeFailed | AdoptFailed => {
                ClusterStatus::UpdateFailed
            }
            RollbackInProgress => ClusterStatus::RollbackInProgress,
            RollbackComplete => ClusterStatus::RollbackComplete,
            RollbackFailed => ClusterStatus::RollbackFailed,
            DeleteInProgress => ClusterStatus::DeleteInProgress,
            DeleteComplete => ClusterStatus::DeleteComplete,
            DeleteFailed => ClusterStatus::DeleteFailed,
            Missing => return None,
        };
        Some(mapped)
    }

    pub fn as_str(&self) -> &'static str {
        use StackStatus::*;
        match self {
            CreateInProgress => "CREATE_IN_PROGRESS",
            CreateComplete => "CREATE_COMPLETE",
            CreateFailed => "CREATE_FAILED",
            UpdateInProgress => "UPDATE_IN_PROGRESS",
            UpdateComplete => "UPDATE_COMPLETE",
            UpdateFailed => "UPDATE_FAILED",
            RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            RollbackComplete => "ROLLBACK_COMPLETE",
            RollbackFailed => "ROLLBACK_FAILED",
            DeleteInProgress => "DELETE_IN_PROGRESS",
            DeleteComplete => "DELETE_COMPLETE",
            DeleteFailed => "DELETE_FAILED",
            SnapshotInProgress => "SNAPSHOT_IN_PROGRESS",
            SnapshotComplete => "SNAPSHOT_COMPLETE",
            SnapshotFailed => "SNAPSHOT_FAILED",
            CheckInProgress => "CHECK_IN_PROGRESS",
            CheckComplete => "CHECK_COMPLETE",
            CheckFailed => "CHECK_FAILED",
            ResumeInProgress => "RESUME_IN_PROGRESS",
            ResumeComplete => "RESUME_COMPLETE",
            ResumeFailed => "RESUME_FAILED",
            AdoptInProgress => "ADOPT_IN_PROGRESS",
            AdoptComplete => "ADOPT_COMPLETE",
            AdoptFailed => "ADOPT_FAILED",
            Missing => "MISSING",
        }
    }
}

impl FromStr for StackStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        use StackStatus::*;
        let status = match s {
            "CREATE_IN_PROGRESS" => CreateInProgress,
            "CREATE_COMPLETE" => CreateComplete,
            "CREATE_FAILED" => CreateFailed,
            "UPDATE_IN_PROGRESS" => UpdateInProgress,
            "UPDATE_COMPLETE" => UpdateComplete,
            "UPDATE_FAILED" => UpdateFailed,
            "ROLLBACK_IN_PROGRESS" => RollbackInProgress,
            "ROLLBACK_COMPLETE" => RollbackComplete,
            "ROLLBACK_FAILED" => RollbackFailed,
            "DELETE_IN_PROGRESS" => DeleteInProgress,
            "DELETE_COMPLETE" => DeleteComplete,
            "DELETE_FAILED" => DeleteFailed,
            "SNAPSHOT_IN_PROGRESS" => SnapshotInProgress,
            "SNAPSHOT_COMPLETE" => SnapshotComplete,
            "SNAPSHOT_FAILED" => SnapshotFailed,
            "CHECK_IN_PROGRESS" => CheckInProgress,
            "CHECK_COMPLETE" => CheckComplete,
            "CHECK_FAILED" => CheckFailed,
            "RESUME_IN_PROGRESS" => ResumeInProgress,
            "RESUME_COMPLETE" => ResumeComplete,
            "RESUME_FAILED" => ResumeFailed,
            "ADOPT_IN_PROGRESS" => AdoptInProgress,
            "ADOPT_COMPLETE" => AdoptComplete,
            "ADOPT_FAILED" => AdoptFailed,
            "MISSING" => Missing,
            other => {
                return Err(Error::internal(
                    "driver",
                    format!("unknown engine status '{}'", other),
                ))
            }
        };
        Ok(status)
    }
}

/// Output values the engine reports once (or while) a stack converges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutputs {
    pub api_address: Option<String>,
    pub master_addresses: Vec<String>,
    pub node_addresses: Vec<String>,
    pub discovery_url: Option<String>,
    pub coe_version: Option<String>,
    pub container_version: Option<String>,
}

/// One poll answer: status, human-readable reason, output values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackPoll {
    pub status: StackStatus,
    pub reason: Option<String>,
    pub outputs: StackOutputs,
}

impl StackPoll {
    pub fn new(status: StackStatus) -> Self {
        Self {
            status,
            reason: None,
            outputs: StackOutputs::default(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_outputs(mut self, outputs: StackOutputs) -> Self {
        self.outputs = outputs;
        self
    }
}

impl Default for StackStatus {
    fn default() -> Self {
        StackStatus::CreateInProgress
    }
}

/// Advisory source for which nodes carry non-daemonset workload.
///
/// Scale-down consults it to de-prioritize busy nodes; it is never
/// authoritative and failures degrade to "no advice".
#[async_trait]
pub trait ScaleManager: Send + Sync {
    async fn nodes_with_workload(&self, cluster_uuid: &str) -> Result<Vec<String>>;
}

/// Scale manager that offers no advice.
pub struct NoopScaleManager;

#[async_trait]
impl ScaleManager for NoopScaleManager {
    async fn nodes_with_workload(&self, _cluster_uuid: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A backend capable of materializing clusters.
///
/// All mutating calls submit work and return; `poll_*` observes
/// convergence. Engine "conflict" surfaces as `OperationInProgress`;
/// engine "not found" during delete is success and must not error.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registry name, also usable as a template's explicit `driver` value.
    fn name(&self) -> &str;

    /// Template triples this driver serves.
    fn descriptors(&self) -> Vec<DriverDescriptor>;

    /// Supported (coe_version, container_version) matrix.
    fn supported_versions(&self) -> Vec<VersionEntry>;

    /// Whether a failed update can roll back engine-side. Drivers
    /// without rollback fail updates directly.
    fn supports_rollback(&self) -> bool {
        false
    }

    /// Submit cluster creation; returns the engine stack id.
    async fn create_cluster(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroups: &[NodeGroup],
        timeout: Duration,
    ) -> Result<String>;

    /// Submit a cluster mutation reflecting the entity rows as desired state.
    async fn update_cluster(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroups: &[NodeGroup],
        rollback: bool,
    ) -> Result<()>;

    /// Submit a resize of one node group.
    async fn resize_cluster(
        &self,
        cluster: &Cluster,
        nodegroup: &NodeGroup,
        node_count: u32,
        nodes_to_remove: &[String],
        scale_manager: &dyn ScaleManager,
    ) -> Result<()>;

    /// Submit an upgrade towards a newer template.
    async fn upgrade_cluster(
        &self,
        cluster: &Cluster,
        new_template: &ClusterTemplate,
        max_batch_size: u32,
        nodegroup: &NodeGroup,
    ) -> Result<()>;

    /// Submit cluster deletion. Unknown stacks are already-deleted.
    async fn delete_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Submit creation of a non-default node group. Returns the node
    /// group's own stack id when the backend gives it one.
    async fn create_nodegroup(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroup: &NodeGroup,
    ) -> Result<Option<String>>;

    /// Submit a node-group mutation.
    async fn update_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<()>;

    /// Submit node-group deletion.
    async fn delete_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<()>;

    /// Ask the engine for the cluster stack's status and outputs.
    async fn poll_cluster(&self, cluster: &Cluster) -> Result<StackPoll>;

    /// Ask the engine for a node group's status and outputs.
    async fn poll_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<StackPoll>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_actions_map_to_update_family() {
        assert_eq!(
            StackStatus::SnapshotComplete.to_cluster_status(),
            Some(ClusterStatus::UpdateComplete)
        );
        assert_eq!(
            StackStatus::CheckFailed.to_cluster_status(),
            Some(ClusterStatus::UpdateFailed)
        );
        assert_eq!(
            StackStatus::ResumeInProgress.to_cluster_status(),
            Some(ClusterStatus::UpdateInProgress)
        );
        assert_eq!(
            StackStatus::AdoptComplete.to_cluster_status(),
            Some(ClusterStatus::UpdateComplete)
        );
    }

    #[test]
    fn direct_families_map_one_to_one() {
        assert_eq!(
            StackStatus::CreateComplete.to_cluster_status(),
            Some(ClusterStatus::CreateComplete)
        );
        assert_eq!(
            StackStatus::RollbackInProgress.to_cluster_status(),
            Some(ClusterStatus::RollbackInProgress)
        );
        assert_eq!(
            StackStatus::DeleteFailed.to_cluster_status(),
            Some(ClusterStatus::DeleteFailed)
        );
    }

    #[test]
    fn missing_has_no_direct_mapping() {
        assert_eq!(StackStatus::Missing.to_cluster_status(), None);
    }

    #[test]
    fn wire_round_trip() {
        for status in [
            StackStatus::CreateInProgress,
            StackStatus::SnapshotFailed,
            StackStatus::Missing,
        ] {
            assert_eq!(status.as_str().parse::<StackStatus>().unwrap(), status);
        }
    }

    #[test]
    fn descriptor_display() {
        let d = DriverDescriptor::new(ServerType::Vm, "fedora-coreos", Coe::Kubernetes);
        assert_eq!(d.to_string(), "(vm, fedora-coreos, kubernetes)");
    }
}
