//! Stack-engine driver.
//!
//! Shapes a cluster's entity rows into an engine parameter map, submits
//! stack operations, and answers polls. Default node groups share the
//! cluster stack; non-default node groups get stacks of their own.
//!
//! The engine can roll a failed update back to the previous shape, so
//! this driver reports rollback support.

pub mod engine;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use corral_common::status::{Coe, NodeGroupRole, ServerType};
use corral_common::{Error, Result};
use corral_store::{Cluster, ClusterTemplate, NodeGroup};

use crate::driver::{
    Driver, DriverDescriptor, ScaleManager, StackPoll, VersionEntry,
};
use crate::scale::select_nodes_for_removal;
use engine::{StackEngine, StackParameters};

/// Driver backed by an infrastructure-stack engine.
pub struct StackDriver {
    name: String,
    engine: Arc<dyn StackEngine>,
    coe: Coe,
    descriptors: Vec<DriverDescriptor>,
    versions: Vec<VersionEntry>,
    stack_name_prefix: String,
}

impl StackDriver {
    /// Kubernetes-on-Fedora-CoreOS variant (vm and bm).
    pub fn kubernetes(engine: Arc<dyn StackEngine>, stack_name_prefix: impl Into<String>) -> Self {
        Self {
            name: "stack_k8s_coreos".to_string(),
            engine,
            coe: Coe::Kubernetes,
            descriptors: vec![
                DriverDescriptor::new(ServerType::Vm, "fedora-coreos", Coe::Kubernetes),
                DriverDescriptor::new(ServerType::Bm, "fedora-coreos", Coe::Kubernetes),
            ],
            versions: vec![
                VersionEntry::new("v1.29.7", "1.7.20"),
                VersionEntry::new("v1.30.2", "1.7.20"),
                VersionEntry::new("v1.31.0", "2.0.0"),
            ],
            stack_name_prefix: stack_name_prefix.into(),
        }
    }

    /// Docker Swarm variant.
    pub fn swarm(engine: Arc<dyn StackEngine>, stack_name_prefix: impl Into<String>) -> Self {
        Self {
            name: "stack_swarm".to_string(),
            engine,
            coe: Coe::Swarm,
            descriptors: vec![DriverDescriptor::new(
                ServerType::Vm,
                "fedora-coreos",
                Coe::Swarm,
            )],
            versions: vec![VersionEntry::new("1.2.6", "1.7.20")],
            stack_name_prefix: stack_name_prefix.into(),
        }
    }

    fn stack_name(&self, cluster: &Cluster, nodegroup: Option<&NodeGroup>) -> String {
        // Short uuid suffix keeps engine names unique across tenants
        // that reuse cluster names.
        let short = &cluster.uuid[..8.min(cluster.uuid.len())];
        match nodegroup {
            None => format!("{}{}-{}", self.stack_name_prefix, cluster.name, short),
            Some(ng) => format!(
                "{}{}-{}-{}",
                self.stack_name_prefix, cluster.name, short, ng.name
            ),
        }
    }

    fn cluster_stack_id<'a>(&self, cluster: &'a Cluster) -> Result<&'a str> {
        cluster
            .stack_id
            .as_deref()
            .ok_or_else(|| Error::internal("stack-driver", "cluster has no stack id"))
    }

    fn nodegroup_stack_id<'a>(
        &self,
        cluster: &'a Cluster,
        nodegroup: &'a NodeGroup,
    ) -> Result<&'a str> {
        nodegroup
            .stack_id
            .as_deref()
            .or(cluster.stack_id.as_deref())
            .ok_or_else(|| Error::internal("stack-driver", "node group has no stack id"))
    }

    /// Engine NotFound on delete means already-deleted.
    fn swallow_not_found(result: Result<()>) -> Result<()> {
        match result {
            Err(Error::NotFound { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Build the engine parameter map for a cluster.
///
/// Counts are summed per role over the node groups being materialized;
/// template shape flows through as-is.
pub fn build_stack_parameters(
    cluster: &Cluster,
    template: &ClusterTemplate,
    nodegroups: &[NodeGroup],
) -> StackParameters {
    let master_count: u32 = nodegroups
        .iter()
        .filter(|ng| ng.role == NodeGroupRole::Master)
        .map(|ng| ng.node_count)
        .sum();
    let node_count: u32 = nodegroups
        .iter()
        .filter(|ng| ng.role == NodeGroupRole::Worker)
        .map(|ng| ng.node_count)
        .sum();

    let mut params = StackParameters::new();
    params.insert("cluster_uuid".into(), serde_json::json!(cluster.uuid));
    params.insert("coe".into(), serde_json::json!(template.coe.as_str()));
    params.insert("image".into(), serde_json::json!(template.image_ref));
    params.insert("master_count".into(), serde_json::json!(master_count));
    params.insert("node_count".into(), serde_json::json!(node_count));
    params.insert(
        "master_flavor".into(),
        serde_json::json!(cluster.master_flavor_id),
    );
    params.insert("node_flavor".into(), serde_json::json!(cluster.flavor_id));
    params.insert("keypair".into(), serde_json::json!(cluster.keypair));
    params.insert(
        "external_network".into(),
        serde_json::json!(template.external_network),
    );
    params.insert(
        "fixed_network".into(),
        serde_json::json!(cluster.fixed_network),
    );
    params.insert(
        "fixed_subnet".into(),
        serde_json::json!(cluster.fixed_subnet),
    );
    params.insert(
        "dns_nameserver".into(),
        serde_json::json!(template.dns_nameserver),
    );
    params.insert(
        "docker_volume_size".into(),
        serde_json::json!(cluster.docker_volume_size),
    );
    params.insert(
        "docker_storage_driver".into(),
        serde_json::json!(template.docker_storage_driver),
    );
    params.insert(
        "master_lb_enabled".into(),
        serde_json::json!(cluster.master_lb_enabled),
    );
    params.insert(
        "floating_ip_enabled".into(),
        serde_json::json!(cluster.floating_ip_enabled),
    );
    params.insert(
        "tls_disabled".into(),
        serde_json::json!(template.tls_disabled),
    );
    params.insert(
        "registry_enabled".into(),
        serde_json::json!(template.registry_enabled),
    );
    params.insert("labels".into(), serde_json::json!(cluster.labels));
    params.insert("http_proxy".into(), serde_json::json!(template.http_proxy));
    params.insert(
        "https_proxy".into(),
        serde_json::json!(template.https_proxy),
    );
    params.insert("no_proxy".into(), serde_json::json!(template.no_proxy));
    if let Some(version) = cluster.labels.get("coe_version") {
        params.insert("coe_version".into(), serde_json::json!(version));
    }
    params
}

fn nodegroup_parameters(cluster: &Cluster, nodegroup: &NodeGroup) -> StackParameters {
    let mut params = StackParameters::new();
    params.insert("cluster_uuid".into(), serde_json::json!(cluster.uuid));
    params.insert("nodegroup".into(), serde_json::json!(nodegroup.name));
    params.insert("role".into(), serde_json::json!(nodegroup.role.as_str()));
    params.insert(
        "node_count".into(),
        serde_json::json!(nodegroup.node_count),
    );
    params.insert(
        "node_flavor".into(),
        serde_json::json!(nodegroup.flavor_id),
    );
    params.insert("image".into(), serde_json::json!(nodegroup.image_id));
    params.insert("labels".into(), serde_json::json!(nodegroup.labels));
    params
}

#[async_trait]
impl Driver for StackDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.descriptors.clone()
    }

    fn supported_versions(&self) -> Vec<VersionEntry> {
        self.versions.clone()
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn create_cluster(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroups: &[NodeGroup],
        timeout: Duration,
    ) -> Result<String> {
        let parameters = build_stack_parameters(cluster, template, nodegroups);
        let name = self.stack_name(cluster, None);
        let stack_id = self.engine.create_stack(&name, &parameters, timeout).await?;
        debug!(cluster = %cluster.uuid, stack = %stack_id, name = %name, "submitted cluster stack");
        Ok(stack_id)
    }

    async fn update_cluster(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroups: &[NodeGroup],
        rollback: bool,
    ) -> Result<()> {
        let stack_id = self.cluster_stack_id(cluster)?;
        let parameters = build_stack_parameters(cluster, template, nodegroups);
        self.engine.update_stack(stack_id, &parameters, rollback).await
    }

    async fn resize_cluster(
        &self,
        cluster: &Cluster,
        nodegroup: &NodeGroup,
        node_count: u32,
        nodes_to_remove: &[String],
        scale_manager: &dyn ScaleManager,
    ) -> Result<()> {
        let stack_id = self.nodegroup_stack_id(cluster, nodegroup)?;

        let busy: HashSet<String> = match scale_manager.nodes_with_workload(&cluster.uuid).await {
            Ok(nodes) => nodes.into_iter().collect(),
            Err(e) => {
                // Advisory only: resize proceeds without placement advice
                warn!(cluster = %cluster.uuid, error = %e, "scale manager unavailable");
                HashSet::new()
            }
        };
        let removal = select_nodes_for_removal(
            &nodegroup.node_addresses,
            node_count,
            nodes_to_remove,
            &busy,
        );

        let mut parameters = nodegroup_parameters(cluster, nodegroup);
        parameters.insert("node_count".into(), serde_json::json!(node_count));
        parameters.insert("nodes_to_remove".into(), serde_json::json!(removal));
        self.engine.update_stack(stack_id, &parameters, false).await
    }

    async fn upgrade_cluster(
        &self,
        cluster: &Cluster,
        new_template: &ClusterTemplate,
        max_batch_size: u32,
        nodegroup: &NodeGroup,
    ) -> Result<()> {
        if new_template.coe != self.coe {
            return Err(Error::not_supported(format!(
                "template coe {} does not match driver {}",
                new_template.coe, self.name
            )));
        }
        let stack_id = self.nodegroup_stack_id(cluster, nodegroup)?;
        let mut parameters = nodegroup_parameters(cluster, nodegroup);
        parameters.insert("image".into(), serde_json::json!(new_template.image_ref));
        parameters.insert(
            "max_batch_size".into(),
            serde_json::json!(max_batch_size.max(1)),
        );
        if let Some(version) = new_template.labels.get("coe_version") {
            parameters.insert("coe_version".into(), serde_json::json!(version));
        }
        self.engine.update_stack(stack_id, &parameters, false).await
    }

    async fn delete_cluster(&self, cluster: &Cluster) -> Result<()> {
        match cluster.stack_id.as_deref() {
            // Never submitted to the engine; nothing to tear down there
            None => Ok(()),
            Some(stack_id) => Self::swallow_not_found(self.engine.delete_stack(stack_id).await),
        }
    }

    async fn create_nodegroup(
        &self,
        cluster: &Cluster,
        _template: &ClusterTemplate,
        nodegroup: &NodeGroup,
    ) -> Result<Option<String>> {
        let parameters = nodegroup_parameters(cluster, nodegroup);
        let name = self.stack_name(cluster, Some(nodegroup));
        let stack_id = self
            .engine
            .create_stack(&name, &parameters, Duration::from_secs(3600))
            .await?;
        Ok(Some(stack_id))
    }

    async fn update_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<()> {
        let stack_id = self.nodegroup_stack_id(cluster, nodegroup)?;
        let parameters = nodegroup_parameters(cluster, nodegroup);
        self.engine.update_stack(stack_id, &parameters, false).await
    }

    async fn delete_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<()> {
        match nodegroup.stack_id.as_deref() {
            None => Ok(()),
            // A node group sharing the cluster stack is removed by a
            // cluster-stack update, not a stack delete.
            Some(stack_id) if Some(stack_id) == cluster.stack_id.as_deref() => {
                let parameters = nodegroup_parameters(cluster, nodegroup);
                self.engine.update_stack(stack_id, &parameters, false).await
            }
            Some(stack_id) => Self::swallow_not_found(self.engine.delete_stack(stack_id).await),
        }
    }

    async fn poll_cluster(&self, cluster: &Cluster) -> Result<StackPoll> {
        let stack_id = self.cluster_stack_id(cluster)?;
        self.engine.get_stack(stack_id).await
    }

    async fn poll_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<StackPoll> {
        let stack_id = self.nodegroup_stack_id(cluster, nodegroup)?;
        self.engine.get_stack(stack_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{NoopScaleManager, StackStatus};
    use super::engine::InMemoryStackEngine;

    fn fixtures() -> (ClusterTemplate, Cluster, Vec<NodeGroup>) {
        let mut template = ClusterTemplate::new(
            "kT",
            "p1",
            "u1",
            "fcos-1",
            "fedora-coreos",
            Coe::Kubernetes,
        );
        template.flavor = Some("m1.small".into());
        template.external_network = Some("public".into());
        let cluster = Cluster::new("k1", "p1", "u1", &template, 60);
        let mut master = NodeGroup::new(&cluster, "default-master", NodeGroupRole::Master, 1);
        master.is_default = true;
        let mut worker = NodeGroup::new(&cluster, "default-worker", NodeGroupRole::Worker, 2);
        worker.is_default = true;
        (template, cluster, vec![master, worker])
    }

    #[tokio::test]
    async fn create_submits_stack_with_counts() {
        let engine = Arc::new(InMemoryStackEngine::new(1));
        let driver = StackDriver::kubernetes(engine.clone(), "corral-");
        let (template, mut cluster, nodegroups) = fixtures();

        let stack_id = driver
            .create_cluster(&cluster, &template, &nodegroups, Duration::from_secs(3600))
            .await
            .unwrap();
        cluster.stack_id = Some(stack_id.clone());

        let name = engine.stack_name(&stack_id).unwrap();
        assert!(name.starts_with("corral-k1-"));

        let poll = driver.poll_cluster(&cluster).await.unwrap();
        assert_eq!(poll.status, StackStatus::CreateComplete);
        assert_eq!(poll.outputs.node_addresses.len(), 2);
        assert_eq!(poll.outputs.master_addresses.len(), 1);
    }

    #[tokio::test]
    async fn delete_of_unknown_stack_is_success() {
        let engine = Arc::new(InMemoryStackEngine::new(1));
        let driver = StackDriver::kubernetes(engine, "corral-");
        let (_, mut cluster, _) = fixtures();
        cluster.stack_id = Some("ghost".into());
        driver.delete_cluster(&cluster).await.unwrap();

        // No stack id at all (creation failed before submit)
        cluster.stack_id = None;
        driver.delete_cluster(&cluster).await.unwrap();
    }

    #[tokio::test]
    async fn delete_conflict_surfaces_operation_in_progress() {
        let engine = Arc::new(InMemoryStackEngine::new(1));
        let driver = StackDriver::kubernetes(engine.clone(), "corral-");
        let (template, mut cluster, nodegroups) = fixtures();
        let stack_id = driver
            .create_cluster(&cluster, &template, &nodegroups, Duration::from_secs(3600))
            .await
            .unwrap();
        cluster.stack_id = Some(stack_id);

        *engine.conflict_on_delete.lock().unwrap() = true;
        let err = driver.delete_cluster(&cluster).await.unwrap_err();
        assert_eq!(err.kind(), "OperationInProgress");
    }

    #[tokio::test]
    async fn resize_passes_removal_candidates() {
        let engine = Arc::new(InMemoryStackEngine::new(1));
        let driver = StackDriver::kubernetes(engine.clone(), "corral-");
        let (template, mut cluster, mut nodegroups) = fixtures();
        let stack_id = driver
            .create_cluster(&cluster, &template, &nodegroups, Duration::from_secs(3600))
            .await
            .unwrap();
        cluster.stack_id = Some(stack_id.clone());

        let worker = &mut nodegroups[1];
        worker.stack_id = Some(stack_id);
        worker.node_addresses = vec!["10.0.0.100".into(), "10.0.0.101".into()];
        driver
            .resize_cluster(&cluster, worker, 1, &["10.0.0.100".to_string()], &NoopScaleManager)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nondefault_nodegroup_gets_own_stack() {
        let engine = Arc::new(InMemoryStackEngine::new(1));
        let driver = StackDriver::kubernetes(engine.clone(), "corral-");
        let (template, mut cluster, nodegroups) = fixtures();
        let stack_id = driver
            .create_cluster(&cluster, &template, &nodegroups, Duration::from_secs(3600))
            .await
            .unwrap();
        cluster.stack_id = Some(stack_id);

        let mut extra = NodeGroup::new(&cluster, "gpu-pool", NodeGroupRole::Worker, 2);
        let ng_stack = driver
            .create_nodegroup(&cluster, &template, &extra)
            .await
            .unwrap()
            .expect("own stack");
        assert_ne!(Some(&ng_stack), cluster.stack_id.as_ref());
        extra.stack_id = Some(ng_stack);
        assert_eq!(engine.stack_count(), 2);

        driver.delete_nodegroup(&cluster, &extra).await.unwrap();
        let poll = driver.poll_nodegroup(&cluster, &extra).await.unwrap();
        assert_eq!(poll.status, StackStatus::DeleteComplete);
    }

    #[tokio::test]
    async fn resize_forwards_selection_to_engine() {
        use crate::stack::engine::MockStackEngine;

        let mut mock = MockStackEngine::new();
        mock.expect_update_stack()
            .withf(|stack_id, parameters, rollback| {
                let removal = parameters
                    .get("nodes_to_remove")
                    .and_then(|v| v.as_array())
                    .map(|candidates| candidates.len())
                    .unwrap_or(0);
                stack_id == "s1" && !*rollback && removal == 1
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let driver = StackDriver::kubernetes(Arc::new(mock), "corral-");
        let (_, mut cluster, mut nodegroups) = fixtures();
        cluster.stack_id = Some("s1".into());
        let worker = &mut nodegroups[1];
        worker.stack_id = Some("s1".into());
        worker.node_addresses = vec!["10.0.0.100".into(), "10.0.0.101".into()];

        driver
            .resize_cluster(&cluster, worker, 1, &[], &NoopScaleManager)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_maps_engine_not_found_to_success() {
        use crate::stack::engine::MockStackEngine;

        let mut mock = MockStackEngine::new();
        mock.expect_delete_stack()
            .times(1)
            .returning(|stack_id| Err(Error::not_found("Stack", stack_id)));

        let driver = StackDriver::kubernetes(Arc::new(mock), "corral-");
        let (_, mut cluster, _) = fixtures();
        cluster.stack_id = Some("vanished".into());
        driver.delete_cluster(&cluster).await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_rejects_mismatched_coe() {
        let engine = Arc::new(InMemoryStackEngine::new(1));
        let driver = StackDriver::kubernetes(engine, "corral-");
        let (_, mut cluster, nodegroups) = fixtures();
        cluster.stack_id = Some("s1".into());
        let swarm_template =
            ClusterTemplate::new("sT", "p1", "u1", "fcos-1", "fedora-coreos", Coe::Swarm);
        let err = driver
            .upgrade_cluster(&cluster, &swarm_template, 1, &nodegroups[1])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotSupported");
    }
}
