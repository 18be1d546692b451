//! Management-cluster driver.
//!
//! Instead of a parameter map, this backend reconciles a declarative
//! cluster manifest applied to a management cluster. Resizes are pool
//! scalings; updates re-apply the manifest. The management cluster has
//! no rollback concept, so failed updates go straight to their failed
//! state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use corral_common::config::CapiDriverOpts;
use corral_common::status::{Coe, NodeGroupRole, ServerType};
use corral_common::{Error, Result};
use corral_store::{Cluster, ClusterTemplate, NodeGroup};

use crate::driver::{Driver, DriverDescriptor, ScaleManager, StackPoll, VersionEntry};

/// A declarative cluster manifest reconciled by the management cluster.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    pub spec: serde_json::Value,
}

/// Manifest metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestMetadata {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<std::collections::BTreeMap<String, String>>,
}

/// Operations the driver invokes on the management cluster.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Apply (create or update) a manifest; returns the object id used
    /// as the cluster's stack handle.
    async fn apply(&self, manifest: &ClusterManifest) -> Result<String>;

    /// Status of a reconciled object.
    async fn get(&self, object_id: &str) -> Result<StackPoll>;

    /// Scale one machine pool, optionally naming machines to delete first.
    async fn scale_pool(
        &self,
        object_id: &str,
        pool: &str,
        replicas: u32,
        nodes_to_remove: &[String],
    ) -> Result<()>;

    /// Delete the object and everything it owns.
    async fn delete(&self, object_id: &str) -> Result<()>;
}

/// Driver backed by a management cluster reconciling declarative specs.
pub struct CapiDriver {
    client: Arc<dyn ManagementClient>,
    opts: CapiDriverOpts,
    descriptors: Vec<DriverDescriptor>,
    versions: Vec<VersionEntry>,
}

impl CapiDriver {
    pub fn new(client: Arc<dyn ManagementClient>, opts: CapiDriverOpts) -> Self {
        Self {
            client,
            opts,
            descriptors: vec![
                DriverDescriptor::new(ServerType::Vm, "ubuntu", Coe::Kubernetes),
                DriverDescriptor::new(ServerType::Vm, "flatcar", Coe::Kubernetes),
            ],
            versions: vec![
                VersionEntry::new("v1.30.2", "1.7.20"),
                VersionEntry::new("v1.31.0", "2.0.0"),
                VersionEntry::new("v1.32.0", "2.0.4"),
            ],
        }
    }

    /// Shape the manifest the management cluster reconciles.
    pub fn build_manifest(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroups: &[NodeGroup],
    ) -> ClusterManifest {
        let control_plane_replicas: u32 = nodegroups
            .iter()
            .filter(|ng| ng.role == NodeGroupRole::Master)
            .map(|ng| ng.node_count)
            .sum();
        let pools: Vec<serde_json::Value> = nodegroups
            .iter()
            .filter(|ng| ng.role == NodeGroupRole::Worker)
            .map(|ng| {
                serde_json::json!({
                    "name": ng.name,
                    "replicas": ng.node_count,
                    "flavor": ng.flavor_id,
                    "image": ng.image_id.clone().unwrap_or_else(|| template.image_ref.clone()),
                    "labels": ng.labels,
                })
            })
            .collect();

        let labels = std::collections::BTreeMap::from([(
            "corral.io/owned-by".to_string(),
            self.opts.owner_label.clone(),
        )]);

        ClusterManifest {
            api_version: "corral.io/v1alpha1".to_string(),
            kind: "WorkloadCluster".to_string(),
            metadata: ManifestMetadata {
                name: cluster.uuid.clone(),
                namespace: self.opts.namespace.clone(),
                labels: Some(labels),
            },
            spec: serde_json::json!({
                "clusterName": cluster.name,
                "version": cluster.labels.get("coe_version"),
                "image": template.image_ref,
                "controlPlane": {
                    "replicas": control_plane_replicas,
                    "flavor": cluster.master_flavor_id,
                    "externalLoadBalancer": cluster.master_lb_enabled,
                },
                "pools": pools,
                "network": {
                    "external": template.external_network,
                    "fixed": cluster.fixed_network,
                    "subnet": cluster.fixed_subnet,
                    "floatingIp": cluster.floating_ip_enabled,
                },
            }),
        }
    }

    fn object_id<'a>(&self, cluster: &'a Cluster) -> Result<&'a str> {
        cluster
            .stack_id
            .as_deref()
            .ok_or_else(|| Error::internal("capi-driver", "cluster has no object id"))
    }
}

#[async_trait]
impl Driver for CapiDriver {
    fn name(&self) -> &str {
        "capi"
    }

    fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.descriptors.clone()
    }

    fn supported_versions(&self) -> Vec<VersionEntry> {
        self.versions.clone()
    }

    // Management clusters reconcile forward only.
    fn supports_rollback(&self) -> bool {
        false
    }

    async fn create_cluster(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroups: &[NodeGroup],
        _timeout: Duration,
    ) -> Result<String> {
        let manifest = self.build_manifest(cluster, template, nodegroups);
        let object_id = self.client.apply(&manifest).await?;
        debug!(cluster = %cluster.uuid, object = %object_id, "applied cluster manifest");
        Ok(object_id)
    }

    async fn update_cluster(
        &self,
        cluster: &Cluster,
        template: &ClusterTemplate,
        nodegroups: &[NodeGroup],
        _rollback: bool,
    ) -> Result<()> {
        // Re-applying the manifest is the whole update protocol here
        let manifest = self.build_manifest(cluster, template, nodegroups);
        self.client.apply(&manifest).await?;
        Ok(())
    }

    async fn resize_cluster(
        &self,
        cluster: &Cluster,
        nodegroup: &NodeGroup,
        node_count: u32,
        nodes_to_remove: &[String],
        _scale_manager: &dyn ScaleManager,
    ) -> Result<()> {
        let object_id = self.object_id(cluster)?;
        self.client
            .scale_pool(object_id, &nodegroup.name, node_count, nodes_to_remove)
            .await
    }

    async fn upgrade_cluster(
        &self,
        cluster: &Cluster,
        new_template: &ClusterTemplate,
        max_batch_size: u32,
        _nodegroup: &NodeGroup,
    ) -> Result<()> {
        let object_id = self.object_id(cluster)?;
        let manifest = ClusterManifest {
            api_version: "corral.io/v1alpha1".to_string(),
            kind: "WorkloadCluster".to_string(),
            metadata: ManifestMetadata {
                name: object_id.to_string(),
                namespace: self.opts.namespace.clone(),
                labels: None,
            },
            spec: serde_json::json!({
                "image": new_template.image_ref,
                "version": new_template.labels.get("coe_version"),
                "rollout": { "maxSurge": max_batch_size.max(1) },
            }),
        };
        self.client.apply(&manifest).await?;
        Ok(())
    }

    async fn delete_cluster(&self, cluster: &Cluster) -> Result<()> {
        match cluster.stack_id.as_deref() {
            None => Ok(()),
            Some(object_id) => match self.client.delete(object_id).await {
                Err(Error::NotFound { .. }) => Ok(()),
                other => other,
            },
        }
    }

    async fn create_nodegroup(
        &self,
        cluster: &Cluster,
        _template: &ClusterTemplate,
        nodegroup: &NodeGroup,
    ) -> Result<Option<String>> {
        let object_id = self.object_id(cluster)?;
        self.client
            .scale_pool(object_id, &nodegroup.name, nodegroup.node_count, &[])
            .await?;
        // Pools live inside the cluster object; no stack of their own
        Ok(None)
    }

    async fn update_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<()> {
        let object_id = self.object_id(cluster)?;
        self.client
            .scale_pool(object_id, &nodegroup.name, nodegroup.node_count, &[])
            .await
    }

    async fn delete_nodegroup(&self, cluster: &Cluster, nodegroup: &NodeGroup) -> Result<()> {
        let object_id = self.object_id(cluster)?;
        self.client
            .scale_pool(object_id, &nodegroup.name, 0, &[])
            .await
    }

    async fn poll_cluster(&self, cluster: &Cluster) -> Result<StackPoll> {
        let object_id = self.object_id(cluster)?;
        self.client.get(object_id).await
    }

    async fn poll_nodegroup(&self, cluster: &Cluster, _nodegroup: &NodeGroup) -> Result<StackPoll> {
        // Pool status is part of the cluster object's status
        let object_id = self.object_id(cluster)?;
        self.client.get(object_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::StackStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeManagement {
        applied: Mutex<Vec<ClusterManifest>>,
        scaled: Mutex<Vec<(String, String, u32, Vec<String>)>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ManagementClient for FakeManagement {
        async fn apply(&self, manifest: &ClusterManifest) -> Result<String> {
            self.applied.lock().unwrap().push(manifest.clone());
            Ok(format!("obj-{}", manifest.metadata.name))
        }

        async fn get(&self, _object_id: &str) -> Result<StackPoll> {
            Ok(StackPoll::new(StackStatus::CreateComplete))
        }

        async fn scale_pool(
            &self,
            object_id: &str,
            pool: &str,
            replicas: u32,
            nodes_to_remove: &[String],
        ) -> Result<()> {
            self.scaled.lock().unwrap().push((
                object_id.to_string(),
                pool.to_string(),
                replicas,
                nodes_to_remove.to_vec(),
            ));
            Ok(())
        }

        async fn delete(&self, object_id: &str) -> Result<()> {
            if object_id == "ghost" {
                return Err(Error::not_found("WorkloadCluster", object_id));
            }
            self.deleted.lock().unwrap().push(object_id.to_string());
            Ok(())
        }
    }

    fn fixtures() -> (ClusterTemplate, Cluster, Vec<NodeGroup>) {
        let template =
            ClusterTemplate::new("uT", "p1", "u1", "ubuntu-24.04", "ubuntu", Coe::Kubernetes);
        let cluster = Cluster::new("k1", "p1", "u1", &template, 60);
        let mut master = NodeGroup::new(&cluster, "default-master", NodeGroupRole::Master, 3);
        master.is_default = true;
        let mut worker = NodeGroup::new(&cluster, "default-worker", NodeGroupRole::Worker, 2);
        worker.is_default = true;
        (template, cluster, vec![master, worker])
    }

    #[tokio::test]
    async fn manifest_carries_pools_and_control_plane() {
        let client = Arc::new(FakeManagement::default());
        let driver = CapiDriver::new(client.clone(), CapiDriverOpts::default());
        let (template, cluster, nodegroups) = fixtures();

        let object_id = driver
            .create_cluster(&cluster, &template, &nodegroups, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(object_id, format!("obj-{}", cluster.uuid));

        let applied = client.applied.lock().unwrap();
        let manifest = &applied[0];
        assert_eq!(manifest.metadata.namespace, "corral-clusters");
        assert_eq!(manifest.spec["controlPlane"]["replicas"], 3);
        assert_eq!(manifest.spec["pools"][0]["replicas"], 2);
    }

    #[tokio::test]
    async fn resize_scales_named_pool() {
        let client = Arc::new(FakeManagement::default());
        let driver = CapiDriver::new(client.clone(), CapiDriverOpts::default());
        let (_, mut cluster, nodegroups) = fixtures();
        cluster.stack_id = Some("obj-1".into());

        driver
            .resize_cluster(
                &cluster,
                &nodegroups[1],
                5,
                &["node-3".to_string()],
                &crate::driver::NoopScaleManager,
            )
            .await
            .unwrap();
        let scaled = client.scaled.lock().unwrap();
        assert_eq!(
            scaled[0],
            (
                "obj-1".to_string(),
                "default-worker".to_string(),
                5,
                vec!["node-3".to_string()]
            )
        );
    }

    #[tokio::test]
    async fn delete_tolerates_missing_object() {
        let client = Arc::new(FakeManagement::default());
        let driver = CapiDriver::new(client, CapiDriverOpts::default());
        let (_, mut cluster, _) = fixtures();
        cluster.stack_id = Some("ghost".into());
        driver.delete_cluster(&cluster).await.unwrap();
    }

    #[test]
    fn no_rollback_support() {
        let client = Arc::new(FakeManagement::default());
        let driver = CapiDriver::new(client, CapiDriverOpts::default());
        assert!(!driver.supports_rollback());
    }
}
