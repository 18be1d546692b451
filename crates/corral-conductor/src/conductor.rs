//! RPC entry points.
//!
//! Every mutating operation follows the same shape: emit the pending
//! notification, run the protocol under the cluster lock, emit the
//! success or failure notification, reply. Convergence is asynchronous;
//! callers poll the entity to watch it finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use corral_common::status::{
    ClusterStatus, HealthStatus, NodeGroupRole, Operation,
};
use corral_common::{Error, RequestContext, Result};
use corral_store::{Cluster, ClusterTemplate, NodeGroup};
use corral_trust::CaKind;

use crate::context::Ctx;
use crate::lock::ClusterLockGuard;
use crate::notify::{events, Notification, Outcome};
use crate::poller::{spawn_cluster_poller, spawn_nodegroup_poller};
use crate::quota::check_cluster_quota;
use crate::reclaim::reclaim_cluster_resources;

/// Parameters for `cluster_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterCreateRequest {
    pub name: String,
    /// Template uuid or name
    pub cluster_template_id: String,
    #[serde(default = "default_one")]
    pub node_count: u32,
    #[serde(default = "default_one")]
    pub master_count: u32,
    pub create_timeout_minutes: Option<u32>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub keypair: Option<String>,
    pub flavor_id: Option<String>,
    pub master_flavor_id: Option<String>,
    pub docker_volume_size: Option<i64>,
    pub fixed_network: Option<String>,
    pub fixed_subnet: Option<String>,
    pub floating_ip_enabled: Option<bool>,
    pub master_lb_enabled: Option<bool>,
}

fn default_one() -> u32 {
    1
}

/// Desired-state diff for `cluster_update`.
///
/// Immutable attributes are present so that requests naming them can be
/// rejected explicitly instead of silently dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterUpdate {
    pub name: Option<String>,
    pub node_count: Option<u32>,
    pub health_status: Option<HealthStatus>,
    pub health_status_reason: Option<BTreeMap<String, String>>,
    pub labels: Option<BTreeMap<String, String>>,
    // Immutable; any value here fails the request
    pub uuid: Option<String>,
    pub project_id: Option<String>,
    pub cluster_template_id: Option<String>,
    pub api_address: Option<String>,
}

/// Parameters for `cluster_resize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub node_count: u32,
    #[serde(default)]
    pub nodes_to_remove: Vec<String>,
    /// Node group uuid or name; defaults to the default worker group
    pub nodegroup: Option<String>,
}

/// Parameters for `cluster_upgrade`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRequest {
    /// Target template uuid or name
    pub cluster_template_id: String,
    #[serde(default = "default_one")]
    pub max_batch_size: u32,
    pub nodegroup: Option<String>,
}

/// Parameters for `nodegroup_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroupCreateRequest {
    pub name: String,
    #[serde(default = "default_one")]
    pub node_count: u32,
    pub min_node_count: Option<u32>,
    pub max_node_count: Option<u32>,
    pub flavor_id: Option<String>,
    pub image_id: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Only worker groups can be added after creation
    pub role: Option<NodeGroupRole>,
}

/// Desired-state diff for `nodegroup_update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGroupUpdate {
    pub node_count: Option<u32>,
    pub min_node_count: Option<u32>,
    pub max_node_count: Option<u32>,
}

/// Parameters for `cluster_template_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCreateRequest {
    pub name: String,
    pub image_ref: String,
    pub coe: String,
    pub cluster_distro: Option<String>,
    pub server_type: Option<String>,
    pub flavor: Option<String>,
    pub master_flavor: Option<String>,
    pub keypair: Option<String>,
    pub external_network: Option<String>,
    pub fixed_network: Option<String>,
    pub fixed_subnet: Option<String>,
    pub dns_nameserver: Option<String>,
    pub docker_volume_size: Option<i64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub tls_disabled: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub master_lb_enabled: bool,
    #[serde(default = "default_true")]
    pub floating_ip_enabled: bool,
    pub driver: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A certificate signed for a caller-supplied CSR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedCertificate {
    pub cluster_uuid: String,
    pub pem: String,
}

/// The conductor service: one instance per worker process.
pub struct Conductor {
    ctx: Arc<Ctx>,
}

impl Conductor {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    /// Liveness probe over the bus.
    pub async fn ping_conductor(&self) -> &'static str {
        "pong"
    }

    // =========================================================================
    // Cluster operations
    // =========================================================================

    #[instrument(skip(self, rc, request), fields(cluster = %request.name))]
    pub async fn cluster_create(
        &self,
        rc: &RequestContext,
        request: ClusterCreateRequest,
    ) -> Result<Cluster> {
        self.ctx
            .notify(Notification::new(
                events::CLUSTER_CREATE,
                Outcome::Pending,
                rc,
                None,
                Some(&request.name),
            ))
            .await;

        let result = self.do_cluster_create(rc, &request).await;
        self.emit_result(
            events::CLUSTER_CREATE,
            rc,
            result.as_ref().ok().map(|c| c.uuid.clone()),
            Some(&request.name),
            &result,
        )
        .await;
        result
    }

    async fn do_cluster_create(
        &self,
        rc: &RequestContext,
        request: &ClusterCreateRequest,
    ) -> Result<Cluster> {
        let ctx = &self.ctx;
        if request.master_count < 1 {
            return Err(Error::invalid_field("master_count", "must be at least 1"));
        }

        let template = self.resolve_template(rc, &request.cluster_template_id)?;
        check_cluster_quota(&ctx.store, &ctx.config, &rc.project_id)?;

        // Per-name uniqueness within the project; the unique index
        // closes the remaining race at insert time.
        match ctx.store.get_cluster_by_name(rc, &request.name) {
            Ok(_) => return Err(Error::already_exists("Cluster", &request.name)),
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let timeout_minutes = request
            .create_timeout_minutes
            .unwrap_or(ctx.config.cluster.default_create_timeout_minutes);
        let mut cluster = Cluster::new(
            &request.name,
            &rc.project_id,
            &rc.user_id,
            &template,
            timeout_minutes,
        );
        cluster.labels.extend(request.labels.clone());
        if let Some(keypair) = &request.keypair {
            cluster.keypair = Some(keypair.clone());
        }
        if let Some(flavor) = &request.flavor_id {
            cluster.flavor_id = Some(flavor.clone());
        }
        if let Some(flavor) = &request.master_flavor_id {
            cluster.master_flavor_id = Some(flavor.clone());
        }
        if let Some(size) = request.docker_volume_size {
            cluster.docker_volume_size = Some(size);
        }
        if let Some(network) = &request.fixed_network {
            cluster.fixed_network = Some(network.clone());
        }
        if let Some(subnet) = &request.fixed_subnet {
            cluster.fixed_subnet = Some(subnet.clone());
        }
        if let Some(enabled) = request.floating_ip_enabled {
            cluster.floating_ip_enabled = enabled;
        }
        if let Some(enabled) = request.master_lb_enabled {
            cluster.master_lb_enabled = enabled;
        }

        let driver = ctx.registry.resolve(&template)?;

        // Credentials before any engine work: the cluster calls back
        // into tenant APIs for its whole lifetime.
        let creds = ctx.trust.provision_trustee(rc, &cluster.uuid).await?;
        cluster.trustee_username = Some(creds.username);
        cluster.trustee_user_id = Some(creds.user_id);
        cluster.trustee_password = Some(creds.password);
        cluster.trust_id = Some(creds.trust_id);

        if let Err(e) = ctx
            .trust
            .provision_certificates(rc, &mut cluster, template.coe)
            .await
        {
            ctx.trust.teardown(&cluster).await;
            return Err(e);
        }

        let mut master = NodeGroup::new(
            &cluster,
            "default-master",
            NodeGroupRole::Master,
            request.master_count,
        );
        master.is_default = true;
        master.image_id = Some(template.image_ref.clone());
        let mut worker = NodeGroup::new(
            &cluster,
            "default-worker",
            NodeGroupRole::Worker,
            request.node_count,
        );
        worker.is_default = true;
        worker.image_id = Some(template.image_ref.clone());
        let mut nodegroups = vec![master, worker];

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;

        if let Err(e) = ctx.store.create_cluster(&cluster) {
            drop(guard);
            ctx.trust.teardown(&cluster).await;
            return Err(e);
        }
        for nodegroup in &nodegroups {
            ctx.store.create_nodegroup(nodegroup)?;
        }

        let timeout = Duration::from_secs(u64::from(timeout_minutes) * 60);
        match driver
            .create_cluster(&cluster, &template, &nodegroups, timeout)
            .await
        {
            Ok(stack_id) => {
                cluster.stack_id = Some(stack_id.clone());
                ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;
                for nodegroup in &mut nodegroups {
                    nodegroup.stack_id = Some(stack_id.clone());
                    ctx.store.update_nodegroup(&nodegroup.uuid.clone(), nodegroup)?;
                }
                drop(guard);

                spawn_cluster_poller(ctx, &cluster.uuid);
                info!(cluster = %cluster.uuid, stack = %stack_id, "cluster creation submitted");
                Ok(cluster)
            }
            Err(e) => {
                cluster.status = ClusterStatus::CreateFailed;
                cluster.status_reason = Some(e.to_string());
                if let Err(persist) = ctx.store.update_cluster(&cluster.uuid.clone(), &cluster) {
                    warn!(cluster = %cluster.uuid, error = %persist, "cannot record create failure");
                }
                for nodegroup in &mut nodegroups {
                    nodegroup.status = ClusterStatus::CreateFailed;
                    nodegroup.status_reason = Some(e.to_string());
                    let _ = ctx.store.update_nodegroup(&nodegroup.uuid.clone(), nodegroup);
                }
                drop(guard);
                ctx.trust.teardown(&cluster).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self, rc, patch), fields(cluster = %id))]
    pub async fn cluster_update(
        &self,
        rc: &RequestContext,
        id: &str,
        patch: ClusterUpdate,
        rollback: bool,
    ) -> Result<Cluster> {
        self.ctx
            .notify(Notification::new(
                events::CLUSTER_UPDATE,
                Outcome::Pending,
                rc,
                None,
                Some(id),
            ))
            .await;
        let result = self.do_cluster_update(rc, id, &patch, rollback).await;
        self.emit_result(
            events::CLUSTER_UPDATE,
            rc,
            result.as_ref().ok().map(|c| c.uuid.clone()),
            Some(id),
            &result,
        )
        .await;
        result
    }

    async fn do_cluster_update(
        &self,
        rc: &RequestContext,
        id: &str,
        patch: &ClusterUpdate,
        rollback: bool,
    ) -> Result<Cluster> {
        let ctx = &self.ctx;
        let cluster = ctx.store.resolve_cluster(rc, id)?;
        rc.check_owns(&cluster.project_id)?;

        for (field, attempted) in [
            ("uuid", patch.uuid.is_some()),
            ("project_id", patch.project_id.is_some()),
            ("cluster_template_id", patch.cluster_template_id.is_some()),
            ("api_address", patch.api_address.is_some()),
        ] {
            if attempted {
                return Err(Error::invalid_field(field, "attribute is immutable"));
            }
        }

        let touches_infrastructure =
            patch.node_count.is_some() || patch.labels.is_some() || patch.name.is_some();

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;
        // Fresh read under the lock before any transition decision
        let mut cluster = ctx.store.get_cluster_by_uuid(rc, &cluster.uuid)?;

        if let Some(health) = patch.health_status {
            cluster.health_status = health;
        }
        if let Some(reason) = &patch.health_status_reason {
            cluster.health_status_reason = reason.clone();
        }

        if !touches_infrastructure {
            // Health updates come from monitoring and apply in any state
            ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;
            return Ok(cluster);
        }

        cluster.status.check_operation_allowed(Operation::Update)?;

        let template = ctx
            .store
            .get_cluster_template_by_uuid(rc, &cluster.cluster_template_id)?;
        let driver = ctx.registry.resolve(&template)?;
        if rollback && !driver.supports_rollback() {
            return Err(Error::not_supported(format!(
                "driver {} cannot roll back failed updates",
                driver.name()
            )));
        }

        if let Some(name) = &patch.name {
            cluster.name = name.clone();
        }
        if let Some(labels) = &patch.labels {
            cluster.labels = labels.clone();
        }

        if let Some(node_count) = patch.node_count {
            // node_count flows through the resize protocol either way
            let (_, worker) = ctx.store.default_nodegroups(&cluster.uuid)?;
            self.submit_resize(&mut cluster, worker, node_count, &[])
                .await?;
        } else {
            let nodegroups = ctx.store.list_nodegroups(
                &cluster.uuid,
                &Default::default(),
                &Default::default(),
            )?;
            driver
                .update_cluster(&cluster, &template, &nodegroups, rollback)
                .await?;
            cluster.status = ClusterStatus::UpdateInProgress;
            cluster.status_reason = None;
            ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;
        }

        drop(guard);
        spawn_cluster_poller(ctx, &cluster.uuid);
        Ok(cluster)
    }

    #[instrument(skip(self, rc, request), fields(cluster = %id))]
    pub async fn cluster_resize(
        &self,
        rc: &RequestContext,
        id: &str,
        request: ResizeRequest,
    ) -> Result<Cluster> {
        self.ctx
            .notify(Notification::new(
                events::CLUSTER_UPDATE,
                Outcome::Pending,
                rc,
                None,
                Some(id),
            ))
            .await;
        let result = self.do_cluster_resize(rc, id, &request).await;
        self.emit_result(
            events::CLUSTER_UPDATE,
            rc,
            result.as_ref().ok().map(|c| c.uuid.clone()),
            Some(id),
            &result,
        )
        .await;
        result
    }

    async fn do_cluster_resize(
        &self,
        rc: &RequestContext,
        id: &str,
        request: &ResizeRequest,
    ) -> Result<Cluster> {
        let ctx = &self.ctx;
        let cluster = ctx.store.resolve_cluster(rc, id)?;
        rc.check_owns(&cluster.project_id)?;

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;
        let mut cluster = ctx.store.get_cluster_by_uuid(rc, &cluster.uuid)?;
        cluster.status.check_operation_allowed(Operation::Update)?;

        let nodegroup = match &request.nodegroup {
            Some(id) => ctx.store.get_nodegroup(&cluster.uuid, id)?,
            None => ctx.store.default_nodegroups(&cluster.uuid)?.1,
        };

        let standalone = !nodegroup.is_default;
        let nodegroup_uuid = nodegroup.uuid.clone();
        self.submit_resize(&mut cluster, nodegroup, request.node_count, &request.nodes_to_remove)
            .await?;

        drop(guard);
        if standalone {
            spawn_nodegroup_poller(ctx, &cluster.uuid, &nodegroup_uuid);
        } else {
            spawn_cluster_poller(ctx, &cluster.uuid);
        }
        Ok(cluster)
    }

    /// Shared resize submission: bounds check, driver call, desired
    /// state and IN_PROGRESS statuses persisted. Caller holds the lock.
    async fn submit_resize(
        &self,
        cluster: &mut Cluster,
        mut nodegroup: NodeGroup,
        node_count: u32,
        nodes_to_remove: &[String],
    ) -> Result<()> {
        let ctx = &self.ctx;

        let mut desired = nodegroup.clone();
        desired.node_count = node_count;
        desired.validate_counts()?;

        let template = ctx
            .store
            .get_cluster_template_by_uuid(&RequestContext::admin(), &cluster.cluster_template_id)?;
        let driver = ctx.registry.resolve(&template)?;
        driver
            .resize_cluster(
                cluster,
                &nodegroup,
                node_count,
                nodes_to_remove,
                ctx.scale_manager.as_ref(),
            )
            .await?;

        nodegroup.node_count = node_count;
        nodegroup.status = ClusterStatus::UpdateInProgress;
        nodegroup.status_reason = None;
        ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup)?;

        cluster.status = ClusterStatus::UpdateInProgress;
        cluster.status_reason = None;
        ctx.store.update_cluster(&cluster.uuid.clone(), cluster)?;
        Ok(())
    }

    #[instrument(skip(self, rc, request), fields(cluster = %id))]
    pub async fn cluster_upgrade(
        &self,
        rc: &RequestContext,
        id: &str,
        request: UpgradeRequest,
    ) -> Result<Cluster> {
        self.ctx
            .notify(Notification::new(
                events::CLUSTER_UPDATE,
                Outcome::Pending,
                rc,
                None,
                Some(id),
            ))
            .await;
        let result = self.do_cluster_upgrade(rc, id, &request).await;
        self.emit_result(
            events::CLUSTER_UPDATE,
            rc,
            result.as_ref().ok().map(|c| c.uuid.clone()),
            Some(id),
            &result,
        )
        .await;
        result
    }

    async fn do_cluster_upgrade(
        &self,
        rc: &RequestContext,
        id: &str,
        request: &UpgradeRequest,
    ) -> Result<Cluster> {
        let ctx = &self.ctx;
        let cluster = ctx.store.resolve_cluster(rc, id)?;
        rc.check_owns(&cluster.project_id)?;
        let new_template = self.resolve_template(rc, &request.cluster_template_id)?;

        // Upgrades only move forward (or sideways for a rebuild)
        let current_version = cluster
            .coe_version
            .clone()
            .or_else(|| cluster.labels.get("coe_version").cloned());
        let target_version = new_template.labels.get("coe_version").cloned();
        if let (Some(current), Some(target)) = (&current_version, &target_version) {
            if compare_coe_versions(target, current)? == std::cmp::Ordering::Less {
                return Err(Error::not_supported(format!(
                    "downgrade from {} to {} is not supported",
                    current, target
                )));
            }
        }

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;
        let mut cluster = ctx.store.get_cluster_by_uuid(rc, &cluster.uuid)?;
        cluster.status.check_operation_allowed(Operation::Update)?;

        let nodegroup = match &request.nodegroup {
            Some(id) => ctx.store.get_nodegroup(&cluster.uuid, id)?,
            None => ctx.store.default_nodegroups(&cluster.uuid)?.1,
        };

        let driver = ctx.registry.resolve(&new_template)?;
        driver
            .upgrade_cluster(&cluster, &new_template, request.max_batch_size, &nodegroup)
            .await?;

        cluster.cluster_template_id = new_template.uuid.clone();
        if let Some(target) = target_version {
            cluster
                .labels
                .insert("coe_version".to_string(), target);
        }
        cluster.status = ClusterStatus::UpdateInProgress;
        cluster.status_reason = None;
        ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;

        drop(guard);
        spawn_cluster_poller(ctx, &cluster.uuid);
        Ok(cluster)
    }

    #[instrument(skip(self, rc), fields(cluster = %id))]
    pub async fn cluster_delete(&self, rc: &RequestContext, id: &str) -> Result<()> {
        self.ctx
            .notify(Notification::new(
                events::CLUSTER_DELETE,
                Outcome::Pending,
                rc,
                None,
                Some(id),
            ))
            .await;
        let result = self.do_cluster_delete(rc, id).await;
        // The delayed success event comes from the poller at
        // DELETE_COMPLETE; only failures are reported here.
        if let Err(e) = &result {
            self.ctx
                .notify(
                    Notification::new(events::CLUSTER_DELETE, Outcome::Failure, rc, None, Some(id))
                        .with_fault(e),
                )
                .await;
        }
        result
    }

    async fn do_cluster_delete(&self, rc: &RequestContext, id: &str) -> Result<()> {
        let ctx = &self.ctx;
        let cluster = ctx.store.resolve_cluster(rc, id)?;
        rc.check_owns(&cluster.project_id)?;

        // Idempotent: deletion already converging
        if cluster.status == ClusterStatus::DeleteInProgress {
            return Ok(());
        }

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;
        let mut cluster = match ctx.store.get_cluster_by_uuid(rc, &cluster.uuid) {
            Ok(cluster) => cluster,
            // Finished deleting while we waited for the lock
            Err(Error::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if cluster.status == ClusterStatus::DeleteInProgress {
            return Ok(());
        }

        // Tenant resources whose lifetime is coupled to the cluster go
        // first; a failure here leaves the cluster untouched for retry.
        reclaim_cluster_resources(
            ctx.loadbalancer.as_ref(),
            ctx.network.as_ref(),
            &ctx.config.cluster_heat,
            &cluster.uuid,
        )
        .await?;

        let template = ctx
            .store
            .get_cluster_template_by_uuid(&RequestContext::admin(), &cluster.cluster_template_id)?;
        let driver = ctx.registry.resolve(&template)?;
        driver.delete_cluster(&cluster).await?;

        cluster.status = ClusterStatus::DeleteInProgress;
        cluster.status_reason = None;
        ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;
        for mut nodegroup in
            ctx.store
                .list_nodegroups(&cluster.uuid, &Default::default(), &Default::default())?
        {
            nodegroup.status = ClusterStatus::DeleteInProgress;
            nodegroup.status_reason = None;
            ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup)?;
        }

        drop(guard);
        spawn_cluster_poller(ctx, &cluster.uuid);
        info!(cluster = %cluster.uuid, "cluster deletion submitted");
        Ok(())
    }

    // =========================================================================
    // Node group operations
    // =========================================================================

    #[instrument(skip(self, rc, request), fields(cluster = %cluster_id, nodegroup = %request.name))]
    pub async fn nodegroup_create(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        request: NodeGroupCreateRequest,
    ) -> Result<NodeGroup> {
        self.ctx
            .notify(Notification::new(
                events::NODEGROUP_CREATE,
                Outcome::Pending,
                rc,
                None,
                Some(&request.name),
            ))
            .await;
        let result = self.do_nodegroup_create(rc, cluster_id, &request).await;
        self.emit_result(
            events::NODEGROUP_CREATE,
            rc,
            result.as_ref().ok().map(|ng| ng.uuid.clone()),
            Some(&request.name),
            &result,
        )
        .await;
        result
    }

    async fn do_nodegroup_create(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        request: &NodeGroupCreateRequest,
    ) -> Result<NodeGroup> {
        let ctx = &self.ctx;
        if matches!(request.role, Some(NodeGroupRole::Master)) {
            return Err(Error::invalid_field(
                "role",
                "additional master node groups are not supported",
            ));
        }

        let cluster = ctx.store.resolve_cluster(rc, cluster_id)?;
        rc.check_owns(&cluster.project_id)?;

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;
        let mut cluster = ctx.store.get_cluster_by_uuid(rc, &cluster.uuid)?;
        cluster.status.check_operation_allowed(Operation::Update)?;

        let template = ctx
            .store
            .get_cluster_template_by_uuid(&RequestContext::admin(), &cluster.cluster_template_id)?;
        let driver = ctx.registry.resolve(&template)?;

        let mut nodegroup = NodeGroup::new(
            &cluster,
            &request.name,
            NodeGroupRole::Worker,
            request.node_count,
        );
        nodegroup.min_node_count = request.min_node_count.unwrap_or(0);
        nodegroup.max_node_count = request.max_node_count;
        if let Some(flavor) = &request.flavor_id {
            nodegroup.flavor_id = Some(flavor.clone());
        }
        nodegroup.image_id = Some(
            request
                .image_id
                .clone()
                .unwrap_or_else(|| template.image_ref.clone()),
        );
        nodegroup.labels.extend(request.labels.clone());
        nodegroup.validate_counts()?;

        ctx.store.create_nodegroup(&nodegroup)?;

        match driver.create_nodegroup(&cluster, &template, &nodegroup).await {
            Ok(stack_id) => {
                nodegroup.stack_id = stack_id.or_else(|| cluster.stack_id.clone());
                ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup)?;
            }
            Err(e) => {
                nodegroup.status = ClusterStatus::CreateFailed;
                nodegroup.status_reason = Some(e.to_string());
                let _ = ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup);
                return Err(e);
            }
        }

        cluster.status = ClusterStatus::UpdateInProgress;
        cluster.status_reason = None;
        ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;

        drop(guard);
        spawn_nodegroup_poller(ctx, &cluster.uuid, &nodegroup.uuid);
        Ok(nodegroup)
    }

    #[instrument(skip(self, rc, patch), fields(cluster = %cluster_id, nodegroup = %nodegroup_id))]
    pub async fn nodegroup_update(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        nodegroup_id: &str,
        patch: NodeGroupUpdate,
    ) -> Result<NodeGroup> {
        self.ctx
            .notify(Notification::new(
                events::NODEGROUP_UPDATE,
                Outcome::Pending,
                rc,
                None,
                Some(nodegroup_id),
            ))
            .await;
        let result = self
            .do_nodegroup_update(rc, cluster_id, nodegroup_id, &patch)
            .await;
        self.emit_result(
            events::NODEGROUP_UPDATE,
            rc,
            result.as_ref().ok().map(|ng| ng.uuid.clone()),
            Some(nodegroup_id),
            &result,
        )
        .await;
        result
    }

    async fn do_nodegroup_update(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        nodegroup_id: &str,
        patch: &NodeGroupUpdate,
    ) -> Result<NodeGroup> {
        let ctx = &self.ctx;
        let cluster = ctx.store.resolve_cluster(rc, cluster_id)?;
        rc.check_owns(&cluster.project_id)?;

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;
        let mut cluster = ctx.store.get_cluster_by_uuid(rc, &cluster.uuid)?;
        let mut nodegroup = ctx.store.get_nodegroup(&cluster.uuid, nodegroup_id)?;
        nodegroup.status.check_operation_allowed(Operation::Update)?;

        if let Some(min) = patch.min_node_count {
            nodegroup.min_node_count = min;
        }
        if let Some(max) = patch.max_node_count {
            nodegroup.max_node_count = Some(max);
        }
        if let Some(count) = patch.node_count {
            nodegroup.node_count = count;
        }
        nodegroup.validate_counts()?;

        let template = ctx
            .store
            .get_cluster_template_by_uuid(&RequestContext::admin(), &cluster.cluster_template_id)?;
        let driver = ctx.registry.resolve(&template)?;

        if patch.node_count.is_some() {
            driver.update_nodegroup(&cluster, &nodegroup).await?;
            nodegroup.status = ClusterStatus::UpdateInProgress;
            nodegroup.status_reason = None;
            cluster.status = ClusterStatus::UpdateInProgress;
            cluster.status_reason = None;
            ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;
        }
        ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup)?;

        drop(guard);
        if patch.node_count.is_some() {
            spawn_nodegroup_poller(ctx, &cluster.uuid, &nodegroup.uuid);
        }
        Ok(nodegroup)
    }

    #[instrument(skip(self, rc), fields(cluster = %cluster_id, nodegroup = %nodegroup_id))]
    pub async fn nodegroup_delete(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        nodegroup_id: &str,
    ) -> Result<()> {
        self.ctx
            .notify(Notification::new(
                events::NODEGROUP_DELETE,
                Outcome::Pending,
                rc,
                None,
                Some(nodegroup_id),
            ))
            .await;
        let result = self.do_nodegroup_delete(rc, cluster_id, nodegroup_id).await;
        if let Err(e) = &result {
            self.ctx
                .notify(
                    Notification::new(
                        events::NODEGROUP_DELETE,
                        Outcome::Failure,
                        rc,
                        None,
                        Some(nodegroup_id),
                    )
                    .with_fault(e),
                )
                .await;
        }
        result
    }

    async fn do_nodegroup_delete(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        nodegroup_id: &str,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let cluster = ctx.store.resolve_cluster(rc, cluster_id)?;
        rc.check_owns(&cluster.project_id)?;

        let guard = ClusterLockGuard::acquire(ctx, &cluster.uuid).await?;
        let mut cluster = ctx.store.get_cluster_by_uuid(rc, &cluster.uuid)?;
        let mut nodegroup = ctx.store.get_nodegroup(&cluster.uuid, nodegroup_id)?;

        if nodegroup.is_default {
            return Err(Error::not_supported(
                "default node groups are deleted with their cluster",
            ));
        }
        if nodegroup.status == ClusterStatus::DeleteInProgress {
            return Ok(());
        }

        let template = ctx
            .store
            .get_cluster_template_by_uuid(&RequestContext::admin(), &cluster.cluster_template_id)?;
        let driver = ctx.registry.resolve(&template)?;
        driver.delete_nodegroup(&cluster, &nodegroup).await?;

        nodegroup.status = ClusterStatus::DeleteInProgress;
        nodegroup.status_reason = None;
        ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup)?;
        cluster.status = ClusterStatus::UpdateInProgress;
        cluster.status_reason = None;
        ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;

        drop(guard);
        spawn_nodegroup_poller(ctx, &cluster.uuid, &nodegroup.uuid);
        Ok(())
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    #[instrument(skip(self, rc, csr_pem), fields(cluster = %cluster_id))]
    pub async fn sign_certificate(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        csr_pem: &str,
        validity_days: Option<i64>,
    ) -> Result<SignedCertificate> {
        let cluster = self.ctx.store.resolve_cluster(rc, cluster_id)?;
        rc.check_owns(&cluster.project_id)?;
        let pem = self
            .ctx
            .trust
            .sign_certificate(&cluster, csr_pem, validity_days)
            .await?;
        Ok(SignedCertificate {
            cluster_uuid: cluster.uuid,
            pem,
        })
    }

    #[instrument(skip(self, rc), fields(cluster = %cluster_id))]
    pub async fn get_ca_certificate(
        &self,
        rc: &RequestContext,
        cluster_id: &str,
        kind: Option<&str>,
    ) -> Result<String> {
        let cluster = self.ctx.store.resolve_cluster(rc, cluster_id)?;
        rc.check_owns(&cluster.project_id)?;
        let kind = match kind.unwrap_or("ca") {
            "ca" => CaKind::Ca,
            "etcd" | "etcd-ca" => CaKind::EtcdCa,
            "front-proxy" | "front-proxy-ca" => CaKind::FrontProxyCa,
            other => {
                return Err(Error::invalid_field(
                    "kind",
                    format!("unknown CA kind '{}'", other),
                ))
            }
        };
        self.ctx.trust.get_ca_certificate(&cluster, kind).await
    }

    // =========================================================================
    // Cluster templates
    // =========================================================================

    #[instrument(skip(self, rc, request), fields(template = %request.name))]
    pub async fn cluster_template_create(
        &self,
        rc: &RequestContext,
        request: TemplateCreateRequest,
    ) -> Result<ClusterTemplate> {
        self.ctx
            .notify(Notification::new(
                events::TEMPLATE_CREATE,
                Outcome::Pending,
                rc,
                None,
                Some(&request.name),
            ))
            .await;
        let result = self.do_template_create(rc, &request).await;
        self.emit_result(
            events::TEMPLATE_CREATE,
            rc,
            result.as_ref().ok().map(|t| t.uuid.clone()),
            Some(&request.name),
            &result,
        )
        .await;
        result
    }

    async fn do_template_create(
        &self,
        rc: &RequestContext,
        request: &TemplateCreateRequest,
    ) -> Result<ClusterTemplate> {
        if request.public && !rc.is_admin {
            return Err(Error::not_authorized(
                "publishing templates across tenants requires an administrative role",
            ));
        }

        let coe = request.coe.parse()?;
        let mut template = ClusterTemplate::new(
            &request.name,
            &rc.project_id,
            &rc.user_id,
            &request.image_ref,
            request
                .cluster_distro
                .clone()
                .unwrap_or_else(|| "fedora-coreos".to_string()),
            coe,
        );
        if let Some(server_type) = &request.server_type {
            template.server_type = server_type.parse()?;
        }
        template.flavor = request.flavor.clone();
        template.master_flavor = request.master_flavor.clone();
        template.keypair = request.keypair.clone();
        template.external_network = request.external_network.clone();
        template.fixed_network = request.fixed_network.clone();
        template.fixed_subnet = request.fixed_subnet.clone();
        template.dns_nameserver = request.dns_nameserver.clone();
        template.docker_volume_size = request.docker_volume_size;
        template.labels = request.labels.clone();
        template.tls_disabled = request.tls_disabled;
        template.public = request.public;
        template.hidden = request.hidden;
        template.master_lb_enabled = request.master_lb_enabled;
        template.floating_ip_enabled = request.floating_ip_enabled;
        template.driver = request.driver.clone();

        // A template no driver serves would only fail later, at create
        self.ctx.registry.resolve(&template)?;

        self.ctx.store.create_cluster_template(&template)?;
        Ok(template)
    }

    #[instrument(skip(self, rc), fields(template = %id))]
    pub async fn cluster_template_delete(&self, rc: &RequestContext, id: &str) -> Result<()> {
        self.ctx
            .notify(Notification::new(
                events::TEMPLATE_DELETE,
                Outcome::Pending,
                rc,
                None,
                Some(id),
            ))
            .await;
        let result = self.do_template_delete(rc, id).await;
        self.emit_result(events::TEMPLATE_DELETE, rc, None, Some(id), &result)
            .await;
        result.map(|_| ())
    }

    async fn do_template_delete(&self, rc: &RequestContext, id: &str) -> Result<ClusterTemplate> {
        let template = self.resolve_template(rc, id)?;
        if !rc.is_admin && template.project_id != rc.project_id {
            return Err(Error::not_found("ClusterTemplate", id));
        }
        self.ctx.store.destroy_cluster_template(&template.uuid)?;
        Ok(template)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn resolve_template(&self, rc: &RequestContext, id: &str) -> Result<ClusterTemplate> {
        if uuid::Uuid::parse_str(id).is_ok() {
            self.ctx.store.get_cluster_template_by_uuid(rc, id)
        } else {
            self.ctx.store.get_cluster_template_by_name(rc, id)
        }
    }

    /// Emit the success/failure notification for a finished call.
    async fn emit_result<T>(
        &self,
        event_type: &str,
        rc: &RequestContext,
        resource_uuid: Option<String>,
        resource_name: Option<&str>,
        result: &Result<T>,
    ) {
        let notification = match result {
            Ok(_) => Notification::new(
                event_type,
                Outcome::Success,
                rc,
                resource_uuid.as_deref(),
                resource_name,
            ),
            Err(e) => Notification::new(
                event_type,
                Outcome::Failure,
                rc,
                resource_uuid.as_deref(),
                resource_name,
            )
            .with_fault(e),
        };
        self.ctx.notify(notification).await;
    }
}

/// Compare two orchestrator versions of the form `v1.30.2` (the leading
/// `v` is optional).
fn compare_coe_versions(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    fn parse(version: &str) -> Result<Vec<u64>> {
        version
            .trim_start_matches('v')
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    Error::invalid_field("coe_version", format!("cannot parse '{}'", version))
                })
            })
            .collect()
    }
    Ok(parse(a)?.cmp(&parse(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        use std::cmp::Ordering;
        assert_eq!(
            compare_coe_versions("v1.31.0", "v1.30.2").unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            compare_coe_versions("1.30.2", "v1.30.2").unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            compare_coe_versions("v1.29.7", "v1.30.0").unwrap(),
            Ordering::Less
        );
        assert!(compare_coe_versions("not-a-version", "v1.0.0").is_err());
    }
}
