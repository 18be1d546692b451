//! Reconciliation pollers.
//!
//! One supervised task per in-progress cluster or node-group operation.
//! Each tick takes the cluster lock, re-reads the entity, asks the
//! driver for engine status, and applies the transition. The tick
//! returns a [`PollOutcome`]; the supervisor loop unregisters the task
//! on terminal outcomes and fails the entity with reason "timeout" when
//! the attempt budget runs out.
//!
//! Ticks are idempotent: observing no transition writes nothing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use corral_common::status::ClusterStatus;
use corral_common::{Error, RequestContext, Result};
use corral_driver::{StackOutputs, StackPoll, StackStatus};
use corral_store::{Cluster, NodeGroup, NodeGroupFilters};

use crate::context::Ctx;
use crate::lock::ClusterLockGuard;
use crate::notify::{events, Notification, Outcome};

/// What one tick observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing terminal yet; keep polling
    Continue,
    /// The operation reached this terminal status; stop polling
    Done(ClusterStatus),
    /// The operation cannot make progress; fail the entity and stop
    Abort(String),
}

/// Start (or restart) the poller for a cluster operation.
pub fn spawn_cluster_poller(ctx: &Arc<Ctx>, cluster_uuid: &str) {
    let generation = ctx.pollers.next_generation();
    let ctx_task = ctx.clone();
    let uuid = cluster_uuid.to_string();
    let handle = tokio::spawn(async move {
        run_cluster_poller(&ctx_task, &uuid).await;
        ctx_task.pollers.unregister(&uuid, generation);
    });
    ctx.pollers.register(cluster_uuid, generation, handle);
}

/// Start (or restart) the poller for a standalone node-group operation.
pub fn spawn_nodegroup_poller(ctx: &Arc<Ctx>, cluster_uuid: &str, nodegroup_uuid: &str) {
    let generation = ctx.pollers.next_generation();
    let ctx_task = ctx.clone();
    let cluster = cluster_uuid.to_string();
    let nodegroup = nodegroup_uuid.to_string();
    let key = nodegroup_uuid.to_string();
    let handle = tokio::spawn(async move {
        run_nodegroup_poller(&ctx_task, &cluster, &nodegroup).await;
        ctx_task.pollers.unregister(&nodegroup, generation);
    });
    ctx.pollers.register(&key, generation, handle);
}

/// Re-register pollers for every entity left in-flight by a previous
/// process (conductor restart, crash takeover).
pub fn recover_pollers(ctx: &Arc<Ctx>) -> Result<()> {
    let clusters = ctx.store.list_in_progress_clusters()?;
    for cluster in &clusters {
        info!(cluster = %cluster.uuid, status = %cluster.status, "recovering cluster poller");
        spawn_cluster_poller(ctx, &cluster.uuid);
    }

    let in_progress: std::collections::HashSet<String> =
        clusters.into_iter().map(|c| c.uuid).collect();
    for nodegroup in ctx.store.list_in_progress_nodegroups()? {
        // Default node groups converge with their cluster's poller
        if nodegroup.is_default || in_progress.contains(&nodegroup.cluster_id) {
            continue;
        }
        info!(
            cluster = %nodegroup.cluster_id,
            nodegroup = %nodegroup.uuid,
            "recovering node group poller"
        );
        spawn_nodegroup_poller(ctx, &nodegroup.cluster_id, &nodegroup.uuid);
    }
    Ok(())
}

async fn run_cluster_poller(ctx: &Arc<Ctx>, cluster_uuid: &str) {
    let interval = ctx.config.cluster_heat.wait_interval();
    let max_attempts = ctx.config.cluster_heat.max_attempts;
    let mut attempts: u32 = 0;

    loop {
        tokio::time::sleep(interval).await;
        attempts += 1;

        match cluster_tick(ctx, cluster_uuid).await {
            Ok(PollOutcome::Continue) => {}
            Ok(PollOutcome::Done(status)) => {
                debug!(cluster = %cluster_uuid, status = %status, "poller finished");
                return;
            }
            Ok(PollOutcome::Abort(reason)) => {
                fail_cluster(ctx, cluster_uuid, &reason).await;
                return;
            }
            Err(e) => {
                // Transient (engine/store unreachable); the attempt
                // budget still bounds how long we keep trying.
                warn!(cluster = %cluster_uuid, error = %e, "poll tick failed");
            }
        }

        if attempts >= max_attempts {
            fail_cluster(ctx, cluster_uuid, "timeout").await;
            return;
        }
    }
}

/// One cluster poll tick. Public within the crate so tests can drive
/// ticks without timers.
pub(crate) async fn cluster_tick(ctx: &Arc<Ctx>, cluster_uuid: &str) -> Result<PollOutcome> {
    let admin = RequestContext::admin();

    // A mutating RPC may hold the lock; skip this tick rather than wait.
    let Some(_guard) = ClusterLockGuard::try_acquire(ctx, cluster_uuid)? else {
        return Ok(PollOutcome::Continue);
    };

    let cluster = match ctx.store.get_cluster_by_uuid(&admin, cluster_uuid) {
        Ok(cluster) => cluster,
        Err(Error::NotFound { .. }) => return Ok(PollOutcome::Done(ClusterStatus::DeleteComplete)),
        Err(e) => return Err(e),
    };
    if !cluster.status.is_in_progress() {
        return Ok(PollOutcome::Done(cluster.status));
    }

    let template = ctx
        .store
        .get_cluster_template_by_uuid(&admin, &cluster.cluster_template_id)?;
    let driver = ctx.registry.resolve(&template)?;
    let poll = driver.poll_cluster(&cluster).await?;

    apply_cluster_poll(ctx, cluster, poll).await
}

async fn apply_cluster_poll(
    ctx: &Arc<Ctx>,
    mut cluster: Cluster,
    poll: StackPoll,
) -> Result<PollOutcome> {
    if poll.status == StackStatus::Missing {
        if cluster.status == ClusterStatus::DeleteInProgress {
            finalize_cluster_delete(ctx, &cluster).await?;
            return Ok(PollOutcome::Done(ClusterStatus::DeleteComplete));
        }
        return Ok(PollOutcome::Abort(format!(
            "stack {} no longer exists in the engine",
            cluster.stack_id.as_deref().unwrap_or("<none>")
        )));
    }

    let mapped = poll
        .status
        .to_cluster_status()
        .expect("non-missing engine status always maps");

    if mapped == ClusterStatus::DeleteComplete {
        finalize_cluster_delete(ctx, &cluster).await?;
        return Ok(PollOutcome::Done(ClusterStatus::DeleteComplete));
    }

    let outputs_changed = write_cluster_outputs(&mut cluster, &poll.outputs);

    if mapped == cluster.status {
        // No transition. Writing nothing keeps the tick a no-op unless
        // the engine reported fresh outputs mid-flight.
        if outputs_changed {
            ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;
        }
        return Ok(PollOutcome::Continue);
    }

    info!(
        cluster = %cluster.uuid,
        from = %cluster.status,
        to = %mapped,
        "cluster status transition"
    );
    cluster.status = mapped;
    cluster.status_reason = poll.reason.clone();
    ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)?;

    if mapped.is_terminal() {
        sync_default_nodegroups(ctx, &cluster, mapped, &poll.outputs)?;
        Ok(PollOutcome::Done(mapped))
    } else {
        Ok(PollOutcome::Continue)
    }
}

/// Copy engine outputs onto the cluster row; true when anything changed.
fn write_cluster_outputs(cluster: &mut Cluster, outputs: &StackOutputs) -> bool {
    let mut changed = false;
    if outputs.api_address.is_some() && cluster.api_address != outputs.api_address {
        cluster.api_address = outputs.api_address.clone();
        changed = true;
    }
    if outputs.discovery_url.is_some() && cluster.discovery_url != outputs.discovery_url {
        cluster.discovery_url = outputs.discovery_url.clone();
        changed = true;
    }
    if outputs.coe_version.is_some() && cluster.coe_version != outputs.coe_version {
        cluster.coe_version = outputs.coe_version.clone();
        changed = true;
    }
    if outputs.container_version.is_some() && cluster.container_version != outputs.container_version
    {
        cluster.container_version = outputs.container_version.clone();
        changed = true;
    }
    changed
}

/// Bring default node groups along on a terminal cluster transition:
/// they share the cluster stack, so the cluster's convergence is theirs.
fn sync_default_nodegroups(
    ctx: &Arc<Ctx>,
    cluster: &Cluster,
    cluster_status: ClusterStatus,
    outputs: &StackOutputs,
) -> Result<()> {
    let nodegroups = ctx.store.list_nodegroups(
        &cluster.uuid,
        &NodeGroupFilters::default(),
        &Default::default(),
    )?;
    for mut nodegroup in nodegroups {
        let shares_stack =
            nodegroup.is_default || nodegroup.stack_id == cluster.stack_id;
        if !shares_stack || !nodegroup.status.is_in_progress() {
            continue;
        }
        let op = nodegroup.status.operation();
        nodegroup.status = if cluster_status.is_complete() {
            ClusterStatus::complete(op)
        } else {
            ClusterStatus::failed(op)
        };
        nodegroup.status_reason = cluster.status_reason.clone();
        match nodegroup.role {
            corral_common::status::NodeGroupRole::Worker => {
                if !outputs.node_addresses.is_empty() || cluster_status.is_complete() {
                    nodegroup.node_addresses = outputs.node_addresses.clone();
                }
            }
            corral_common::status::NodeGroupRole::Master => {
                if !outputs.master_addresses.is_empty() || cluster_status.is_complete() {
                    nodegroup.node_addresses = outputs.master_addresses.clone();
                }
            }
        }
        ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup)?;
    }
    Ok(())
}

/// DELETE reached its terminal state: tear down credentials, destroy
/// the rows, and emit the delayed success notification.
async fn finalize_cluster_delete(ctx: &Arc<Ctx>, cluster: &Cluster) -> Result<()> {
    // Best-effort by contract; failures are logged inside
    ctx.trust.teardown(cluster).await;

    ctx.store.destroy_cluster_cascade(&cluster.uuid)?;
    info!(cluster = %cluster.uuid, name = %cluster.name, "cluster deleted");

    let owner = RequestContext::new(&cluster.project_id, &cluster.user_id);
    ctx.notify(Notification::new(
        events::CLUSTER_DELETE,
        Outcome::Success,
        &owner,
        Some(&cluster.uuid),
        Some(&cluster.name),
    ))
    .await;
    Ok(())
}

/// Mark the cluster (and its riding node groups) failed with `reason`.
async fn fail_cluster(ctx: &Arc<Ctx>, cluster_uuid: &str, reason: &str) {
    let admin = RequestContext::admin();
    let guard = ClusterLockGuard::acquire(ctx, cluster_uuid).await;
    if let Err(e) = &guard {
        warn!(cluster = %cluster_uuid, error = %e, "cannot lock cluster to record failure");
        return;
    }

    let mut cluster = match ctx.store.get_cluster_by_uuid(&admin, cluster_uuid) {
        Ok(cluster) => cluster,
        Err(e) => {
            warn!(cluster = %cluster_uuid, error = %e, "cannot load cluster to record failure");
            return;
        }
    };
    if !cluster.status.is_in_progress() {
        return;
    }

    let failed = ClusterStatus::failed(cluster.status.operation());
    warn!(cluster = %cluster_uuid, status = %failed, reason = %reason, "operation failed");
    cluster.status = failed;
    cluster.status_reason = Some(reason.to_string());
    if let Err(e) = ctx.store.update_cluster(&cluster.uuid.clone(), &cluster) {
        warn!(cluster = %cluster_uuid, error = %e, "cannot persist failure status");
        return;
    }
    if let Err(e) = sync_default_nodegroups(ctx, &cluster, failed, &StackOutputs::default()) {
        warn!(cluster = %cluster_uuid, error = %e, "cannot propagate failure to node groups");
    }
}

async fn run_nodegroup_poller(ctx: &Arc<Ctx>, cluster_uuid: &str, nodegroup_uuid: &str) {
    let interval = ctx.config.cluster_heat.wait_interval();
    let max_attempts = ctx.config.cluster_heat.max_attempts;
    let mut attempts: u32 = 0;

    loop {
        tokio::time::sleep(interval).await;
        attempts += 1;

        match nodegroup_tick(ctx, cluster_uuid, nodegroup_uuid).await {
            Ok(PollOutcome::Continue) => {}
            Ok(PollOutcome::Done(status)) => {
                debug!(nodegroup = %nodegroup_uuid, status = %status, "node group poller finished");
                return;
            }
            Ok(PollOutcome::Abort(reason)) => {
                fail_nodegroup(ctx, cluster_uuid, nodegroup_uuid, &reason).await;
                return;
            }
            Err(e) => {
                warn!(nodegroup = %nodegroup_uuid, error = %e, "node group poll tick failed");
            }
        }

        if attempts >= max_attempts {
            fail_nodegroup(ctx, cluster_uuid, nodegroup_uuid, "timeout").await;
            return;
        }
    }
}

pub(crate) async fn nodegroup_tick(
    ctx: &Arc<Ctx>,
    cluster_uuid: &str,
    nodegroup_uuid: &str,
) -> Result<PollOutcome> {
    let admin = RequestContext::admin();

    let Some(_guard) = ClusterLockGuard::try_acquire(ctx, cluster_uuid)? else {
        return Ok(PollOutcome::Continue);
    };

    let cluster = match ctx.store.get_cluster_by_uuid(&admin, cluster_uuid) {
        Ok(cluster) => cluster,
        Err(Error::NotFound { .. }) => return Ok(PollOutcome::Done(ClusterStatus::DeleteComplete)),
        Err(e) => return Err(e),
    };
    let nodegroup = match ctx.store.get_nodegroup(cluster_uuid, nodegroup_uuid) {
        Ok(nodegroup) => nodegroup,
        Err(Error::NotFound { .. }) => return Ok(PollOutcome::Done(ClusterStatus::DeleteComplete)),
        Err(e) => return Err(e),
    };
    if !nodegroup.status.is_in_progress() {
        return Ok(PollOutcome::Done(nodegroup.status));
    }

    let template = ctx
        .store
        .get_cluster_template_by_uuid(&admin, &cluster.cluster_template_id)?;
    let driver = ctx.registry.resolve(&template)?;
    let poll = driver.poll_nodegroup(&cluster, &nodegroup).await?;

    apply_nodegroup_poll(ctx, &cluster, nodegroup, poll).await
}

async fn apply_nodegroup_poll(
    ctx: &Arc<Ctx>,
    cluster: &Cluster,
    mut nodegroup: NodeGroup,
    poll: StackPoll,
) -> Result<PollOutcome> {
    let op = nodegroup.status.operation();

    // Deletion finishes when the engine forgets the stack or reports
    // any completed action on it (pool-based backends report an update).
    if nodegroup.status == ClusterStatus::DeleteInProgress {
        let done = poll.status == StackStatus::Missing
            || poll
                .status
                .to_cluster_status()
                .is_some_and(|s| s.is_complete());
        if done {
            finalize_nodegroup_delete(ctx, cluster, &nodegroup).await?;
            settle_cluster_after_nodegroup_op(ctx, cluster, true, None)?;
            return Ok(PollOutcome::Done(ClusterStatus::DeleteComplete));
        }
        if poll
            .status
            .to_cluster_status()
            .is_some_and(|s| s.is_failed())
        {
            return Ok(PollOutcome::Abort(
                poll.reason.unwrap_or_else(|| "engine delete failed".to_string()),
            ));
        }
        return Ok(PollOutcome::Continue);
    }

    if poll.status == StackStatus::Missing {
        return Ok(PollOutcome::Abort(format!(
            "stack {} no longer exists in the engine",
            nodegroup.stack_id.as_deref().unwrap_or("<none>")
        )));
    }

    let engine_status = poll
        .status
        .to_cluster_status()
        .expect("non-missing engine status always maps");

    if engine_status.is_in_progress() {
        return Ok(PollOutcome::Continue);
    }

    // Map engine completion back onto this node group's own operation
    // family (a pool scale surfaces as UPDATE even during NG create).
    let final_status = if engine_status.is_complete() {
        ClusterStatus::complete(op)
    } else {
        ClusterStatus::failed(op)
    };

    if !poll.outputs.node_addresses.is_empty() {
        nodegroup.node_addresses = poll.outputs.node_addresses.clone();
    }
    info!(
        nodegroup = %nodegroup.uuid,
        from = %nodegroup.status,
        to = %final_status,
        "node group status transition"
    );
    nodegroup.status = final_status;
    nodegroup.status_reason = poll.reason.clone();
    ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup)?;

    settle_cluster_after_nodegroup_op(
        ctx,
        cluster,
        final_status.is_complete(),
        poll.reason.as_deref(),
    )?;

    Ok(PollOutcome::Done(final_status))
}

/// Node-group operations move their cluster to UPDATE_IN_PROGRESS; when
/// the node group settles, the cluster settles with it.
fn settle_cluster_after_nodegroup_op(
    ctx: &Arc<Ctx>,
    cluster: &Cluster,
    succeeded: bool,
    reason: Option<&str>,
) -> Result<()> {
    if cluster.status != ClusterStatus::UpdateInProgress {
        return Ok(());
    }
    let mut cluster = cluster.clone();
    cluster.status = if succeeded {
        ClusterStatus::UpdateComplete
    } else {
        ClusterStatus::UpdateFailed
    };
    cluster.status_reason = reason.map(str::to_string);
    ctx.store.update_cluster(&cluster.uuid.clone(), &cluster)
}

async fn finalize_nodegroup_delete(
    ctx: &Arc<Ctx>,
    cluster: &Cluster,
    nodegroup: &NodeGroup,
) -> Result<()> {
    ctx.store.destroy_nodegroup(&nodegroup.uuid)?;
    info!(
        cluster = %cluster.uuid,
        nodegroup = %nodegroup.uuid,
        name = %nodegroup.name,
        "node group deleted"
    );
    let owner = RequestContext::new(&cluster.project_id, &cluster.user_id);
    ctx.notify(Notification::new(
        events::NODEGROUP_DELETE,
        Outcome::Success,
        &owner,
        Some(&nodegroup.uuid),
        Some(&nodegroup.name),
    ))
    .await;
    Ok(())
}

async fn fail_nodegroup(ctx: &Arc<Ctx>, cluster_uuid: &str, nodegroup_uuid: &str, reason: &str) {
    let guard = ClusterLockGuard::acquire(ctx, cluster_uuid).await;
    if let Err(e) = &guard {
        warn!(nodegroup = %nodegroup_uuid, error = %e, "cannot lock cluster to record failure");
        return;
    }
    let mut nodegroup = match ctx.store.get_nodegroup(cluster_uuid, nodegroup_uuid) {
        Ok(nodegroup) => nodegroup,
        Err(e) => {
            warn!(nodegroup = %nodegroup_uuid, error = %e, "cannot load node group to record failure");
            return;
        }
    };
    if !nodegroup.status.is_in_progress() {
        return;
    }
    let failed = ClusterStatus::failed(nodegroup.status.operation());
    warn!(nodegroup = %nodegroup_uuid, status = %failed, reason = %reason, "node group operation failed");
    nodegroup.status = failed;
    nodegroup.status_reason = Some(reason.to_string());
    if let Err(e) = ctx.store.update_nodegroup(&nodegroup.uuid.clone(), &nodegroup) {
        warn!(nodegroup = %nodegroup_uuid, error = %e, "cannot persist failure status");
        return;
    }
    // The cluster rode along in UPDATE_IN_PROGRESS; settle it too
    if let Ok(cluster) = ctx
        .store
        .get_cluster_by_uuid(&RequestContext::admin(), cluster_uuid)
    {
        if let Err(e) = settle_cluster_after_nodegroup_op(ctx, &cluster, false, Some(reason)) {
            warn!(cluster = %cluster_uuid, error = %e, "cannot settle cluster after node group failure");
        }
    }
}
