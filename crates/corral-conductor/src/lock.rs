//! Per-cluster lock guard and the lock-stealing protocol.
//!
//! The lock row serializes every mutating operation and every poller
//! tick for one cluster. A holder that stops heartbeating is presumed
//! dead once its service record goes stale; waiting conductors then
//! take the lock over with a compare-and-swap on the previous holder,
//! so a crashed worker can never deadlock a cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use corral_common::{Error, Result, CONDUCTOR_BINARY};
use corral_store::SqliteStore;

use crate::context::Ctx;

/// Holds the cluster lock for the lifetime of the guard; released on drop.
#[derive(Debug)]
pub struct ClusterLockGuard {
    store: Arc<SqliteStore>,
    cluster_uuid: String,
    conductor_id: String,
}

impl ClusterLockGuard {
    /// Acquire the lock, waiting up to the configured bound.
    ///
    /// While waiting, the current holder's service record is checked
    /// each attempt; a stale holder is stolen from immediately. When
    /// the bound expires the caller gets `OperationInProgress` naming
    /// the holder.
    pub async fn acquire(ctx: &Ctx, cluster_uuid: &str) -> Result<Self> {
        Self::acquire_with_timeout(ctx, cluster_uuid, ctx.config.conductor.lock_acquire_timeout())
            .await
    }

    /// [`ClusterLockGuard::acquire`] with an explicit wait bound.
    pub async fn acquire_with_timeout(
        ctx: &Ctx,
        cluster_uuid: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(guard) = Self::try_acquire(ctx, cluster_uuid)? {
                return Ok(guard);
            }

            if tokio::time::Instant::now() >= deadline {
                let holder = ctx
                    .store
                    .get_cluster_lock(cluster_uuid)?
                    .map(|row| row.conductor_id)
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(Error::operation_in_progress(
                    cluster_uuid,
                    format!("locked by conductor {}", holder),
                ));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// One acquisition attempt, including the steal check. Returns
    /// None when another live conductor holds the lock.
    pub fn try_acquire(ctx: &Ctx, cluster_uuid: &str) -> Result<Option<Self>> {
        match ctx.store.take_cluster_lock(cluster_uuid, &ctx.conductor_id)? {
            None => {
                debug!(cluster = %cluster_uuid, conductor = %ctx.conductor_id, "acquired cluster lock");
                Ok(Some(Self {
                    store: ctx.store.clone(),
                    cluster_uuid: cluster_uuid.to_string(),
                    conductor_id: ctx.conductor_id.clone(),
                }))
            }
            Some(holder) if holder == ctx.conductor_id => {
                // Re-entry within one process is a logic error upstream;
                // treat the cluster as busy rather than double-locking.
                Ok(None)
            }
            Some(holder) => {
                if holder_is_dead(ctx, &holder)? {
                    // CAS on the previous holder: only one stealer wins
                    if ctx
                        .store
                        .steal_cluster_lock(cluster_uuid, &holder, &ctx.conductor_id)?
                    {
                        info!(
                            cluster = %cluster_uuid,
                            previous = %holder,
                            conductor = %ctx.conductor_id,
                            "stole cluster lock from dead conductor"
                        );
                        return Ok(Some(Self {
                            store: ctx.store.clone(),
                            cluster_uuid: cluster_uuid.to_string(),
                            conductor_id: ctx.conductor_id.clone(),
                        }));
                    }
                }
                Ok(None)
            }
        }
    }

    pub fn cluster_uuid(&self) -> &str {
        &self.cluster_uuid
    }
}

impl Drop for ClusterLockGuard {
    fn drop(&mut self) {
        match self
            .store
            .release_cluster_lock(&self.cluster_uuid, &self.conductor_id)
        {
            Ok(true) => {}
            Ok(false) => {
                // Stolen while held: our heartbeat must have stalled
                warn!(
                    cluster = %self.cluster_uuid,
                    conductor = %self.conductor_id,
                    "cluster lock was no longer held at release"
                );
            }
            Err(e) => {
                warn!(
                    cluster = %self.cluster_uuid,
                    error = %e,
                    "failed to release cluster lock"
                );
            }
        }
    }
}

/// A holder is dead when its service record is missing, forced down, or
/// has not heartbeated within the liveness window.
fn holder_is_dead(ctx: &Ctx, holder_conductor_id: &str) -> Result<bool> {
    let host = holder_conductor_id
        .split(':')
        .next()
        .unwrap_or(holder_conductor_id);
    let window = chrono::Duration::from_std(ctx.config.conductor.life_check_timeout())
        .map_err(|e| Error::internal("lock", e.to_string()))?;

    match ctx.store.get_service(host, CONDUCTOR_BINARY)? {
        None => Ok(true),
        Some(record) => {
            Ok(record.forced_down || Utc::now() - record.last_seen_up > window)
        }
    }
}
