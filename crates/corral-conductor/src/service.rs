//! Conductor worker identity and the service-record heartbeat.
//!
//! Each worker upserts its service record on an interval. Peers judge
//! lock-holder liveness from `last_seen_up`; a worker that stops
//! heartbeating forfeits its locks to the stealing protocol.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use corral_common::config::ConductorOpts;
use corral_common::CONDUCTOR_BINARY;
use corral_store::SqliteStore;

/// `host:suffix` identity for one worker process. The host half keys
/// the service record; the suffix distinguishes restarts.
pub fn generate_conductor_id(host: &str) -> String {
    let suffix = uuid::Uuid::new_v4().to_string();
    format!("{}:{}", host, &suffix[..8])
}

/// Start the heartbeat loop. The task runs until aborted.
pub fn spawn_heartbeat(store: Arc<SqliteStore>, opts: &ConductorOpts) -> JoinHandle<()> {
    let host = opts.hostname();
    let interval = opts.heartbeat_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.service_heartbeat(&host, CONDUCTOR_BINARY) {
                Ok(()) => debug!(host = %host, "service heartbeat"),
                Err(e) => warn!(host = %host, error = %e, "service heartbeat failed"),
            }
        }
    })
}
