//! Audit notifications.
//!
//! Every mutating RPC emits exactly one event at entry
//! (outcome=pending) and one on synchronous completion or failure
//! (outcome=success|failure); the delete path emits its success from
//! the poller when DELETE completes. Publishing is fire-and-forget: a
//! failed or slow bus must never break an operation, so implementations
//! swallow their own errors.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use corral_common::{Error, RequestContext};

/// Event types emitted by the conductor.
pub mod events {
    pub const CLUSTER_CREATE: &str = "corral.cluster.create";
    pub const CLUSTER_UPDATE: &str = "corral.cluster.update";
    pub const CLUSTER_DELETE: &str = "corral.cluster.delete";
    pub const NODEGROUP_CREATE: &str = "corral.nodegroup.create";
    pub const NODEGROUP_UPDATE: &str = "corral.nodegroup.update";
    pub const NODEGROUP_DELETE: &str = "corral.nodegroup.delete";
    pub const TEMPLATE_CREATE: &str = "corral.cluster_template.create";
    pub const TEMPLATE_DELETE: &str = "corral.cluster_template.delete";
}

/// Outcome attached to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Fault details carried by failure notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub kind: String,
    pub message: String,
}

/// One structured audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: String,
    pub outcome: Outcome,
    pub project_id: String,
    pub user_id: String,
    /// Uuid of the cluster/nodegroup/template the event is about
    pub resource_uuid: Option<String>,
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    pub emitted_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        event_type: &str,
        outcome: Outcome,
        ctx: &RequestContext,
        resource_uuid: Option<&str>,
        resource_name: Option<&str>,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            outcome,
            project_id: ctx.project_id.clone(),
            user_id: ctx.user_id.clone(),
            resource_uuid: resource_uuid.map(str::to_string),
            resource_name: resource_name.map(str::to_string),
            fault: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn with_fault(mut self, error: &Error) -> Self {
        self.fault = Some(Fault {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        self
    }
}

/// Publisher of audit notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish one event; never fails.
    async fn notify(&self, notification: Notification);
}

/// Publisher that logs events through tracing (dev mode default).
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        match serde_json::to_string(&notification) {
            Ok(payload) => info!(target: "corral::notifications", %payload, "event"),
            Err(e) => warn!(error = %e, "failed to serialize notification"),
        }
    }
}

/// Publisher that drops everything.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: Notification) {}
}

/// Publisher that buffers events in memory so tests can assert on the
/// exact sequence the conductor emitted.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    /// (event_type, outcome) pairs in emission order.
    pub fn sequence(&self) -> Vec<(String, Outcome)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|n| (n.event_type.clone(), n.outcome))
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.events.lock().unwrap().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        let ctx = RequestContext::new("p1", "u1");
        notifier
            .notify(Notification::new(
                events::CLUSTER_CREATE,
                Outcome::Pending,
                &ctx,
                Some("c-1"),
                Some("k1"),
            ))
            .await;
        notifier
            .notify(
                Notification::new(
                    events::CLUSTER_CREATE,
                    Outcome::Failure,
                    &ctx,
                    Some("c-1"),
                    Some("k1"),
                )
                .with_fault(&Error::quota_exceeded("p1", "Cluster", 2)),
            )
            .await;

        let sequence = notifier.sequence();
        assert_eq!(
            sequence,
            vec![
                (events::CLUSTER_CREATE.to_string(), Outcome::Pending),
                (events::CLUSTER_CREATE.to_string(), Outcome::Failure),
            ]
        );
        let fault = notifier.events()[1].fault.clone().unwrap();
        assert_eq!(fault.kind, "QuotaExceeded");
    }
}
