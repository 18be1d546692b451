//! The Corral conductor.
//!
//! A pool of conductor processes drives clusters through long-running
//! state transitions: RPC entry points submit work to drivers under
//! per-cluster locks, reconciliation pollers observe convergence, and
//! the pre-deletion path reclaims tenant resources before a stack is
//! destroyed. All coordination between processes goes through the
//! object store.

pub mod conductor;
pub mod context;
pub mod federation;
pub mod lock;
pub mod notify;
pub mod poller;
pub mod quota;
pub mod reclaim;
pub mod rpc;
pub mod service;

pub use conductor::{
    ClusterCreateRequest, ClusterUpdate, Conductor, NodeGroupCreateRequest, NodeGroupUpdate,
    ResizeRequest, UpgradeRequest,
};
pub use context::{Ctx, CtxBuilder};
pub use notify::{Notification, Notifier, Outcome};
pub use poller::PollOutcome;
