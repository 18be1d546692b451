//! Shared conductor context.
//!
//! One `Ctx` per worker process, shared by the RPC entry points, the
//! pollers, and the heartbeat task. It holds everything expensive or
//! global: the store, the driver registry, client handles, typed
//! configuration, and this worker's identity. Nothing else in the crate
//! reads configuration or environment directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::debug;

use corral_cloud::{LoadBalancerClient, NetworkClient};
use corral_common::config::CorralConfig;
use corral_driver::{DriverRegistry, NoopScaleManager, ScaleManager};
use corral_store::SqliteStore;
use corral_trust::TrustCertManager;

use crate::notify::{LogNotifier, Notification, Notifier};

/// Live poller tasks, keyed by entity uuid.
///
/// Registering a poller for an entity that already has one replaces
/// (and aborts) the old task: a DELETE submitted while a CREATE is
/// still converging takes over observation of the same cluster.
/// Generations keep a finishing task from unregistering its successor.
#[derive(Default)]
pub struct PollerSet {
    tasks: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl PollerSet {
    /// Reserve a generation token for a poller about to spawn.
    pub fn next_generation(&self) -> u64 {
        self.next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn register(&self, key: &str, generation: u64, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some((_, previous)) = tasks.insert(key.to_string(), (generation, handle)) {
            previous.abort();
            debug!(entity = %key, "replaced existing poller");
        }
    }

    /// Remove the entry only if it still belongs to `generation`.
    pub fn unregister(&self, key: &str, generation: u64) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.get(key).is_some_and(|(gen, _)| *gen == generation) {
            tasks.remove(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().unwrap().is_empty()
    }

    /// Abort every poller (process shutdown).
    pub fn abort_all(&self) {
        for (_, (_, handle)) in self.tasks.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

/// Shared state for one conductor worker.
pub struct Ctx {
    pub store: Arc<SqliteStore>,
    pub registry: Arc<DriverRegistry>,
    pub trust: Arc<TrustCertManager>,
    pub network: Arc<dyn NetworkClient>,
    pub loadbalancer: Arc<dyn LoadBalancerClient>,
    pub notifier: Arc<dyn Notifier>,
    pub scale_manager: Arc<dyn ScaleManager>,
    pub config: CorralConfig,
    /// `host:suffix`; the host half must match this worker's service
    /// record so peers can judge lock-holder liveness
    pub conductor_id: String,
    pub pollers: PollerSet,
}

impl Ctx {
    pub fn builder() -> CtxBuilder {
        CtxBuilder::default()
    }

    /// Host component of this worker's conductor id.
    pub fn host(&self) -> &str {
        self.conductor_id
            .split(':')
            .next()
            .unwrap_or(&self.conductor_id)
    }

    /// Fire-and-forget notification emission.
    pub async fn notify(&self, notification: Notification) {
        self.notifier.notify(notification).await;
    }
}

/// Builder for [`Ctx`].
#[derive(Default)]
pub struct CtxBuilder {
    store: Option<Arc<SqliteStore>>,
    registry: Option<Arc<DriverRegistry>>,
    trust: Option<Arc<TrustCertManager>>,
    network: Option<Arc<dyn NetworkClient>>,
    loadbalancer: Option<Arc<dyn LoadBalancerClient>>,
    notifier: Option<Arc<dyn Notifier>>,
    scale_manager: Option<Arc<dyn ScaleManager>>,
    config: Option<CorralConfig>,
    conductor_id: Option<String>,
}

impl CtxBuilder {
    pub fn store(mut self, store: Arc<SqliteStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<DriverRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn trust(mut self, trust: Arc<TrustCertManager>) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkClient>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn loadbalancer(mut self, loadbalancer: Arc<dyn LoadBalancerClient>) -> Self {
        self.loadbalancer = Some(loadbalancer);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn scale_manager(mut self, scale_manager: Arc<dyn ScaleManager>) -> Self {
        self.scale_manager = Some(scale_manager);
        self
    }

    pub fn config(mut self, config: CorralConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn conductor_id(mut self, conductor_id: impl Into<String>) -> Self {
        self.conductor_id = Some(conductor_id.into());
        self
    }

    pub fn build(self) -> Ctx {
        let config = self.config.unwrap_or_default();
        let conductor_id = self
            .conductor_id
            .unwrap_or_else(|| crate::service::generate_conductor_id(&config.conductor.hostname()));
        Ctx {
            store: self.store.expect("store is required"),
            registry: self.registry.expect("registry is required"),
            trust: self.trust.expect("trust manager is required"),
            network: self.network.expect("network client is required"),
            loadbalancer: self.loadbalancer.expect("loadbalancer client is required"),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            scale_manager: self
                .scale_manager
                .unwrap_or_else(|| Arc::new(NoopScaleManager)),
            config,
            conductor_id,
            pollers: PollerSet::default(),
        }
    }
}
