//! Corral conductor - container-cluster lifecycle service worker

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use corral_cloud::memory::{
    MemoryIdentity, MemoryLoadBalancers, MemoryNetwork, MemorySecretStore,
};
use corral_common::config::CorralConfig;
use corral_common::telemetry::{init_telemetry, TelemetryConfig};
use corral_conductor::poller::recover_pollers;
use corral_conductor::service::spawn_heartbeat;
use corral_conductor::{Conductor, Ctx};
use corral_driver::stack::engine::InMemoryStackEngine;
use corral_driver::stack::StackDriver;
use corral_driver::DriverRegistry;
use corral_store::SqliteStore;
use corral_trust::TrustCertManager;

/// Corral conductor worker
#[derive(Parser, Debug)]
#[command(name = "corral-conductor", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the SQLite database (":memory:" stays in-process)
    #[arg(long, default_value = "corral.db")]
    db: PathBuf,

    /// Run with in-process cloud backends (no external services needed)
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CorralConfig::from_file(path)?,
        None => CorralConfig::default(),
    };

    init_telemetry(TelemetryConfig {
        service_name: "corral-conductor".to_string(),
        ..Default::default()
    })?;

    let store = Arc::new(if cli.db.as_os_str() == ":memory:" {
        SqliteStore::in_memory()?
    } else {
        SqliteStore::open(&cli.db)?
    });

    // The bus transport and the REST clients for the real cloud
    // services are deployment concerns wired in by the operator build;
    // this binary ships the in-process backends for development and CI.
    if !cli.dev {
        tracing::warn!("no external backends configured; continuing with in-process backends");
    }
    let identity = Arc::new(MemoryIdentity::new());
    let secrets = Arc::new(MemorySecretStore::new());
    let network = Arc::new(MemoryNetwork::new());
    let loadbalancers = Arc::new(MemoryLoadBalancers::new());
    let engine = Arc::new(InMemoryStackEngine::new(3));

    let trust = Arc::new(TrustCertManager::new(
        identity,
        secrets,
        store.clone(),
        config.certificates.clone(),
        config.trust.clone(),
    ));

    let registry = Arc::new(
        DriverRegistry::builder()
            .with_opts(&config.drivers)
            .register(Arc::new(StackDriver::kubernetes(
                engine.clone(),
                config.cluster.stack_name_prefix.clone(),
            )))
            .register(Arc::new(StackDriver::swarm(
                engine,
                config.cluster.stack_name_prefix.clone(),
            )))
            .build()?,
    );

    let conductor_opts = config.conductor.clone();
    let ctx = Arc::new(
        Ctx::builder()
            .store(store.clone())
            .registry(registry)
            .trust(trust)
            .network(network)
            .loadbalancer(loadbalancers)
            .config(config)
            .build(),
    );

    let conductor = Conductor::new(ctx.clone());
    info!(
        conductor_id = %ctx.conductor_id,
        drivers = ctx.registry.enumerate().len(),
        "conductor starting"
    );

    let heartbeat = spawn_heartbeat(store, &conductor_opts);
    recover_pollers(&ctx)?;

    // Serve until interrupted. The bus listener would feed
    // `conductor.dispatch(envelope)` here.
    let _ = conductor.ping_conductor().await;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    heartbeat.abort();
    ctx.pollers.abort_all();
    Ok(())
}
