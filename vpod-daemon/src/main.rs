//! vpod-daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpod_daemon::api::{AppState, create_router};
use vpod_daemon::config::DaemonConfig;
use vpod_daemon::migrate::MigrateController;
use vpod_daemon::registry::PodRegistry;
use vpod_daemon::store::KvStore;
use vpod_daemon::run_lifecycle;
use vpod_vmm::device::{DmPool, HostProvisioner, NetworkPool};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hypervisor-based pod runtime daemon.
#[derive(Parser)]
#[command(name = "vpod-daemon")]
#[command(version = VERSION)]
#[command(about = "Runs application pods inside dedicated micro-VMs")]
struct Args {
    /// Path to a JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the API listen address
    #[arg(long)]
    listen: Option<String>,

    /// Override the state root directory
    #[arg(long)]
    state_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(state_root) = args.state_root {
        config.state_root = state_root;
    }
    let config = Arc::new(config);

    info!(version = VERSION, state_root = %config.state_root.display(), "vpod-daemon starting");
    tokio::fs::create_dir_all(&config.state_root)
        .await
        .context("creating state root")?;

    let store = Arc::new(
        KvStore::open(&config.state_root)
            .await
            .context("opening store")?,
    );
    let network = Arc::new(
        NetworkPool::init(&config.bridge, &config.bridge_cidr)
            .await
            .context("setting up pod bridge")?,
    );
    let storage = Arc::new(DmPool::new(
        &config.state_root,
        &config.pool_name,
        &config.dev_prefix,
        config.device_size,
    ));
    let provisioner = Arc::new(HostProvisioner {
        storage: storage.clone(),
        network: network.clone(),
    });

    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(128);
    let registry = Arc::new(PodRegistry::new(
        store.clone(),
        config.clone(),
        provisioner.clone(),
        lifecycle_tx,
    ));
    registry.recover().await.context("recovering pods")?;
    tokio::spawn(run_lifecycle(registry.clone(), lifecycle_rx));

    let migrate = Arc::new(MigrateController::new(
        registry.clone(),
        store,
        config.clone(),
        storage,
        network,
        provisioner,
    ));

    let state = Arc::new(AppState {
        registry,
        migrate,
    });
    let router = create_router(state);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(listen = %config.listen, "api ready");
    axum::serve(listener, router).await.context("api server")?;
    Ok(())
}
