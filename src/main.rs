use std::sync::Arc;

use axum::Router;
use clap::Parser;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kv_tier::cache::codec::BlockCodec;
use kv_tier::cache::l1::L1Cache;
use kv_tier::cache::manager::TieredCacheManager;
use kv_tier::cluster::connector::L2Connector;
use kv_tier::cluster::controller::Controller;
use kv_tier::cluster::store::BlockStore;
use kv_tier::cluster::topology::HttpTopologyClient;
use kv_tier::cluster::transport::HttpTransport;
use kv_tier::config::{Cli, Config, Role};
use kv_tier::server::cache_api::{self, AppState};
use kv_tier::server::controller_api;
use kv_tier::server::storage_node::{self, StorageNodeState};
use kv_tier::transfer::device::{DeviceMemory, HostPool};
use kv_tier::transfer::handler::{HostTransferHandler, TransferHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_tier=debug,tower_http=debug"
    } else {
        "kv_tier=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-tier v{} ({:?})", env!("CARGO_PKG_VERSION"), cli.role);

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let listen = config.listen_for(cli.role, cli.listen.as_deref());

    let cancel = CancellationToken::new();
    tokio::spawn(watch_ctrl_c(cancel.clone()));

    match cli.role {
        Role::Sidecar => run_sidecar(&config, &listen, cancel).await,
        Role::Controller => run_controller(&config, &listen, cancel).await,
        Role::StorageNode => run_storage_node(&config, &listen, cancel).await,
    }
}

async fn watch_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, graceful shutdown disabled"),
    }
}

async fn run_sidecar(config: &Config, listen: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let sidecar = &config.sidecar;
    info!(
        l1_capacity = sidecar.l1_capacity_bytes,
        tiering = ?sidecar.tiering,
        devices = config.devices.count,
        controller = %config.connector.controller_addr,
        "Sidecar configuration loaded"
    );

    let devices = Arc::new(DeviceMemory::new(config.devices.count, config.devices.memory_bytes));
    let pool = Arc::new(HostPool::new(usize::try_from(sidecar.l1_capacity_bytes)?));
    let transfer: Arc<dyn TransferHandler> = Arc::new(HostTransferHandler::new(devices, pool));

    let topology = Arc::new(HttpTopologyClient::new(
        &config.connector.controller_addr,
        config.connector.request_timeout(),
    )?);
    let transport = Arc::new(HttpTransport::new(config.connector.request_timeout()));
    let l2 = Arc::new(
        L2Connector::new(config.ring.virtual_nodes, transport, topology)
            .with_codec(BlockCodec::new(sidecar.compress_l2, sidecar.zstd_level)),
    );
    l2.initialize().await;
    let refresh = tokio::spawn(
        l2.clone()
            .run_refresh_loop(config.connector.refresh_interval(), cancel.clone()),
    );

    let l1 = Arc::new(L1Cache::new(sidecar.l1_capacity_bytes, transfer.clone()));
    let mut manager = TieredCacheManager::new(l1, l2, transfer, sidecar.tiering);
    if let Some(timeout) = sidecar.op_timeout() {
        manager = manager.with_default_timeout(timeout);
    }

    let app = cache_api::build_router(Arc::new(AppState::new(Arc::new(manager))));
    serve(listen, app, cancel.clone()).await?;
    shutdown(cancel, vec![refresh]).await;
    Ok(())
}

async fn run_controller(config: &Config, listen: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let cfg = &config.controller;
    let controller = Arc::new(Controller::with_seed_nodes(
        cfg.heartbeat_timeout(),
        cfg.seed_nodes.clone(),
    ));
    let health = tokio::spawn(
        controller
            .clone()
            .run_health_loop(cfg.health_check_interval(), cancel.clone()),
    );

    serve(listen, controller_api::build_router(controller), cancel.clone()).await?;
    shutdown(cancel, vec![health]).await;
    Ok(())
}

async fn run_storage_node(config: &Config, listen: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let cfg = &config.storage_node;
    let node = cfg.advertised_node();
    info!(node = %node, max_bytes = cfg.max_bytes, "Storage node configuration loaded");

    let client = HttpTopologyClient::new(&cfg.controller_addr, config.connector.request_timeout())?;
    let heartbeat = tokio::spawn(storage_node::run_heartbeat_loop(
        client,
        node,
        cfg.heartbeat_interval(),
        cancel.clone(),
    ));

    let state = Arc::new(StorageNodeState {
        node_id: cfg.node_id.clone(),
        store: Arc::new(BlockStore::new(cfg.max_bytes)),
    });
    serve(listen, storage_node::build_router(state), cancel.clone()).await?;
    shutdown(cancel, vec![heartbeat]).await;
    Ok(())
}

async fn serve(listen: &str, app: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("Listening on {listen}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Stop background loops and wait for them to wind down.
async fn shutdown(cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) {
    cancel.cancel();
    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Background task failed");
        }
    }
    info!("Shutdown complete");
}
