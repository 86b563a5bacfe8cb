//! volmgrd - volume host agent daemon
//!
//! Attaches qcow2-backed volumes to running QEMU guests over QMP and tracks
//! their serials in Redis.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use volmgr_common::{
    ImageManager, KvStore, MemoryStore, QmpChannel, RedisStore, VolumeOrchestrator,
};
use volmgrd::{create_router, VolmgrConfig, DEFAULT_CONFIG_PATH};

/// Volume host agent
#[derive(Parser, Debug)]
#[command(name = "volmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen address, overrides the configuration file
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error), RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Keep bindings in process memory instead of Redis (single node only)
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting volmgrd ---");

    match run(args).await {
        Ok(()) => {
            info!("volmgrd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("volmgrd exiting with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = VolmgrConfig::load_or_default(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    config.validate()?;

    let store: Arc<dyn KvStore> = if args.memory_store {
        warn!("Using in-memory store, serials are lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        let redis = config.redis_config();
        Arc::new(
            RedisStore::connect(&redis)
                .await
                .with_context(|| format!("connecting to {}", redis.uri()))?,
        )
    };

    let channel = Arc::new(QmpChannel::new(config.qmp_config()));
    let images = ImageManager::new(&config.storage.disk_root, config.capacity_limits());
    info!(
        disk_root = %config.storage.disk_root.display(),
        socket_dir = %config.hypervisor.socket_dir.display(),
        "Volume orchestrator configured"
    );
    let orchestrator =
        VolumeOrchestrator::with_settings(store, channel, images, config.orchestrator_settings());

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "Listening");

    axum::serve(listener, create_router(orchestrator))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
