//! bfd: the build farm daemon.
//!
//! Owns the local control plane (a redb state store) and exposes the
//! control endpoint on top of it:
//! - `serve` runs the API together with the settle loop
//! - `setup` / `teardown` provision and remove the shared infrastructure
//! - `auth generate` uploads a fresh credential bundle
//!
//! The state store is locked by one process at a time, so `setup` and
//! `teardown` drive their own settle loop instead of relying on `serve`.
//!
//! # Usage
//!
//! ```text
//! bfd setup --config ~/.bazel_bf/config.json --endpoint http://10.0.0.5:8080
//! bfd serve --config ~/.bazel_bf/config.json --port 8080
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

mod ops;

#[derive(Parser)]
#[command(name = "bfd", about = "Build farm daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct StoreArgs {
    /// Config file; `CONFIG` (inline JSON) is used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the state store.
    #[arg(long, default_value = "/var/lib/buildfarm")]
    data_dir: PathBuf,

    /// Settle loop interval in milliseconds.
    #[arg(long, default_value = "1000")]
    settle_interval_ms: u64,
}

impl StoreArgs {
    fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms.max(1))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve the control endpoint.
    Serve {
        #[command(flatten)]
        store: StoreArgs,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Set up the shared infrastructure and record it in the config.
    Setup {
        #[command(flatten)]
        store: StoreArgs,

        /// Control endpoint URL recorded for clients.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
    },
    /// Tear down the farm entirely.
    Teardown {
        #[command(flatten)]
        store: StoreArgs,

        /// Do not ask for confirmation.
        #[arg(long)]
        force: bool,
    },
    /// Manage farm credentials.
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Generate a credential bundle and store it at `auth.simple`.
    Generate {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,bfd=debug,buildfarm=debug")
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { store, port } => run_serve(store, port).await,
        Command::Setup { store, endpoint } => {
            let (mut config, source) = ops::load_config(store.config.as_deref())?;
            let state = ops::open_store(&store.data_dir)?;
            ops::setup(&state, &mut config, &endpoint, store.settle_interval()).await?;
            ops::save_config(&config, &source)
        }
        Command::Teardown { store, force } => {
            let (mut config, source) = ops::load_config(store.config.as_deref())?;
            if !force && !ops::confirm_teardown(&config)? {
                anyhow::bail!("Abort!");
            }
            let state = ops::open_store(&store.data_dir)?;
            let report = ops::teardown(&state, &mut config, store.settle_interval()).await;
            ops::save_config(&config, &source)?;
            if !report.is_clean() {
                anyhow::bail!(
                    "errors were encountered during tear down: some resources might not have been properly deleted"
                );
            }
            Ok(())
        }
        Command::Auth {
            action: AuthAction::Generate { store },
        } => {
            let (config, _) = ops::load_config(store.config.as_deref())?;
            let state = ops::open_store(&store.data_dir)?;
            let version = ops::auth_generate(&state, &config)?;
            println!("{version}");
            Ok(())
        }
    }
}

async fn run_serve(store: StoreArgs, port: u16) -> anyhow::Result<()> {
    info!("build farm daemon starting");

    let (config, _) = ops::load_config(store.config.as_deref())?;
    if config.cluster.is_none() {
        warn!("farm is not set up; run `bfd setup` first");
    }
    let state = ops::open_store(&store.data_dir)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Settle loop ────────────────────────────────────────────

    let settle_state = state.clone();
    let interval = store.settle_interval();
    let settle_handle = tokio::spawn(async move {
        settle_state.run_settle_loop(interval, shutdown_rx).await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = buildfarm_api::build_router(buildfarm_api::ApiState::new(Arc::new(state), config));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "control endpoint starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for CTRL+C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = settle_handle.await;
    info!("build farm daemon stopped");
    Ok(())
}
