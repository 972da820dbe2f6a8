//! Provisioning commands run against the local state store.

use std::future::Future;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use bf_core::{AuthConfig, FarmConfig, ReconcileOutcome, maybe_put_object};
use buildfarm_reconcile::{TeardownReport, WaitPolicy};
use buildfarm_state::StateStore;
use tokio::sync::watch;
use tracing::info;

/// Inline JSON configuration for the daemon.
pub const INLINE_CONFIG_ENV: &str = "CONFIG";

/// Where a config came from, and so where it is written back.
pub enum ConfigSource {
    Inline,
    File(PathBuf),
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<(FarmConfig, ConfigSource)> {
    if let Some(path) = path {
        return Ok((FarmConfig::from_file(path)?, ConfigSource::File(path.to_path_buf())));
    }
    if let Ok(inline) = std::env::var(INLINE_CONFIG_ENV)
        && !inline.trim().is_empty()
    {
        let config = FarmConfig::from_json(&inline).context("parsing $CONFIG")?;
        return Ok((config, ConfigSource::Inline));
    }
    let path = FarmConfig::default_path()?;
    Ok((FarmConfig::from_file(&path)?, ConfigSource::File(path)))
}

/// Write `config` back to its file; an inline config is printed instead.
pub fn save_config(config: &FarmConfig, source: &ConfigSource) -> anyhow::Result<()> {
    match source {
        ConfigSource::File(path) => {
            config.write_to(path)?;
        }
        ConfigSource::Inline => println!("{}", config.to_json_pretty()?),
    }
    Ok(())
}

pub fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("buildfarm.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

/// Run `work` while a settle loop drives `store` forward.
pub async fn with_settle_loop<F: Future>(store: &StateStore, interval: Duration, work: F) -> F::Output {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let looping = store.clone();
    let handle = tokio::spawn(async move {
        looping.run_settle_loop(interval, shutdown_rx).await;
    });
    let output = work.await;
    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    output
}

fn wait_policy(interval: Duration) -> WaitPolicy {
    WaitPolicy {
        interval,
        ..WaitPolicy::default()
    }
}

pub async fn setup(
    store: &StateStore,
    config: &mut FarmConfig,
    endpoint: &str,
    interval: Duration,
) -> anyhow::Result<ReconcileOutcome> {
    let work = buildfarm_reconcile::setup(store, config, endpoint, wait_policy(interval));
    let outcome = with_settle_loop(store, interval, work).await?;
    Ok(outcome)
}

pub async fn teardown(store: &StateStore, config: &mut FarmConfig, interval: Duration) -> TeardownReport {
    let work = buildfarm_reconcile::teardown(store, config, wait_policy(interval));
    with_settle_loop(store, interval, work).await
}

/// Ask on the terminal before tearing down.
pub fn confirm_teardown(config: &FarmConfig) -> anyhow::Result<bool> {
    println!("Configuration is: {}", config.to_json_pretty()?);
    print!("Confirm tearing down the remote environment? [yes/No] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

/// Generate a credential bundle and store it where the simple
/// authenticator reads it. Returns the object version.
pub fn auth_generate(store: &StateStore, config: &FarmConfig) -> anyhow::Result<String> {
    let Some(AuthConfig::Simple { bucket, key }) = &config.auth else {
        bail!("no 'auth.simple' section in the config");
    };
    let bundle = buildfarm_auth::generate_bundle()?;
    let body = serde_json::to_vec_pretty(&bundle)?;
    let version = maybe_put_object(store, bucket, key, &body)?;
    info!(%bucket, %key, %version, "credential bundle stored");
    Ok(version)
}
