use anyhow::Context;
use bf_core::FarmConfig;
use buildfarm_client::ControlClient;

use super::print_json;

fn client(config: &FarmConfig) -> anyhow::Result<ControlClient> {
    let endpoint = config.infra_endpoint()?;
    ControlClient::new(endpoint).with_context(|| format!("control endpoint {endpoint}"))
}

pub async fn status(config: &FarmConfig) -> anyhow::Result<()> {
    let status = client(config)?.status().await.context("remote status")?;
    print_json(&status)
}

pub async fn up(config: &FarmConfig, to: u32, force_update: bool) -> anyhow::Result<()> {
    let response = client(config)?
        .connect(Some(to), force_update)
        .await
        .context("remote up")?;
    print_json(&response)
}

pub async fn down(config: &FarmConfig, to: u32) -> anyhow::Result<()> {
    let report = client(config)?.down(to).await.context("remote down")?;
    print_json(&report)
}
