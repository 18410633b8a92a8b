//! Aegis agent entrypoint: registers this host, runs the collectors and
//! forwards their findings until Ctrl+C or a termination signal.

use aegis_agent::{
    collectors, Agent, AgentConfig, ApiClient, EventQueue, HttpApiClient, NodeManager,
    PolicyStore, ShutdownSignal, StructuredLogger,
};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

fn detect_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = AgentConfig::default_path();
    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    StructuredLogger::init(&config.log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        platform = detect_platform(),
        config = %config_path.display(),
        "Aegis agent starting"
    );

    config.validate()?;

    let api: Arc<dyn ApiClient> =
        Arc::new(HttpApiClient::new(&config.server).context("building HTTP client")?);
    let policy = Arc::new(PolicyStore::from_config(&config.policy));
    let queue = Arc::new(EventQueue::new());
    let node = Arc::new(NodeManager::new(&config.node, Arc::clone(&api)));
    let collectors = collectors::build_default(&config.collectors, &queue, &policy);
    let agent = Agent::new(config.monitoring.clone(), node, api, queue, collectors);

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            shutdown.trigger();
        })
        .context("installing signal handler")?;
    }

    let result = agent.run(shutdown.clone()).await;
    shutdown.trigger();
    agent.stop().await;
    result?;

    info!("Aegis agent stopped");
    Ok(())
}
