use anyhow::Context;
use clap::Parser;

use kubeconfig_fanout::{discovery, session::KubeConnector, Settings, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::parse();
    let policy = settings
        .filter_policy()
        .context("failed to load filter policy")?;

    let discovery = discovery::watch(&settings.root, settings.suffix.clone())
        .with_context(|| format!("failed to watch {}", settings.root.display()))?;
    let supervisor = Supervisor::new(KubeConnector, policy, settings.sink());

    kubeconfig_fanout::run(&supervisor, discovery, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for shutdown signal: {err}");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    log::info!("Stopped");
    Ok(())
}
