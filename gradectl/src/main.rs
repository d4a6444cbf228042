use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gradectl::config::{Args, Config};
use gradectl::grading::daemon::GradingDaemon;
use gradectl::grading::provider::OpenRouterClient;
use gradectl::storage::in_memory::InMemoryStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gradectl=info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args).map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    if args.validate {
        println!("configuration OK");
        return Ok(());
    }

    tracing::info!(
        grading_cost = %config.credits.grading_cost,
        testing_mode = config.grading.testing_mode,
        "starting grading worker"
    );

    let storage = Arc::new(InMemoryStorage::new());
    let client = Arc::new(OpenRouterClient::new(config.provider.clone()));
    let daemon = Arc::new(GradingDaemon::new(
        storage,
        client,
        config.grading.clone(),
        config.daemon.clone(),
    ));

    daemon.run().await?;
    Ok(())
}
