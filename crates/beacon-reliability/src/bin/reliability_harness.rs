use anyhow::Result;
use beacon_reliability::cli::{self, HarnessCli};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = HarnessCli::parse();
    cli::run(cli).await?;
    Ok(())
}
