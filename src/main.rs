use clap::Parser;
use telemetry_server::config::{Cli, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log_level.clone()))
        .init();

    let config = Config::try_from(cli)?;
    telemetry_server::supervisor::run(config).await
}
