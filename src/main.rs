use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nutrisync::cli::{self, Cli};
use nutrisync::config::Config;
use nutrisync::Dashboard;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config)?;
    cli.apply_overrides(&mut config);

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!(
        api = %config.api.base_url,
        "Starting nutrisync v{}",
        env!("CARGO_PKG_VERSION")
    );

    let dashboard = Dashboard::from_config(&config)?;
    cli::run_command(&cli, &dashboard).await
}
