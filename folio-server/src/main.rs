use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use folio_config::AppConfig;

#[derive(Parser)]
#[command(name = "folio-server", about = "Real-time portfolio analysis backend", version)]
struct Cli {
    /// Path to the configuration file (falls back to ./folio.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    folio_server::telemetry::init_tracing(&config.log_level)?;
    folio_server::app::run(config).await
}
