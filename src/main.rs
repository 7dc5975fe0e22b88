use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod proxy;
mod rules;

#[derive(Parser)]
#[command(name = "detour")]
#[command(about = "Transparent TCP proxy routing redirected flows by TLS SNI or HTTP Host", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "proxy_config.yaml", value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings: Arc<config::Settings> = Arc::new(config::Settings::load(&cli.config)?);
    info!("starting proxy with config from {}", cli.config.display());

    let rules = Arc::new(rules::RuleSet::compile(&settings.rules));

    proxy::start(settings, rules).await
}
