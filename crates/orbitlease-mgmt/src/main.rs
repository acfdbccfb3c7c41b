use anyhow::Result;
use clap::Parser;
use orbitlease_mgmt::cli::{Cli, Command};
use orbitlease_mgmt::{LogFormat, MgmtConfig};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

fn load_config(path: &Path) -> Result<(MgmtConfig, bool)> {
    if path.exists() {
        Ok((MgmtConfig::from_file(path)?, true))
    } else {
        Ok((MgmtConfig::default(), false))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Serve { config } => {
            let (mgmt_config, found) = load_config(config)?;
            init_tracing(mgmt_config.log_format);
            if !found {
                tracing::warn!("Config file not found, using defaults: {}", config.display());
            }
            tracing::info!("Orbitlease management server starting...");
            orbitlease_mgmt::serve(mgmt_config).await
        }
        _ => {
            init_tracing(LogFormat::Text);
            cli.run().await
        }
    }
}
