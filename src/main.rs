//! rdc-config
//!
//! Command-line access to the versioned config store.

use anyhow::Result;
use clap::Parser;
use rdc_config_store::ConfigStore;
use rdc_config_store::cli::Cli;
use rdc_config_store::config::StoreConfig;
use rdc_config_store::error::ErrorBody;
use rdc_config_store::logging::{LogTarget, init_logging};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init_logging(&LogTarget::parse(&cli.log), cli.verbose)?;

    let mut config = StoreConfig::load_or_default()?;
    if let Some(dir) = &cli.config_dir {
        config.config_dir = PathBuf::from(dir);
    }
    debug!(dir = %config.config_dir.display(), "Using config directory");

    let store = ConfigStore::open(&config);
    match cli.run(&store).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            let body = ErrorBody::from(&err);
            eprintln!("{}", serde_json::to_string_pretty(&body)?);
            Ok(ExitCode::FAILURE)
        }
    }
}
