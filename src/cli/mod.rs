//! CLI command definitions for rdc-config
//!
//! This module defines the CLI structure using clap's derive macros and
//! dispatches each subcommand to a [`ConfigStore`] operation. Results are
//! returned as JSON values for printing.

use crate::config::active_config_name;
use crate::error::{Result, StoreError};
use crate::store::ConfigStore;
use crate::types::ConfigDocument;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

/// Manage named config files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config directory (overrides REDIACC_CONFIG_DIR)
    #[arg(long, global = true)]
    pub config_dir: Option<String>,

    /// Active config name (overrides REDIACC_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List config names
    List,

    /// Create a config (defaults to the active name)
    Init { name: Option<String> },

    /// Print a config (defaults to the active name)
    Show { name: Option<String> },

    /// Set a field on the active config; the value is parsed as JSON when possible
    Set { key: String, value: String },

    /// Remove a field from the active config
    Unset { key: String },

    /// Delete a config
    Delete { name: String },

    /// Print the file path of a config
    Path { name: Option<String> },
}

/// Parse a CLI value as JSON, falling back to a plain string.
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn to_json(doc: &ConfigDocument) -> Result<Value> {
    serde_json::to_value(doc).map_err(StoreError::Serialize)
}

impl Cli {
    fn target(&self, name: Option<&str>) -> String {
        name.map(str::to_string)
            .unwrap_or_else(|| active_config_name(self.config.as_deref()))
    }

    /// Execute the subcommand against `store`.
    pub async fn run(&self, store: &ConfigStore) -> Result<Value> {
        match &self.command {
            Command::List => Ok(json!(store.list().await?)),
            Command::Init { name } => {
                let name = self.target(name.as_deref());
                let doc = store.init(&name).await?;
                to_json(&doc)
            }
            Command::Show { name } => {
                let name = self.target(name.as_deref());
                if !store.exists(&name).await? {
                    return Err(StoreError::NotFound { name });
                }
                let doc = store.load(&name).await?;
                to_json(&doc)
            }
            Command::Set { key, value } => {
                let name = self.target(None);
                let value = parse_value(value);
                let doc = store
                    .update(&name, |current| current.clone().with_field(key.as_str(), value))
                    .await?;
                to_json(&doc)
            }
            Command::Unset { key } => {
                let name = self.target(None);
                let doc = store
                    .update(&name, |current| current.clone().without_field(key))
                    .await?;
                to_json(&doc)
            }
            Command::Delete { name } => {
                store.delete(name).await?;
                Ok(json!({ "deleted": name }))
            }
            Command::Path { name } => {
                let name = self.target(name.as_deref());
                ConfigStore::validate_name(&name)?;
                Ok(json!(store.config_path(&name).display().to_string()))
            }
        }
    }
}
