//! Versioned config store with re-entrant file locking.
//!
//! This module exports the core components for the `rdc-config` binary,
//! tests and embedding CLIs.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod types;

pub use error::{ErrorCode, Result, StoreError};
pub use store::ConfigStore;
pub use types::{ConfigDocument, DEFAULT_CONFIG_NAME};
