pub mod config;
pub mod database;
pub mod migrations;

pub use config::{Config, GraphConfig, PayloadSource, SyncConfig};
pub use database::{BlobLoad, Database, SharedDatabase};

use std::path::PathBuf;

use crate::error::Result;

/// Returns `~/.config/calsync[-dev]/` based on CALSYNC_ENV.
///
/// Set CALSYNC_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("CALSYNC_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("calsync-dev")
    } else {
        base_dir.join("calsync")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
