//! Common types and utilities shared across CLI commands.

use std::path::Path;
use std::sync::Arc;

use clap::Args;
use tilestore::config::StorageConfig;
use tilestore::metatile::TileFormat;
use tilestore::request::{TileCommand, TileRequest};
use tilestore::storage::{self, StorageContext, TileStorage};
use tokio::runtime::Runtime;

use crate::error::CliError;

/// Tile coordinates shared by every storage command.
#[derive(Debug, Clone, Args)]
pub struct TileArgs {
    /// Style name
    #[arg(long)]
    pub style: String,

    /// Zoom level
    #[arg(long)]
    pub z: i32,

    /// Tile column
    #[arg(long)]
    pub x: i32,

    /// Tile row
    #[arg(long)]
    pub y: i32,

    /// Comma-separated formats (png, jpeg, gif, json)
    #[arg(long, default_value = "png")]
    pub format: String,
}

impl TileArgs {
    /// Build the request a storage command operates on.
    pub fn to_request(&self, command: TileCommand) -> Result<TileRequest, CliError> {
        let format = TileFormat::parse_list(&self.format)
            .map_err(|e| CliError::InvalidArgument(e.to_string()))?;
        if format.is_empty() {
            return Err(CliError::InvalidArgument(
                "at least one format is required".to_string(),
            ));
        }
        if self.style.is_empty() || self.style.contains('/') {
            return Err(CliError::InvalidArgument(format!(
                "style '{}' must be non-empty and contain no '/'",
                self.style
            )));
        }
        Ok(TileRequest::new(
            command, self.x, self.y, self.z, 0, &self.style, format,
        ))
    }
}

/// Load the storage section of the config file.
pub fn load_config(path: &Path, section: &str) -> Result<StorageConfig, CliError> {
    StorageConfig::load_from(path, section).map_err(|error| CliError::Config {
        path: path.to_path_buf(),
        error,
    })
}

/// Start the multi-threaded runtime used by storage commands.
pub fn runtime() -> Result<Runtime, CliError> {
    Runtime::new().map_err(CliError::Runtime)
}

/// Build the configured backend from the global registry.
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn TileStorage>, CliError> {
    let context = StorageContext::default();
    Ok(storage::create_storage(config, Some(&context)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(format: &str) -> TileArgs {
        TileArgs {
            style: "osm".to_string(),
            z: 12,
            x: 2051,
            y: 1363,
            format: format.to_string(),
        }
    }

    #[test]
    fn test_to_request() {
        let request = args("png,json").to_request(TileCommand::Render).unwrap();
        assert_eq!(request.format, TileFormat::PNG | TileFormat::JSON);
        assert_eq!(request.storage_key(), "/osm/12/2048/1360.png+json");
        assert_eq!(request.command, TileCommand::Render);
    }

    #[test]
    fn test_to_request_rejects_bad_format() {
        assert!(matches!(
            args("webp").to_request(TileCommand::Render),
            Err(CliError::InvalidArgument(_))
        ));
        assert!(matches!(
            args("").to_request(TileCommand::Render),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_to_request_rejects_bad_style() {
        let mut bad = args("png");
        bad.style = "a/b".to_string();
        assert!(bad.to_request(TileCommand::Render).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = load_config(&temp_dir.path().join("config.ini"), "storage");
        assert!(matches!(result, Err(CliError::Config { .. })));
    }
}
