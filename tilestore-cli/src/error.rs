//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and a non-zero exit code.

use std::fmt;
use std::path::PathBuf;
use std::process;

use tilestore::config::ConfigError;
use tilestore::request::WireError;
use tilestore::storage::StorageError;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(String),
    /// Failed to start the async runtime
    Runtime(std::io::Error),
    /// Configuration file could not be loaded
    Config { path: PathBuf, error: ConfigError },
    /// A command-line value is invalid
    InvalidArgument(String),
    /// Storage backend could not be created
    Storage(StorageError),
    /// The tile or metatile was not found in storage
    NotFound(String),
    /// The backend rejected an operation
    OperationFailed(String),
    /// A wire message could not be decoded
    Decode(WireError),
    /// Failed to read an input file
    FileRead { path: PathBuf, error: std::io::Error },
    /// Failed to write an output file
    FileWrite { path: PathBuf, error: std::io::Error },
}

impl CliError {
    /// Exit the process with an error message and status 1.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Config { path, .. } => {
                eprintln!();
                eprintln!("Create {} with a section like:", path.display());
                eprintln!("  [storage]");
                eprintln!("  type = disk");
                eprintln!("  directory = /var/lib/tilestore");
            }
            CliError::Storage(StorageError::UnknownBackend(_)) => {
                eprintln!();
                eprintln!("Run 'tilestore backends' to list the backends in this build.");
            }
            _ => {}
        }

        process::exit(1)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(msg) => write!(f, "Failed to initialize logging: {}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start runtime: {}", e),
            CliError::Config { path, error } => {
                write!(f, "Configuration error in '{}': {}", path.display(), error)
            }
            CliError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            CliError::Storage(e) => write!(f, "Failed to open storage: {}", e),
            CliError::NotFound(what) => write!(f, "Not found: {}", what),
            CliError::OperationFailed(what) => write!(f, "Storage operation failed: {}", what),
            CliError::Decode(e) => write!(f, "Failed to decode message: {}", e),
            CliError::FileRead { path, error } => {
                write!(f, "Failed to read file '{}': {}", path.display(), error)
            }
            CliError::FileWrite { path, error } => {
                write!(f, "Failed to write file '{}': {}", path.display(), error)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Runtime(e) => Some(e),
            CliError::Config { error, .. } => Some(error),
            CliError::Storage(e) => Some(e),
            CliError::Decode(e) => Some(e),
            CliError::FileRead { error, .. } => Some(error),
            CliError::FileWrite { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<StorageError> for CliError {
    fn from(e: StorageError) -> Self {
        CliError::Storage(e)
    }
}

impl From<WireError> for CliError {
    fn from(e: WireError) -> Self {
        CliError::Decode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display_messages() {
        let err = CliError::NotFound("/osm/12/2048/1360.png".to_string());
        assert_eq!(err.to_string(), "Not found: /osm/12/2048/1360.png");

        let err = CliError::from(StorageError::UnknownBackend("riak".to_string()));
        assert_eq!(
            err.to_string(),
            "Failed to open storage: Unknown storage backend 'riak'"
        );
    }

    #[test]
    fn test_source_chain() {
        let err = CliError::FileWrite {
            path: PathBuf::from("/tmp/out"),
            error: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.source().is_some());
        assert!(CliError::InvalidArgument("x".to_string()).source().is_none());
    }
}
