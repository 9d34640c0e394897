//! tilestore CLI - Command-line interface
//!
//! Inspects and manipulates metatile storage through the same backends the
//! tile handlers and workers use.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tilestore::config::{self, DEFAULT_SECTION};
use tilestore::logging;
use tilestore::storage::registry;
use tracing::info;

use commands::common::{load_config, TileArgs};
use error::CliError;

#[derive(Parser)]
#[command(name = "tilestore")]
#[command(version = tilestore::VERSION)]
#[command(about = "Read and write rendered metatiles in tile storage", long_about = None)]
struct Cli {
    /// Config file (default: ~/.tilestore/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Config file section describing the storage backend
    #[arg(long, global = true, default_value = DEFAULT_SECTION)]
    section: String,

    /// Directory for the log file (default: ~/.tilestore/logs)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the storage key and metatile origin of a tile
    Key {
        #[command(flatten)]
        tile: TileArgs,
    },

    /// Fetch one tile from storage
    Get {
        #[command(flatten)]
        tile: TileArgs,

        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Fetch the raw metatile containing a tile
    GetMeta {
        #[command(flatten)]
        tile: TileArgs,

        /// Output file
        #[arg(long)]
        output: PathBuf,
    },

    /// Store a metatile blob for the metatile containing a tile
    PutMeta {
        #[command(flatten)]
        tile: TileArgs,

        /// Metatile file to store
        #[arg(long)]
        input: PathBuf,
    },

    /// Mark the metatile containing a tile for re-rendering
    Expire {
        #[command(flatten)]
        tile: TileArgs,
    },

    /// List the storage backends in this build
    Backends,

    /// Decode a serialized tile request and print it as JSON
    Decode {
        /// File holding one wire message
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        e.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let log_dir = cli.log_dir.unwrap_or_else(logging::default_log_dir);
    let _logging_guard = logging::init_logging(&log_dir, logging::default_log_file())
        .map_err(|e| CliError::LoggingInit(e.to_string()))?;
    info!("tilestore v{}", tilestore::VERSION);

    registry::register_builtin_backends()?;

    let config_path = cli.config.unwrap_or_else(config::config_file_path);
    let storage_config = || load_config(&config_path, &cli.section);

    match cli.command {
        Commands::Key { tile } => commands::key::run(&tile),
        Commands::Get { tile, output } => {
            commands::storage::get(&storage_config()?, &tile, output.as_deref())
        }
        Commands::GetMeta { tile, output } => {
            commands::storage::get_meta(&storage_config()?, &tile, &output)
        }
        Commands::PutMeta { tile, input } => {
            commands::storage::put_meta(&storage_config()?, &tile, &input)
        }
        Commands::Expire { tile } => commands::storage::expire(&storage_config()?, &tile),
        Commands::Backends => commands::storage::backends(),
        Commands::Decode { file } => commands::decode::run(&file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_get() {
        let cli = Cli::try_parse_from([
            "tilestore", "get", "--style", "osm", "--z", "12", "--x", "2051", "--y", "1363",
            "--format", "png,json", "--output", "tile.png",
        ])
        .unwrap();

        assert_eq!(cli.section, "storage");
        match cli.command {
            Commands::Get { tile, output } => {
                assert_eq!(tile.style, "osm");
                assert_eq!(tile.x, 2051);
                assert_eq!(tile.format, "png,json");
                assert_eq!(output, Some(PathBuf::from("tile.png")));
            }
            _ => panic!("expected get"),
        }
    }

    #[test]
    fn test_parse_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tilestore", "expire", "--style", "osm", "--z", "3", "--x", "1", "--y", "1",
            "--config", "/etc/tilestore.ini", "--section", "cache",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/tilestore.ini")));
        assert_eq!(cli.section, "cache");
        assert!(matches!(cli.command, Commands::Expire { .. }));
    }

    #[test]
    fn test_negative_coordinates_need_equals() {
        let cli = Cli::try_parse_from([
            "tilestore", "key", "--style", "osm", "--z", "3", "--x=-1", "--y=-9",
        ])
        .unwrap();
        match cli.command {
            Commands::Key { tile } => assert_eq!((tile.x, tile.y), (-1, -9)),
            _ => panic!("expected key"),
        }
    }

    #[test]
    fn test_missing_coordinates_rejected() {
        assert!(Cli::try_parse_from(["tilestore", "get", "--style", "osm"]).is_err());
    }
}
