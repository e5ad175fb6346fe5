/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::utils::LogFormat;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "roleback")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.config/roleback/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dump databases, archive volumes and binds, hand the run to the sink
    Backup,

    /// Retrieve a run archive from the sink
    Extract {
        /// Snapshot id printed by `backup`
        #[arg(short, long)]
        snapshot: String,

        /// Archive name (default: the one tagged on the snapshot)
        #[arg(short, long)]
        name: Option<String>,

        /// Destination directory
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Print restore instructions for an extracted archive
    Guide {
        /// Directory the archive was extracted into
        #[arg(short, long)]
        extracted: PathBuf,

        /// Catalog to read (default: <extracted>/catalog.json)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// List running workloads with their classification and resources
    Inspect {
        /// Show environment values unmasked
        #[arg(long)]
        show_secrets: bool,
    },

    /// Print the database engine detected for an image reference
    Classify { image: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,
}
