//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Warden - task worker resource layer
///
/// Inspects and maintains the caches, downloads and port blocks a task
/// worker keeps between tasks.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and maintain the cache tables
    Cache(CacheArgs),

    /// Show or initialise configuration
    Config(ConfigArgs),

    /// Show the port block of every task slot
    Ports(PortsArgs),
}

/// Output format for list commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Which cache table a command applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TableKind {
    /// Downloaded files
    Files,
    /// Writable directory caches
    Directories,
    /// Both tables
    All,
}

impl TableKind {
    pub fn includes_files(self) -> bool {
        matches!(self, Self::Files | Self::All)
    }

    pub fn includes_directories(self) -> bool {
        matches!(self, Self::Directories | Self::All)
    }
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries, least valuable first
    List {
        /// Table to list
        #[arg(short, long, value_enum, default_value = "all")]
        kind: TableKind,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Evict caches until the configured free space is available
    Gc {
        /// Show what would be evicted without removing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Evict a single cache entry
    Evict {
        /// Cache key (cache name or content key)
        key: String,

        /// Table to evict from
        #[arg(short, long, value_enum, default_value = "all")]
        kind: TableKind,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

/// Arguments for the ports command
#[derive(Parser, Debug)]
pub struct PortsArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}
