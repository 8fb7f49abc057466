//! CLI argument parsing for the tabsync daemon

use clap::Parser;
use std::path::PathBuf;

/// Tabsync - expose relational tables to an analytics platform
///
/// Serves filtered queries over configured tables and forwards newly
/// inserted rows to the platform until they are acknowledged.
#[derive(Parser, Debug)]
#[command(name = "tabsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "tabsync.yaml", env = "TABSYNC_CONFIG")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "TABSYNC_LOG_LEVEL")]
    pub log_level: String,

    /// Seconds to wait for workers to stop on shutdown
    #[arg(long, default_value = "30", env = "TABSYNC_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout_secs: u64,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    pub check: bool,
}
