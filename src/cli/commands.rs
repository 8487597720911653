//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - simulate: drive a dispatcher over a scripted in-process transport
//! - config check: load and validate the configuration
//! - config show: print the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Relayq - priority rate-limited dispatch queue for chat bridges
#[derive(Parser, Debug)]
#[command(name = "relayq")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a dispatcher against a simulated chat API
    Simulate {
        /// Number of messages to enqueue
        #[arg(short, long, default_value_t = 100)]
        messages: usize,

        /// Fail every Nth send attempt with a transient error
        #[arg(long)]
        fail_every: Option<usize>,

        /// Answer every Nth send attempt with a rate-limit signal
        #[arg(long)]
        rate_limit_every: Option<usize>,

        /// Retry-after carried by simulated rate-limit signals (ms)
        #[arg(long, default_value_t = 500)]
        retry_after_ms: u64,

        /// Give up waiting for completion after this long (ms)
        #[arg(short, long, default_value_t = 30000)]
        duration_ms: u64,

        /// Print stats as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Validate the configuration and report problems
    Check,

    /// Print the effective configuration as YAML
    Show,
}
