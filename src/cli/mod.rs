//! CLI module for relayq - command-line interface and subcommands.
//!
//! Provides a simulation driver for the dispatcher and configuration
//! inspection commands.

pub mod commands;

pub use commands::Cli;
