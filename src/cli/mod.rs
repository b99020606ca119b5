// src/cli/mod.rs
//! CLI definitions for reposync
//!
//! This module contains the command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.
//!
//! Client commands:
//! - `update` - Update local repositories from their mirrors
//! - `status` - Show local revisions and lock state
//!
//! Server commands live under `server` (see [`ServerCommands`]).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod server;

pub use server::ServerCommands;

#[derive(Parser)]
#[command(name = "reposync")]
#[command(version)]
#[command(about = "Package repository synchronization between servers, mirrors and clients", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = reposync::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Update repositories from their database mirrors
    ///
    /// Exit status: 0 all repositories in sync, 1 some unavailable,
    /// 2 all unavailable, 4 another instance is running.
    Update {
        /// Repositories to update (default: all configured)
        repositories: Vec<String>,

        /// Download even when the local revision is current
        #[arg(short, long)]
        force: bool,

        /// Show download progress bars
        #[arg(long)]
        progress: bool,
    },

    /// Show local revision and lock state of every repository
    Status,

    /// Repository publishing and mirror management
    #[command(subcommand)]
    Server(ServerCommands),
}
