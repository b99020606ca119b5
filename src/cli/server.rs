// src/cli/server.rs
//! Server side commands

use clap::Subcommand;

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Synchronize mirrors with the local repository
    ///
    /// Exit status: 0 ok, 1 download failed, 2 upload failed,
    /// 3 dependency QA failed, 4 system QA failed.
    Sync {
        /// Repository to sync (default: all configured)
        repository: Option<String>,

        /// Upload even if non-fatal QA checks fail
        #[arg(long)]
        force_qa: bool,
    },

    /// Lock every mirror of a repository
    Lock {
        repository: String,

        /// Place the download lock (clients stay away) instead of the upload lock
        #[arg(long)]
        download: bool,
    },

    /// Remove this host's lock from every mirror of a repository
    Unlock {
        repository: String,

        /// Remove the download lock instead of the upload lock
        #[arg(long)]
        download: bool,
    },

    /// Increment the local revision of a repository
    Bump { repository: String },

    /// Show revision and lock state of every mirror
    Status { repository: String },
}
