// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, ServerCommands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber for logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_path();
    let code = match cli.command {
        Commands::Update {
            repositories,
            force,
            progress,
        } => commands::cmd_update(config, &repositories, force, progress)?,
        Commands::Status => {
            commands::cmd_status(config)?;
            0
        }
        Commands::Server(command) => match command {
            ServerCommands::Sync {
                repository,
                force_qa,
            } => commands::cmd_server_sync(config, repository.as_deref(), force_qa)?,
            ServerCommands::Lock {
                repository,
                download,
            } => {
                commands::cmd_server_lock(config, &repository, download)?;
                0
            }
            ServerCommands::Unlock {
                repository,
                download,
            } => {
                commands::cmd_server_unlock(config, &repository, download)?;
                0
            }
            ServerCommands::Bump { repository } => {
                commands::cmd_server_bump(config, &repository)?;
                0
            }
            ServerCommands::Status { repository } => {
                commands::cmd_server_status(config, &repository)?;
                0
            }
        },
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
