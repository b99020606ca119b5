// src/commands/update.rs
//! Client update commands

use super::{EXIT_INSTANCE_LOCKED, instance_lock, load_context};
use anyhow::Result;
use reposync::lock::LockManager;
use reposync::repository::Repository;
use reposync::sync::{SyncOutcome, Updater};
use std::path::Path;
use tracing::info;

/// Update repositories; returns the process exit status
pub fn cmd_update(config: &Path, repositories: &[String], force: bool, progress: bool) -> Result<i32> {
    let ctx = load_context(config)?;
    let Some(_instance) = instance_lock(&ctx)? else {
        return Ok(EXIT_INSTANCE_LOCKED);
    };

    let count = if repositories.is_empty() {
        ctx.settings().repositories.len()
    } else {
        repositories.len()
    };
    info!("Updating {} repositories", count);

    let updater = Updater::new(&ctx).with_progress(progress);
    let summary = updater.update(repositories, force)?;

    println!("Repository update summary:");
    for (id, outcome) in &summary.outcomes {
        let mark = match outcome {
            SyncOutcome::Updated { .. } => "[+]",
            SyncOutcome::Unchanged => "[=]",
            SyncOutcome::SkippedLocked => "[~]",
            SyncOutcome::Error(_) => "[!]",
        };
        println!("  {} {}: {}", mark, id, outcome);
    }
    println!(
        "{} updated, {} unavailable, {} total",
        summary.updated(),
        summary.unavailable(),
        summary.outcomes.len()
    );

    Ok(summary.exit_code())
}

/// Show local revision and lock state of every configured repository
pub fn cmd_status(config: &Path) -> Result<()> {
    let ctx = load_context(config)?;
    let locks = LockManager::new();

    println!("Repositories (branch {}):", ctx.branch());
    for config in &ctx.settings().repositories {
        let repo = Repository::from_context(&ctx, config);
        let revision = repo.local_revision();
        let database = if repo.files.database().is_file() {
            "present"
        } else {
            "missing"
        };
        println!(
            "  {} revision {} (database {}, lock {:?})",
            repo.id(),
            revision,
            database,
            locks.local_state(&repo)
        );
        if !config.description.is_empty() {
            println!("      {}", config.description);
        }
    }
    Ok(())
}
