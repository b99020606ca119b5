// src/commands/mod.rs
//! Command handlers for the reposync CLI

mod server;
mod update;

pub use server::{
    cmd_server_bump, cmd_server_lock, cmd_server_status, cmd_server_sync, cmd_server_unlock,
};
pub use update::{cmd_status, cmd_update};

use anyhow::{Context, Result};
use reposync::config::{EnvOverrides, Settings, SyncContext};
use reposync::lock::InstanceLock;
use std::path::Path;
use tracing::debug;

/// Exit status when another engine holds the instance lock
pub const EXIT_INSTANCE_LOCKED: i32 = 4;

/// Load settings and freeze them with the environment overrides
pub fn load_context(config: &Path) -> Result<SyncContext> {
    let settings = Settings::load(config)
        .with_context(|| format!("loading configuration {}", config.display()))?;
    let overrides = EnvOverrides::from_env();
    debug!("Environment overrides: {:?}", overrides);
    Ok(SyncContext::new(settings, overrides))
}

/// Take the host-wide engine lock, or `None` if another instance holds it
pub fn instance_lock(ctx: &SyncContext) -> Result<Option<InstanceLock>> {
    let path = ctx.settings().repositories_dir.join(InstanceLock::FILE_NAME);
    let lock = InstanceLock::try_acquire(&path)?;
    if lock.is_none() {
        eprintln!(
            "Another reposync instance is running (lock held on {})",
            path.display()
        );
    }
    Ok(lock)
}
