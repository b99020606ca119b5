// src/commands/server.rs
//! Server side mirror commands

use super::{EXIT_INSTANCE_LOCKED, instance_lock, load_context};
use anyhow::Result;
use reposync::lock::{LockKind, LockState};
use reposync::server::{MirrorSync, MirrorSyncResult};
use std::path::Path;
use tracing::{info, warn};

fn lock_kind(download: bool) -> LockKind {
    if download {
        LockKind::Download
    } else {
        LockKind::Upload
    }
}

/// Sync mirrors of one or all repositories; returns the worst result code
pub fn cmd_server_sync(config: &Path, repository: Option<&str>, force_qa: bool) -> Result<i32> {
    let ctx = load_context(config)?;
    let Some(_instance) = instance_lock(&ctx)? else {
        return Ok(EXIT_INSTANCE_LOCKED);
    };
    let sync = MirrorSync::new(&ctx)?;

    let ids: Vec<String> = match repository {
        Some(id) => vec![id.to_string()],
        None => ctx
            .settings()
            .repositories
            .iter()
            .map(|r| r.id.clone())
            .collect(),
    };

    let mut worst = 0;
    for id in &ids {
        info!("Syncing mirrors of '{}'", id);
        let result = sync.sync_repository(id, force_qa)?;
        match &result {
            MirrorSyncResult::InSync => println!("{}: all mirrors in sync", id),
            MirrorSyncResult::Synced {
                revision,
                downloaded,
                uploaded,
                failed,
            } => {
                println!("{}: revision {}", id, revision);
                if let Some(source) = downloaded {
                    println!("  downloaded from {}", source);
                }
                for uri in uploaded {
                    println!("  uploaded to {}", uri);
                }
                for uri in failed {
                    println!("  FAILED {}", uri);
                }
            }
            MirrorSyncResult::DownloadFailed(reason) => {
                println!("{}: download failed: {}", id, reason)
            }
            MirrorSyncResult::UploadFailed(mirrors) => {
                println!("{}: upload failed on {}", id, mirrors.join(", "))
            }
            MirrorSyncResult::DependencyQaFailed(issues)
            | MirrorSyncResult::SystemQaFailed(issues) => {
                println!("{}: QA blocked the upload:", id);
                for issue in issues {
                    println!("  [{}] {}", issue.check, issue.message);
                }
            }
        }
        worst = worst.max(result.code());
    }
    Ok(worst)
}

/// Lock every mirror of a repository
pub fn cmd_server_lock(config: &Path, repository: &str, download: bool) -> Result<()> {
    let ctx = load_context(config)?;
    let sync = MirrorSync::new(&ctx)?;
    for uri in sync.lock_mirrors(repository, lock_kind(download))? {
        println!("Locked {}", uri);
    }
    Ok(())
}

/// Unlock every mirror of a repository
pub fn cmd_server_unlock(config: &Path, repository: &str, download: bool) -> Result<()> {
    let ctx = load_context(config)?;
    let sync = MirrorSync::new(&ctx)?;
    for uri in sync.unlock_mirrors(repository, lock_kind(download))? {
        println!("Unlocked {}", uri);
    }
    Ok(())
}

/// Increment the local revision
pub fn cmd_server_bump(config: &Path, repository: &str) -> Result<()> {
    let ctx = load_context(config)?;
    let sync = MirrorSync::new(&ctx)?;
    let revision = sync.bump_revision(repository)?;
    println!("{} is now at revision {}", repository, revision);
    Ok(())
}

/// Show what every mirror publishes
pub fn cmd_server_status(config: &Path, repository: &str) -> Result<()> {
    let ctx = load_context(config)?;
    let sync = MirrorSync::new(&ctx)?;
    let local = sync.repository(repository)?.local_revision();

    println!("{} (local revision {}):", repository, local);
    for status in sync.mirror_status(repository)? {
        let lock = match (status.upload_locked, status.download_locked) {
            (LockState::Absent, LockState::Absent) => String::new(),
            (upload, download) => format!(" [upload {:?}, download {:?}]", upload, download),
        };
        let data = if status.has_data { "" } else { " (no data)" };
        println!("  {} revision {}{}{}", status.uri, status.revision, data, lock);
        if status.has_data && status.revision > local {
            warn!("{} is ahead of the local repository", status.uri);
        }
    }
    Ok(())
}
