// src/server/status.rs

//! Per-mirror status probe

use crate::error::{Error, Result};
use crate::lock::{LockKind, LockState, MirrorLocks};
use crate::repository::{Repository, parse_revision};
use crate::transport::MirrorTransport;
use tracing::debug;

/// What a mirror currently publishes for one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorStatus {
    pub uri: String,
    /// Published revision, 0 when absent or unreadable
    pub revision: u64,
    /// Both the compressed database and the revision marker exist
    pub has_data: bool,
    pub upload_locked: LockState,
    pub download_locked: LockState,
}

impl MirrorStatus {
    /// Revision that counts for queue decisions
    pub fn effective_revision(&self) -> u64 {
        if self.has_data { self.revision } else { 0 }
    }

    pub fn locked_by_other(&self) -> bool {
        self.upload_locked == LockState::HeldByOther
            || self.download_locked == LockState::HeldByOther
    }
}

/// Probe `mirror` for `repo`
pub fn probe_mirror(
    repo: &Repository,
    transport: &dyn MirrorTransport,
    mirror: &str,
) -> Result<MirrorStatus> {
    let names = repo.names();

    let revision = match transport.fetch_bytes(&repo.remote_uri(mirror, &names.revision())) {
        Ok(bytes) => Some(parse_revision(&String::from_utf8_lossy(&bytes))),
        Err(Error::NotFoundError(_)) => None,
        Err(e) => return Err(e),
    };
    let database = transport.exists(&repo.remote_uri(mirror, &names.compressed_database()))?;

    let locks = MirrorLocks::new(repo);
    let status = MirrorStatus {
        uri: mirror.to_string(),
        revision: revision.unwrap_or(0),
        has_data: database && revision.is_some(),
        upload_locked: locks.state(transport, mirror, LockKind::Upload)?,
        download_locked: locks.state(transport, mirror, LockKind::Download)?,
    };
    debug!("{} status for '{}': {:?}", mirror, repo.id(), status);
    Ok(status)
}
