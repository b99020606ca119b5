// src/lock.rs

//! Repository and mirror locks
//!
//! Three kinds of locks exist:
//!
//! - **Local repository lock**: an advisory marker (`packages.db.local.lock` in the
//!   repository directory) holding the pid of the process updating it.
//!   Taken through [`LockManager::acquire_local`], released when the returned
//!   [`LocalLockGuard`] drops. The manager counts acquires and releases per
//!   repository.
//! - **Mirror locks**: marker files on a mirror. The upload lock means a
//!   server is writing the mirror, the download lock tells clients to keep
//!   away. A local `<marker>.held` sentinel records that this host placed
//!   the marker, which is how "held by self" is told apart from "held by
//!   other".
//! - **Instance lock**: an `flock` on a host-wide file keeping two sync
//!   engines from running at once.

use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::transport::MirrorTransport;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Observed state of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Absent,
    HeldBySelf,
    HeldByOther,
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Mirror lock flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Upload,
    Download,
}

impl LockKind {
    /// Marker file name for this kind
    pub fn marker_name(&self, repo: &Repository) -> String {
        match self {
            Self::Upload => repo.names().upload_lock(),
            Self::Download => repo.names().download_lock(),
        }
    }
}

/// Acquire/release bookkeeping for one repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCounts {
    pub acquired: usize,
    pub released: usize,
}

impl LockCounts {
    pub fn balanced(&self) -> bool {
        self.acquired == self.released
    }
}

/// Issues local repository locks and keeps their counters
#[derive(Debug, Default)]
pub struct LockManager {
    counts: Mutex<HashMap<String, LockCounts>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn local_marker(repo: &Repository) -> PathBuf {
        repo.files.path(&repo.names().local_lock())
    }

    fn record<F: FnOnce(&mut LockCounts)>(&self, repo_id: &str, update: F) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        update(counts.entry(repo_id.to_string()).or_default());
    }

    /// Counters for a repository
    pub fn counts(&self, repo_id: &str) -> LockCounts {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(repo_id).copied().unwrap_or_default()
    }

    /// State of the local repository lock
    pub fn local_state(&self, repo: &Repository) -> LockState {
        match read_pid(&Self::local_marker(repo)) {
            None => LockState::Absent,
            Some(pid) if pid == std::process::id() => LockState::HeldBySelf,
            Some(pid) if process_alive(pid) => LockState::HeldByOther,
            Some(_) => LockState::Absent,
        }
    }

    /// Take the local repository lock
    ///
    /// Markers left by dead processes are reclaimed. A marker held by a live
    /// process (including this one) is a [`Error::LockError`].
    pub fn acquire_local<'a>(&'a self, repo: &Repository) -> Result<LocalLockGuard<'a>> {
        let marker = Self::local_marker(repo);
        repo.ensure_dir()?;

        match self.local_state(repo) {
            LockState::HeldByOther => {
                return Err(Error::LockError(format!(
                    "repository '{}' is being updated by another process",
                    repo.id()
                )));
            }
            LockState::HeldBySelf => {
                return Err(Error::LockError(format!(
                    "repository '{}' is already locked by this process",
                    repo.id()
                )));
            }
            LockState::Absent => {
                if marker.exists() {
                    warn!("Removing stale lock {}", marker.display());
                    remove_if_exists(&marker)?;
                }
            }
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => Error::LockError(format!(
                    "repository '{}' was locked concurrently",
                    repo.id()
                )),
                _ => Error::LockError(format!("Failed to create {}: {}", marker.display(), e)),
            })?;
        writeln!(file, "{}", std::process::id())?;

        self.record(repo.id(), |c| c.acquired += 1);
        debug!("Acquired local lock for '{}'", repo.id());
        Ok(LocalLockGuard {
            manager: self,
            repo_id: repo.id().to_string(),
            marker,
        })
    }
}

/// Held local repository lock, released on drop
#[derive(Debug)]
pub struct LocalLockGuard<'a> {
    manager: &'a LockManager,
    repo_id: String,
    marker: PathBuf,
}

impl LocalLockGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.marker
    }
}

impl Drop for LocalLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = remove_if_exists(&self.marker) {
            warn!("Failed to remove lock {}: {}", self.marker.display(), e);
        }
        self.manager.record(&self.repo_id, |c| c.released += 1);
        debug!("Released local lock for '{}'", self.repo_id);
    }
}

/// Lock operations on the mirrors of one repository
pub struct MirrorLocks<'a> {
    repo: &'a Repository,
}

impl<'a> MirrorLocks<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    fn sentinel(&self, mirror: &str, kind: LockKind) -> PathBuf {
        let host = url::Url::parse(mirror)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "local".to_string());
        let mirror_key = crate::hash::hash_bytes(crate::hash::HashAlgorithm::Md5, mirror.as_bytes());
        self.repo.files.path(&format!(
            "{}.{}.{}.held",
            kind.marker_name(self.repo),
            host,
            &mirror_key[..8]
        ))
    }

    /// Whether `mirror` carries the `kind` marker, and who placed it
    pub fn state(
        &self,
        transport: &dyn MirrorTransport,
        mirror: &str,
        kind: LockKind,
    ) -> Result<LockState> {
        let uri = self.repo.remote_uri(mirror, &kind.marker_name(self.repo));
        if !transport.exists(&uri)? {
            return Ok(LockState::Absent);
        }
        if self.sentinel(mirror, kind).exists() {
            Ok(LockState::HeldBySelf)
        } else {
            Ok(LockState::HeldByOther)
        }
    }

    /// Place the `kind` marker on `mirror`
    ///
    /// Locking a mirror already locked by this host is a no-op; a mirror
    /// locked by someone else is a [`Error::LockError`].
    pub fn lock(&self, transport: &dyn MirrorTransport, mirror: &str, kind: LockKind) -> Result<()> {
        match self.state(transport, mirror, kind)? {
            LockState::HeldBySelf => {
                debug!("{} {:?} lock already held by us", mirror, kind);
                Ok(())
            }
            LockState::HeldByOther => Err(Error::LockError(format!(
                "mirror {} of '{}' is {:?}-locked by someone else",
                mirror,
                self.repo.id(),
                kind
            ))),
            LockState::Absent => {
                self.repo.ensure_dir()?;
                let content = format!("{}\n", std::process::id());
                fs::write(self.sentinel(mirror, kind), &content)?;
                let uri = self.repo.remote_uri(mirror, &kind.marker_name(self.repo));
                if let Err(e) = transport.upload_bytes(content.as_bytes(), &uri) {
                    remove_if_exists(&self.sentinel(mirror, kind))?;
                    return Err(e);
                }
                info!("Locked {} ({:?}) for '{}'", mirror, kind, self.repo.id());
                Ok(())
            }
        }
    }

    /// Remove the `kind` marker from `mirror`
    ///
    /// Unlocking a mirror locked by someone else is a [`Error::LockError`].
    pub fn unlock(
        &self,
        transport: &dyn MirrorTransport,
        mirror: &str,
        kind: LockKind,
    ) -> Result<()> {
        match self.state(transport, mirror, kind)? {
            LockState::HeldByOther => Err(Error::LockError(format!(
                "refusing to unlock {} of '{}': not locked by us",
                mirror,
                self.repo.id()
            ))),
            LockState::Absent => {
                remove_if_exists(&self.sentinel(mirror, kind))?;
                Ok(())
            }
            LockState::HeldBySelf => {
                let uri = self.repo.remote_uri(mirror, &kind.marker_name(self.repo));
                transport.delete(&uri)?;
                remove_if_exists(&self.sentinel(mirror, kind))?;
                info!("Unlocked {} ({:?}) for '{}'", mirror, kind, self.repo.id());
                Ok(())
            }
        }
    }

    /// Drop local sentinels whose mirror no longer carries a marker
    pub fn clear_stale(&self, transport: &dyn MirrorTransport, mirror: &str) -> Result<()> {
        for kind in [LockKind::Upload, LockKind::Download] {
            let sentinel = self.sentinel(mirror, kind);
            if !sentinel.exists() {
                continue;
            }
            let uri = self.repo.remote_uri(mirror, &kind.marker_name(self.repo));
            if !transport.exists(&uri)? {
                debug!("Clearing stale {:?} sentinel for {}", kind, mirror);
                remove_if_exists(&sentinel)?;
            }
        }
        Ok(())
    }
}

/// Host-wide exclusive lock on the sync engine
///
/// Held with `flock(LOCK_EX)` for the lifetime of the value.
pub struct InstanceLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// File name of the instance lock inside the repositories directory
    pub const FILE_NAME: &'static str = ".reposync.lock";

    /// Try to take the lock without blocking
    ///
    /// Returns `Ok(None)` if another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("Acquired instance lock at {:?}", path);
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Instance lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(Error::LockError(format!(
                "Failed to try-acquire instance lock: {}",
                e
            ))),
        }
    }

    /// Poll for the lock until `timeout` elapses; `Ok(None)` when giving up
    pub fn acquire_with_timeout<P: AsRef<Path>>(
        path: P,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Option<Self>> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path.as_ref())? {
                return Ok(Some(lock));
            }
            if started.elapsed() >= timeout {
                warn!("Gave up waiting for instance lock at {:?}", path.as_ref());
                return Ok(None);
            }
            std::thread::sleep(poll);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // lock is released when the file is closed
        info!("Released instance lock at {:?}", self.path);
    }
}

fn read_pid(marker: &Path) -> Option<u32> {
    let content = fs::read_to_string(marker).ok()?;
    // a marker without a readable pid still counts as held by someone
    Some(content.trim().parse().unwrap_or(0))
}

fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return true;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
