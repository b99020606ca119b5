// src/server/mirror_sync.rs

//! Server side mirror synchronization
//!
//! A run for one repository probes every database mirror, computes the
//! [`SyncQueue`], downloads from a more advanced mirror if there is one, runs
//! QA, then uploads to every stale mirror in turn. Each upload is bracketed by
//! the mirror's upload lock and download lock; the download lock is only
//! removed once every artifact made it, so clients never read a half-written
//! mirror.

use super::packager::{UploadBundle, UploadPackager};
use super::qa::{self, QaCategory, QaCheck, QaIssue, QaVerdict};
use super::queue::{SyncQueue, calculate_queue};
use super::status::{MirrorStatus, probe_mirror};
use crate::commit::{atomic_replace, purge, write_atomic};
use crate::compression::decompress_file;
use crate::config::SyncContext;
use crate::error::{Error, Result};
use crate::gpg::{ArtifactSigner, GpgSigner};
use crate::hash::{self, VerifyStatus};
use crate::lock::{LockKind, LockManager, LockState, MirrorLocks};
use crate::repository::{FileNames, PackageDatabase, Repository};
use crate::sync::CancelToken;
use crate::transport::{self, MirrorTransport, TransportOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of one mirror sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorSyncResult {
    /// Every mirror already holds the local revision
    InSync,
    Synced {
        revision: u64,
        downloaded: Option<String>,
        uploaded: Vec<String>,
        failed: Vec<String>,
    },
    DownloadFailed(String),
    /// Every queued upload failed
    UploadFailed(Vec<String>),
    DependencyQaFailed(Vec<QaIssue>),
    SystemQaFailed(Vec<QaIssue>),
}

impl MirrorSyncResult {
    /// Numeric result code
    pub fn code(&self) -> i32 {
        match self {
            Self::InSync | Self::Synced { .. } => 0,
            Self::DownloadFailed(_) => 1,
            Self::UploadFailed(_) => 2,
            Self::DependencyQaFailed(_) => 3,
            Self::SystemQaFailed(_) => 4,
        }
    }
}

type Mirror = (String, Arc<dyn MirrorTransport>);

/// Mirror sync driver
pub struct MirrorSync<'a> {
    ctx: &'a SyncContext,
    locks: LockManager,
    signer: Option<Box<dyn ArtifactSigner>>,
    checks: Vec<Box<dyn QaCheck>>,
    transport_options: TransportOptions,
    transports: HashMap<String, Arc<dyn MirrorTransport>>,
}

impl<'a> MirrorSync<'a> {
    /// Create a driver; loads the signing key when one is configured
    pub fn new(ctx: &'a SyncContext) -> Result<Self> {
        let server = &ctx.settings().server;
        let signer = match &server.signing_key {
            Some(path) => {
                let signer = GpgSigner::from_file(path)?;
                info!("Signing uploads with key {}", signer.fingerprint());
                Some(Box::new(signer) as Box<dyn ArtifactSigner>)
            }
            None => None,
        };

        Ok(Self {
            ctx,
            locks: LockManager::new(),
            signer,
            checks: qa::default_checks(server),
            transport_options: TransportOptions::default(),
            transports: HashMap::new(),
        })
    }

    pub fn with_signer(mut self, signer: Box<dyn ArtifactSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Replace the QA checks
    pub fn with_checks(mut self, checks: Vec<Box<dyn QaCheck>>) -> Self {
        self.checks = checks;
        self
    }

    /// Reach `mirror` through `transport` instead of one built from its scheme
    pub fn with_transport(mut self, mirror: &str, transport: Arc<dyn MirrorTransport>) -> Self {
        self.transports.insert(mirror.to_string(), transport);
        self
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn repository(&self, repo_id: &str) -> Result<Repository> {
        let config = self
            .ctx
            .settings()
            .repository(repo_id)
            .ok_or_else(|| Error::ConfigError(format!("unknown repository '{}'", repo_id)))?;
        Ok(Repository::from_context(self.ctx, config))
    }

    fn mirrors(&self, repo: &Repository) -> Result<Vec<Mirror>> {
        if repo.config.database_mirrors.is_empty() {
            return Err(Error::ConfigError(format!(
                "repository '{}' has no database mirrors",
                repo.id()
            )));
        }
        let mut mirrors = Vec::with_capacity(repo.config.database_mirrors.len());
        for uri in &repo.config.database_mirrors {
            let transport = match self.transports.get(uri) {
                Some(transport) => transport.clone(),
                None => transport::for_uri(uri, &self.transport_options)?,
            };
            mirrors.push((uri.clone(), transport));
        }
        Ok(mirrors)
    }

    /// Probe every mirror of a repository
    pub fn mirror_status(&self, repo_id: &str) -> Result<Vec<MirrorStatus>> {
        let repo = self.repository(repo_id)?;
        self.mirrors(&repo)?
            .iter()
            .map(|(uri, transport)| probe_mirror(&repo, transport.as_ref(), uri))
            .collect()
    }

    /// Bring every mirror of `repo_id` to the highest known revision
    pub fn sync_repository(&self, repo_id: &str, force_qa: bool) -> Result<MirrorSyncResult> {
        let repo = self.repository(repo_id)?;
        repo.ensure_dir()?;
        let _guard = self.locks.acquire_local(&repo)?;

        let mirrors = self.mirrors(&repo)?;
        let mirror_locks = MirrorLocks::new(&repo);

        let mut statuses = Vec::new();
        for (uri, transport) in &mirrors {
            mirror_locks.clear_stale(transport.as_ref(), uri)?;
            match probe_mirror(&repo, transport.as_ref(), uri) {
                Ok(status) => statuses.push(status),
                Err(e) => warn!("Skipping unreachable mirror {}: {}", uri, e),
            }
        }
        if statuses.is_empty() {
            return Err(Error::DownloadError(format!(
                "no mirror of '{}' is reachable",
                repo.id()
            )));
        }

        let busy: Vec<&str> = statuses
            .iter()
            .filter(|s| s.upload_locked == LockState::HeldByOther)
            .map(|s| s.uri.as_str())
            .collect();
        if !busy.is_empty() {
            return Err(Error::MirrorsLocked(format!(
                "'{}' is being updated on {}",
                repo.id(),
                busy.join(", ")
            )));
        }

        let queue = calculate_queue(&statuses, repo.local_revision());
        self.log_queue(&repo, &queue);
        if queue.is_empty() {
            return Ok(MirrorSyncResult::InSync);
        }

        if let Some(source) = &queue.download {
            let transport = find_mirror(&mirrors, source)?;
            if let Err(e) = self.download_from(&repo, transport, source, queue.target_revision) {
                error!("Download of '{}' from {} failed: {}", repo.id(), source, e);
                return Ok(MirrorSyncResult::DownloadFailed(e.to_string()));
            }
        }

        if queue.upload.is_empty() {
            return Ok(MirrorSyncResult::Synced {
                revision: repo.local_revision(),
                downloaded: queue.download,
                uploaded: Vec::new(),
                failed: Vec::new(),
            });
        }

        let verdict = {
            let db = PackageDatabase::open_existing(&repo.files.database())?;
            qa::run_checks(&self.checks, &repo, &db, force_qa)?
        };
        match verdict {
            QaVerdict::Blocked {
                category: QaCategory::Dependency,
                issues,
            } => return Ok(MirrorSyncResult::DependencyQaFailed(issues)),
            QaVerdict::Blocked {
                category: QaCategory::System,
                issues,
            } => return Ok(MirrorSyncResult::SystemQaFailed(issues)),
            QaVerdict::Forced { issues } => {
                warn!("Uploading '{}' despite {} QA issues", repo.id(), issues.len())
            }
            QaVerdict::Passed { .. } => {}
        }

        let bundle = UploadPackager::new(&repo, &self.ctx.settings().server, self.signer.as_deref())
            .build()?;

        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        for uri in &queue.upload {
            let transport = find_mirror(&mirrors, uri)?;
            match self.upload_to(&repo, transport, uri, &bundle) {
                Ok(()) => {
                    info!("Uploaded '{}' revision {} to {}", repo.id(), bundle.revision, uri);
                    uploaded.push(uri.clone());
                }
                Err(e) => {
                    error!("Upload of '{}' to {} failed: {}", repo.id(), uri, e);
                    failed.push(uri.clone());
                }
            }
        }

        if uploaded.is_empty() {
            return Ok(MirrorSyncResult::UploadFailed(failed));
        }
        Ok(MirrorSyncResult::Synced {
            revision: bundle.revision,
            downloaded: queue.download,
            uploaded,
            failed,
        })
    }

    fn log_queue(&self, repo: &Repository, queue: &SyncQueue) {
        if let Some(source) = &queue.download {
            info!(
                "'{}': downloading revision {} from {}",
                repo.id(),
                queue.target_revision,
                source
            );
        }
        for uri in &queue.upload {
            info!("'{}': {} queued for upload", repo.id(), uri);
        }
        if !queue.divergent.is_empty() {
            warn!(
                "'{}': divergent mirrors {}",
                repo.id(),
                queue.divergent.join(", ")
            );
        }
        if queue.is_empty() {
            info!("'{}': all mirrors in sync", repo.id());
        }
    }

    /// Replace the local database with the one published on `mirror`
    fn download_from(
        &self,
        repo: &Repository,
        transport: &dyn MirrorTransport,
        mirror: &str,
        revision: u64,
    ) -> Result<()> {
        let locks = MirrorLocks::new(repo);
        locks.lock(transport, mirror, LockKind::Upload)?;

        let names = repo.names();
        let artifact_name = names.compressed_database();
        let artifact = repo.files.path(&artifact_name);
        let sidecar = repo.files.path(&FileNames::digest_of(&artifact_name));
        let cancel = CancelToken::new();

        let result = (|| -> Result<()> {
            transport.download(&repo.remote_uri(mirror, &artifact_name), &artifact, &cancel)?;
            transport.download(
                &repo.remote_uri(mirror, &FileNames::digest_of(&artifact_name)),
                &sidecar,
                &cancel,
            )?;
            match hash::verify(&artifact, &sidecar)? {
                VerifyStatus::Verified => {}
                VerifyStatus::Mismatch { expected, actual } => {
                    return Err(Error::ChecksumMismatch { expected, actual });
                }
                VerifyStatus::CannotVerify(reason) => {
                    return Err(Error::ParseError(reason));
                }
            }

            let staging = repo.files.staging();
            decompress_file(&artifact, &staging, names.format())?;
            PackageDatabase::open_existing(&staging)?.count_packages()?;
            atomic_replace(&staging, &repo.files.database())?;
            repo.write_revision(revision)?;
            info!("'{}': now at revision {} from {}", repo.id(), revision, mirror);
            Ok(())
        })();

        purge([&artifact, &sidecar, &repo.files.staging()]);
        let unlocked = locks.unlock(transport, mirror, LockKind::Upload);
        result?;
        unlocked
    }

    fn wait_for_upload_lock(
        &self,
        locks: &MirrorLocks<'_>,
        transport: &dyn MirrorTransport,
        mirror: &str,
    ) -> Result<()> {
        let wait = Duration::from_secs(self.ctx.settings().server.lock_wait_secs);
        let started = Instant::now();
        loop {
            if locks.state(transport, mirror, LockKind::Upload)? != LockState::HeldByOther {
                return Ok(());
            }
            if started.elapsed() >= wait {
                return Err(Error::MirrorsLocked(format!(
                    "{} still locked after {} seconds",
                    mirror,
                    wait.as_secs()
                )));
            }
            debug!("Waiting for {} to be unlocked", mirror);
            std::thread::sleep(self.ctx.lock_poll_interval());
        }
    }

    fn upload_to(
        &self,
        repo: &Repository,
        transport: &dyn MirrorTransport,
        mirror: &str,
        bundle: &UploadBundle,
    ) -> Result<()> {
        let locks = MirrorLocks::new(repo);
        self.wait_for_upload_lock(&locks, transport, mirror)?;
        locks.lock(transport, mirror, LockKind::Upload)?;

        let result = (|| -> Result<()> {
            locks.lock(transport, mirror, LockKind::Download)?;
            for (file, name) in bundle.files.iter().zip(bundle.names()) {
                transport.upload(file, &repo.remote_uri(mirror, &name))?;
                debug!("Uploaded {} to {}", name, mirror);
            }
            locks.unlock(transport, mirror, LockKind::Download)
        })();

        if let Err(e) = locks.unlock(transport, mirror, LockKind::Upload) {
            warn!("Failed to remove upload lock on {}: {}", mirror, e);
        }
        result
    }

    /// Place a lock marker on every mirror of a repository
    pub fn lock_mirrors(&self, repo_id: &str, kind: LockKind) -> Result<Vec<String>> {
        let repo = self.repository(repo_id)?;
        let locks = MirrorLocks::new(&repo);
        let mut locked = Vec::new();
        for (uri, transport) in self.mirrors(&repo)? {
            locks.lock(transport.as_ref(), &uri, kind)?;
            locked.push(uri);
        }
        Ok(locked)
    }

    /// Remove this host's lock marker from every mirror of a repository
    pub fn unlock_mirrors(&self, repo_id: &str, kind: LockKind) -> Result<Vec<String>> {
        let repo = self.repository(repo_id)?;
        let locks = MirrorLocks::new(&repo);
        let mut unlocked = Vec::new();
        for (uri, transport) in self.mirrors(&repo)? {
            locks.unlock(transport.as_ref(), &uri, kind)?;
            unlocked.push(uri);
        }
        Ok(unlocked)
    }

    /// Increment the local revision and refresh the timestamp
    pub fn bump_revision(&self, repo_id: &str) -> Result<u64> {
        let repo = self.repository(repo_id)?;
        repo.ensure_dir()?;
        let _guard = self.locks.acquire_local(&repo)?;

        let revision = repo.local_revision() + 1;
        repo.write_revision(revision)?;
        write_atomic(
            &repo.files.path(&repo.names().timestamp()),
            format!("{}\n", chrono::Utc::now().to_rfc3339()).as_bytes(),
        )?;
        info!("'{}' bumped to revision {}", repo.id(), revision);
        Ok(revision)
    }
}

fn find_mirror<'m>(mirrors: &'m [Mirror], uri: &str) -> Result<&'m dyn MirrorTransport> {
    mirrors
        .iter()
        .find(|(candidate, _)| candidate == uri)
        .map(|(_, transport)| transport.as_ref())
        .ok_or_else(|| Error::ConfigError(format!("mirror {} is not configured", uri)))
}
