// src/sync/updater.rs

//! Client repository update state machine
//!
//! One [`Updater`] processes the requested repositories sequentially. For each
//! repository it runs:
//!
//! 1. **CheckFreshness**: compare the remote revision with the local one
//! 2. **CheckLock**: skip when the mirror carries a download lock
//! 3. **Fetch**: EAPI3 delta, or a full artifact download for EAPI 1/2 with a
//!    lock poller able to cancel the transfer
//! 4. **Verify**: sidecar digest, then the optional OpenPGP signature
//! 5. **Unpack**: decompress; EAPI2 dumps are aligned with the old database
//! 6. **Commit**: atomic rename over the database
//! 7. **PostProcess**: revision bump, indexes, metafiles, post-update hook
//!
//! A failure at EAPI3 downgrades the level and restarts at step 1. Every
//! other failure purges the repository's transient artifacts. The local
//! repository lock is held for the whole run and released on every path.

use super::cancel::{CancelToken, LockPoller};
use super::delta::{DeltaOutcome, DeltaSync};
use super::service::{HttpServiceClient, RepositoryService, ServiceReply};
use crate::commit::{atomic_replace, purge};
use crate::compression::{decompress_file, unpack_bundle};
use crate::config::{RepositoryConfig, SyncContext};
use crate::eapi::{Capabilities, Eapi, EapiNegotiator};
use crate::error::{Error, Result};
use crate::gpg::{self, SignaturePolicy};
use crate::hash::{self, VerifyStatus};
use crate::hooks::{self, HookStatus};
use crate::lock::LockManager;
use crate::repository::{FileNames, PackageDatabase, Repository, parse_revision};
use crate::transport::{self, MirrorTransport, TransportOptions};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Attempts at reading a remote revision marker
const REVISION_ATTEMPTS: u32 = 5;

/// Pause between revision attempts, multiplied by the attempt number
const REVISION_RETRY_DELAY_MS: u64 = 500;

/// Terminal state of one repository update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Updated { revision: u64, eapi: Eapi },
    SkippedLocked,
    Error(String),
}

impl SyncOutcome {
    /// The repository is not in sync after this run
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::SkippedLocked | Self::Error(_))
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::Updated { revision, eapi } => {
                write!(f, "updated to revision {} ({})", revision, eapi)
            }
            Self::SkippedLocked => write!(f, "skipped (locked, try again later)"),
            Self::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Outcomes of a whole run
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub outcomes: Vec<(String, SyncOutcome)>,
}

impl SyncSummary {
    pub fn unavailable(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_unavailable())
            .count()
    }

    pub fn updated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, SyncOutcome::Updated { .. }))
            .count()
    }

    /// Process exit code: 0 all in sync, 1 some unavailable, 2 all unavailable
    pub fn exit_code(&self) -> i32 {
        let unavailable = self.unavailable();
        if unavailable == 0 {
            0
        } else if unavailable >= self.outcomes.len() {
            2
        } else {
            1
        }
    }
}

/// What one attempt at a given EAPI level produced
enum Attempt {
    Done(SyncOutcome),
    Downgrade(String),
}

/// Client side repository updater
pub struct Updater<'a> {
    ctx: &'a SyncContext,
    locks: LockManager,
    services: HashMap<String, Arc<dyn RepositoryService>>,
    transports: HashMap<String, Arc<dyn MirrorTransport>>,
    transport_options: TransportOptions,
    negotiator: EapiNegotiator,
}

impl<'a> Updater<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        let transport_options = TransportOptions {
            speed_limit: ctx.download_speed_limit(),
            ..TransportOptions::default()
        };
        Self {
            ctx,
            locks: LockManager::new(),
            services: HashMap::new(),
            transports: HashMap::new(),
            transport_options,
            negotiator: EapiNegotiator::new(ctx.overrides().force_eapi),
        }
    }

    /// Show progress bars for HTTP downloads
    pub fn with_progress(mut self, show: bool) -> Self {
        self.transport_options.show_progress = show;
        self
    }

    /// Use `service` for a repository instead of its configured endpoint
    pub fn with_service(mut self, repo_id: &str, service: Arc<dyn RepositoryService>) -> Self {
        self.services.insert(repo_id.to_string(), service);
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

    /// Update the given repositories, or all configured ones when empty
    pub fn update(&self, repo_ids: &[String], force: bool) -> Result<SyncSummary> {
        let settings = self.ctx.settings();
        let configs: Vec<&RepositoryConfig> = if repo_ids.is_empty() {
            settings.repositories.iter().collect()
        } else {
            repo_ids
                .iter()
                .map(|id| {
                    settings.repository(id).ok_or_else(|| {
                        Error::ConfigError(format!("unknown repository '{}'", id))
                    })
                })
                .collect::<Result<_>>()?
        };

        if configs.is_empty() {
            return Err(Error::ConfigError("no repositories configured".to_string()));
        }

        let mut summary = SyncSummary::default();
        for config in configs {
            let outcome = self.update_repository(config, force);
            info!("Repository '{}': {}", config.id, outcome);
            summary.outcomes.push((config.id.clone(), outcome));
        }
        Ok(summary)
    }

    /// Run the state machine for one repository
    pub fn update_repository(&self, config: &RepositoryConfig, force: bool) -> SyncOutcome {
        let repo = Repository::from_context(self.ctx, config);

        let guard = match self.locks.acquire_local(&repo) {
            Ok(guard) => guard,
            Err(Error::LockError(msg)) => {
                warn!("{}", msg);
                return SyncOutcome::SkippedLocked;
            }
            Err(e) => return SyncOutcome::Error(e.to_string()),
        };

        let result = self.sync_repository(&repo, force);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let purged = purge(repo.files.transient_artifacts());
                debug!("Purged {} artifacts of '{}'", purged.len(), repo.id());
                match e {
                    Error::Cancelled(msg) | Error::MirrorsLocked(msg) => {
                        warn!("'{}': {}", repo.id(), msg);
                        SyncOutcome::SkippedLocked
                    }
                    e => {
                        error!("'{}': {}", repo.id(), e);
                        SyncOutcome::Error(e.to_string())
                    }
                }
            }
        };

        drop(guard);
        outcome
    }

    fn service_for(&self, config: &RepositoryConfig) -> Option<Arc<dyn RepositoryService>> {
        if let Some(service) = self.services.get(&config.id) {
            return Some(service.clone());
        }
        let uri = config.service_uri.as_deref()?;
        match HttpServiceClient::new(uri) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("'{}': differential service unusable: {}", config.id, e);
                None
            }
        }
    }

    fn sync_repository(&self, repo: &Repository, force: bool) -> Result<SyncOutcome> {
        repo.ensure_dir()?;

        let service = self.service_for(&repo.config);
        let caps = Capabilities::detect(&repo.config, service.is_some());
        let eapi = self.negotiator.negotiate(repo.id(), &caps);

        let mirrors = &repo.config.database_mirrors;
        let mut last_error = None;
        for (index, mirror) in mirrors.iter().enumerate() {
            let transport = match self.transports.get(mirror) {
                Some(transport) => transport.clone(),
                None => transport::for_uri(mirror, &self.transport_options)?,
            };
            match self.sync_from_mirror(repo, transport, mirror, eapi, service.as_deref(), force) {
                Ok(outcome) => return Ok(outcome),
                Err(e @ (Error::DownloadError(_) | Error::NotFoundError(_)))
                    if index + 1 < mirrors.len() =>
                {
                    warn!("'{}': mirror {} failed: {}, trying next", repo.id(), mirror, e);
                    purge(repo.files.transient_artifacts());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::ConfigError(format!("repository '{}' has no database mirrors", repo.id()))
        }))
    }

    fn sync_from_mirror(
        &self,
        repo: &Repository,
        transport: Arc<dyn MirrorTransport>,
        mirror: &str,
        mut eapi: Eapi,
        service: Option<&dyn RepositoryService>,
        force: bool,
    ) -> Result<SyncOutcome> {
        loop {
            let attempt = match (eapi, service) {
                (Eapi::Three, Some(service)) => {
                    self.attempt_differential(repo, transport.as_ref(), mirror, service, force)?
                }
                (Eapi::Three, None) => {
                    Attempt::Downgrade("no differential service configured".to_string())
                }
                _ => self.attempt_full(repo, transport.clone(), mirror, eapi, force)?,
            };

            match attempt {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Downgrade(reason) => {
                    let lower = eapi.downgrade().ok_or_else(|| {
                        Error::ProtocolError(format!("cannot downgrade below {}", eapi))
                    })?;
                    info!(
                        "'{}': {} unusable ({}), falling back to {}",
                        repo.id(),
                        eapi,
                        reason,
                        lower
                    );
                    eapi = lower;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Freshness and lock checks
    // -------------------------------------------------------------------------

    /// Remote revision from a mirror marker; 0 when absent or invalid
    fn remote_revision(&self, repo: &Repository, transport: &dyn MirrorTransport, mirror: &str) -> Result<u64> {
        let uri = repo.remote_uri(mirror, &repo.names().revision());
        let mut last_error = None;

        for attempt in 1..=REVISION_ATTEMPTS {
            match transport.fetch_bytes(&uri) {
                Ok(bytes) => return Ok(parse_revision(&String::from_utf8_lossy(&bytes))),
                Err(Error::NotFoundError(_)) => return Ok(0),
                Err(e) => {
                    warn!(
                        "Revision fetch attempt {}/{} from {} failed: {}",
                        attempt, REVISION_ATTEMPTS, uri, e
                    );
                    last_error = Some(e);
                    if attempt < REVISION_ATTEMPTS {
                        std::thread::sleep(Duration::from_millis(
                            REVISION_RETRY_DELAY_MS * attempt as u64,
                        ));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::DownloadError(format!("cannot read {}", uri))))
    }

    /// Decide from the revisions whether an update is needed
    fn is_fresh(&self, repo: &Repository, remote: u64, force: bool) -> Result<bool> {
        let local = repo.local_revision();
        if remote == 0 {
            return Err(Error::NotFoundError(format!(
                "no published revision for '{}'",
                repo.id()
            )));
        }
        if remote < local {
            warn!(
                "'{}': remote revision {} is older than local {}, keeping local",
                repo.id(),
                remote,
                local
            );
            return Ok(true);
        }
        if remote == local && !force {
            info!("'{}' is up to date (revision {})", repo.id(), local);
            return Ok(true);
        }
        Ok(false)
    }

    fn download_locked(
        &self,
        repo: &Repository,
        transport: &dyn MirrorTransport,
        mirror: &str,
    ) -> Result<bool> {
        let uri = repo.remote_uri(mirror, &repo.names().download_lock());
        let locked = transport.exists(&uri)?;
        if locked {
            warn!(
                "'{}': mirror {} is locked, try again later",
                repo.id(),
                mirror
            );
        }
        Ok(locked)
    }

    // -------------------------------------------------------------------------
    // EAPI3
    // -------------------------------------------------------------------------

    fn attempt_differential(
        &self,
        repo: &Repository,
        transport: &dyn MirrorTransport,
        mirror: &str,
        service: &dyn RepositoryService,
        force: bool,
    ) -> Result<Attempt> {
        let remote = match service.get_repository_revision(repo.id()) {
            Ok(ServiceReply::Ready(revision)) => revision,
            Ok(ServiceReply::Locked) => {
                info!("'{}': service temporarily locked", repo.id());
                return Ok(Attempt::Done(SyncOutcome::Unchanged));
            }
            Err(e) => return Ok(Attempt::Downgrade(e.to_string())),
        };

        if self.is_fresh(repo, remote, force)? {
            return Ok(Attempt::Done(SyncOutcome::Unchanged));
        }
        if self.download_locked(repo, transport, mirror)? {
            return Ok(Attempt::Done(SyncOutcome::SkippedLocked));
        }

        let delta = DeltaSync::new(repo, service, &self.ctx.settings().client);
        match delta.run(remote, force) {
            Ok(DeltaOutcome::Applied {
                revision,
                added,
                removed,
                checksum_matches,
            }) => {
                info!(
                    "'{}': differential sync applied (+{} -{}, checksum {})",
                    repo.id(),
                    added,
                    removed,
                    if checksum_matches { "ok" } else { "MISMATCH" }
                );
                self.post_process(repo, transport, mirror, revision)?;
                Ok(Attempt::Done(SyncOutcome::Updated {
                    revision,
                    eapi: Eapi::Three,
                }))
            }
            Ok(DeltaOutcome::Unchanged) | Ok(DeltaOutcome::Locked) => {
                Ok(Attempt::Done(SyncOutcome::Unchanged))
            }
            Ok(DeltaOutcome::Declined(reason)) => Ok(Attempt::Downgrade(reason)),
            Err(e) => Ok(Attempt::Downgrade(e.to_string())),
        }
    }

    // -------------------------------------------------------------------------
    // EAPI 1/2
    // -------------------------------------------------------------------------

    fn attempt_full(
        &self,
        repo: &Repository,
        transport: Arc<dyn MirrorTransport>,
        mirror: &str,
        eapi: Eapi,
        force: bool,
    ) -> Result<Attempt> {
        let remote = self.remote_revision(repo, transport.as_ref(), mirror)?;
        if self.is_fresh(repo, remote, force)? {
            return Ok(Attempt::Done(SyncOutcome::Unchanged));
        }
        if self.download_locked(repo, transport.as_ref(), mirror)? {
            return Ok(Attempt::Done(SyncOutcome::SkippedLocked));
        }

        let names = repo.names();
        let artifact_name = match eapi {
            Eapi::One => names.compressed_database(),
            _ => names.compressed_dump_light(),
        };
        let fetched = self.fetch_artifact(repo, transport.clone(), mirror, &artifact_name)?;

        match hash::verify(&fetched.artifact, &fetched.sidecar)? {
            VerifyStatus::Verified => {}
            VerifyStatus::CannotVerify(reason) => {
                warn!(
                    "'{}': cannot verify {}: {}, continuing",
                    repo.id(),
                    artifact_name,
                    reason
                );
            }
            VerifyStatus::Mismatch { expected, actual } => {
                return Err(Error::ChecksumMismatch { expected, actual });
            }
        }

        let policy = SignaturePolicy {
            gpg_check: repo.config.gpg_check,
            gpg_strict: repo.config.gpg_strict,
            keyring_dir: self.ctx.settings().client.keyring_dir.clone(),
            repository: repo.id().to_string(),
        };
        let status = gpg::check_artifact(&fetched.artifact, fetched.signature.as_deref(), &policy)?;
        debug!("'{}': signature status {:?}", repo.id(), status);

        match eapi {
            Eapi::One => self.unpack_database(repo, &fetched.artifact)?,
            _ => self.unpack_dump(repo, &fetched.artifact)?,
        }

        atomic_replace(&repo.files.staging(), &repo.files.database())?;
        info!("'{}': committed revision {} via {}", repo.id(), remote, eapi);

        purge([&fetched.artifact, &fetched.sidecar]);
        if let Some(signature) = &fetched.signature {
            purge([signature]);
        }

        self.post_process(repo, transport.as_ref(), mirror, remote)?;
        Ok(Attempt::Done(SyncOutcome::Updated { revision: remote, eapi }))
    }

    /// Download an artifact, its sidecar and its signature under a lock poller
    fn fetch_artifact(
        &self,
        repo: &Repository,
        transport: Arc<dyn MirrorTransport>,
        mirror: &str,
        name: &str,
    ) -> Result<FetchedArtifact> {
        let cancel = CancelToken::new();
        let poller = {
            let watcher = transport.clone();
            let lock_uri = repo.remote_uri(mirror, &repo.names().download_lock());
            LockPoller::spawn(cancel.clone(), self.ctx.lock_poll_interval(), move || {
                watcher.exists(&lock_uri)
            })
        };

        let artifact = repo.files.path(name);
        let sidecar = repo.files.path(&FileNames::digest_of(name));
        let signature_path = repo.files.path(&FileNames::signature_of(name));

        let result = (|| -> Result<FetchedArtifact> {
            transport.download(&repo.remote_uri(mirror, name), &artifact, &cancel)?;

            let digest_name = FileNames::digest_of(name);
            match transport.download(&repo.remote_uri(mirror, &digest_name), &sidecar, &cancel) {
                Ok(_) => {}
                Err(Error::NotFoundError(_)) => {
                    warn!("'{}': no checksum published for {}", repo.id(), name);
                }
                Err(e) => return Err(e),
            }

            let signature = if repo.config.gpg_check {
                let sig_name = FileNames::signature_of(name);
                match transport.download(
                    &repo.remote_uri(mirror, &sig_name),
                    &signature_path,
                    &cancel,
                ) {
                    Ok(_) => Some(signature_path.clone()),
                    Err(Error::NotFoundError(_)) => None,
                    Err(e) => return Err(e),
                }
            } else {
                None
            };

            cancel.check(&format!("download of {}", name))?;
            Ok(FetchedArtifact {
                artifact: artifact.clone(),
                sidecar: sidecar.clone(),
                signature,
            })
        })();

        poller.stop();
        if result.is_err() {
            purge([&artifact, &sidecar, &signature_path]);
        }
        result
    }

    fn unpack_database(&self, repo: &Repository, artifact: &Path) -> Result<()> {
        decompress_file(artifact, &repo.files.staging(), repo.names().format())?;
        // reject archives that do not contain a database
        PackageDatabase::open_existing(&repo.files.staging())?.count_packages()?;
        Ok(())
    }

    /// Import a light dump and align it with the current database
    ///
    /// Locally added user data survives. When alignment fails the imported
    /// database replaces the old one as is.
    fn unpack_dump(&self, repo: &Repository, artifact: &Path) -> Result<()> {
        let names = repo.names();
        let dump = repo.files.path(&names.dump_light());
        let fresh = repo.files.path(&names.light_database());
        let staging = repo.files.staging();

        let result = (|| -> Result<()> {
            decompress_file(artifact, &dump, names.format())?;
            PackageDatabase::import_dump(&dump, &fresh)?;

            let current = repo.files.database();
            if !current.is_file() {
                fs::rename(&fresh, &staging)?;
                return Ok(());
            }

            PackageDatabase::open_existing(&current)?.snapshot_to(&staging)?;
            let aligned = PackageDatabase::open_existing(&staging)
                .and_then(|mut db| db.align_with(&fresh));
            if let Err(e) = aligned {
                warn!(
                    "'{}': alignment failed ({}), replacing database",
                    repo.id(),
                    e
                );
                fs::rename(&fresh, &staging)?;
            }
            Ok(())
        })();

        purge([&dump, &fresh]);
        result
    }

    // -------------------------------------------------------------------------
    // Post processing
    // -------------------------------------------------------------------------

    fn post_process(
        &self,
        repo: &Repository,
        transport: &dyn MirrorTransport,
        mirror: &str,
        revision: u64,
    ) -> Result<()> {
        repo.write_revision(revision)?;

        let client = &self.ctx.settings().client;
        if client.rebuild_indexes
            && let Err(e) = PackageDatabase::open_existing(&repo.files.database())
                .and_then(|db| db.rebuild_indexes())
        {
            warn!("'{}': index rebuild failed: {}", repo.id(), e);
        }

        if let Err(e) = self.install_metafiles(repo, transport, mirror) {
            warn!("'{}': metafiles not installed: {}", repo.id(), e);
        }

        if let Some(hook) = &client.post_update_hook {
            self.run_post_update_hook(repo, hook);
        }
        Ok(())
    }

    /// Fetch and unpack the metafiles bundle (best effort)
    fn install_metafiles(
        &self,
        repo: &Repository,
        transport: &dyn MirrorTransport,
        mirror: &str,
    ) -> Result<Vec<PathBuf>> {
        let names = repo.names();
        let bundle = repo.files.path(&names.metafiles());
        match transport.download(
            &repo.remote_uri(mirror, &names.metafiles()),
            &bundle,
            &CancelToken::new(),
        ) {
            Ok(_) => {}
            Err(Error::NotFoundError(_)) => {
                debug!("'{}': no metafiles published", repo.id());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }

        let staging = tempfile::TempDir::new_in(repo.files.dir())?;
        let result = unpack_bundle(&bundle, staging.path(), names.format())
            .map_err(Error::from)
            .and_then(|files| install_unpacked(repo, &files));
        purge([&bundle]);
        result
    }

    fn run_post_update_hook(&self, repo: &Repository, hook: &Path) {
        let client = &self.ctx.settings().client;
        let root = client.root.to_string_lossy();
        let args = [repo.id(), root.as_ref(), repo.branch.as_str()];

        match hooks::run_hook(hook, &args, Duration::from_secs(client.hook_timeout_secs)) {
            Ok(HookStatus::Exited(0)) => debug!("'{}': post-update hook succeeded", repo.id()),
            Ok(status) => warn!("'{}': post-update hook ended with {:?}", repo.id(), status),
            Err(e) => warn!("'{}': post-update hook failed: {}", repo.id(), e),
        }
    }
}

struct FetchedArtifact {
    artifact: PathBuf,
    sidecar: PathBuf,
    signature: Option<PathBuf>,
}

/// Move unpacked metafiles into the repository directory
///
/// `*.example` files are installed under their plain name only when that
/// file does not exist yet. Files named in the not-found list are removed.
fn install_unpacked(repo: &Repository, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let notfound_name = repo.names().metafiles_notfound();
    let mut installed = Vec::new();

    for file in files {
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };

        if name == notfound_name {
            let listed = fs::read_to_string(file)?;
            for stale in listed.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if !stale.contains('/') {
                    purge([repo.files.path(stale)]);
                }
            }
            continue;
        }

        if let Some(target_name) = name.strip_suffix(".example") {
            let target = repo.files.path(target_name);
            if target.exists() {
                debug!("Keeping existing {}", target.display());
                continue;
            }
            atomic_replace(file, &target)?;
            installed.push(target);
            continue;
        }

        let target = repo.files.path(&name);
        atomic_replace(file, &target)?;
        installed.push(target);
    }

    debug!("'{}': installed {} metafiles", repo.id(), installed.len());
    Ok(installed)
}
