// src/sync/delta.rs

//! EAPI3 differential sync
//!
//! The client sends its package id set, receives a [`DeltaSet`], pulls the
//! added records in fixed-size batches, and applies inserts then removals
//! to a staging copy of its database in one transaction. The staging copy
//! replaces the database atomically. The aggregate checksum is compared
//! afterwards; a mismatch is reported but not rolled back.
//!
//! Payload batches are persisted as CBOR segments under `eapi3/` before
//! anything is applied, so a failed batch leaves the database untouched.

use super::service::{DeltaSet, RepositoryService, ServiceReply};
use crate::commit::{atomic_replace, purge};
use crate::config::ClientSettings;
use crate::error::{Error, Result};
use crate::repository::{PackageDatabase, PackageRecord, Repository};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between payload attempts, multiplied by the attempt number
const PAYLOAD_RETRY_DELAY_MS: u64 = 100;

/// Result of a differential sync attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// Nothing to transfer
    Unchanged,
    /// Delta applied and committed
    Applied {
        revision: u64,
        added: usize,
        removed: usize,
        checksum_matches: bool,
    },
    /// Service temporarily locked
    Locked,
    /// Differential sync declined, fall back to a lower EAPI
    Declined(String),
}

/// Differential sync of one repository against a service
pub struct DeltaSync<'a> {
    repo: &'a Repository,
    service: &'a dyn RepositoryService,
    settings: &'a ClientSettings,
}

impl<'a> DeltaSync<'a> {
    pub fn new(
        repo: &'a Repository,
        service: &'a dyn RepositoryService,
        settings: &'a ClientSettings,
    ) -> Self {
        Self {
            repo,
            service,
            settings,
        }
    }

    /// Run the exchange
    ///
    /// `remote_revision` is recorded when the service metadata does not
    /// carry one. Errors mean the protocol failed and the caller should
    /// downgrade; nothing has been committed in that case.
    pub fn run(&self, remote_revision: u64, force: bool) -> Result<DeltaOutcome> {
        let segment_dir = self.repo.files.segment_dir();
        let staging = self.repo.files.staging();

        let result = self.run_inner(remote_revision, force, &segment_dir, &staging);

        if segment_dir.exists()
            && let Err(e) = fs::remove_dir_all(&segment_dir)
        {
            warn!("Failed to remove {}: {}", segment_dir.display(), e);
        }
        if !matches!(result, Ok(DeltaOutcome::Applied { .. })) {
            purge([&staging]);
        }
        result
    }

    fn run_inner(
        &self,
        remote_revision: u64,
        force: bool,
        segment_dir: &Path,
        staging: &Path,
    ) -> Result<DeltaOutcome> {
        let db_path = self.repo.files.database();
        if !db_path.is_file() {
            return Ok(DeltaOutcome::Declined(
                "no local database to diff against".to_string(),
            ));
        }
        if fs::metadata(&db_path)?.permissions().readonly() {
            return Ok(DeltaOutcome::Declined(
                "local database is not writable".to_string(),
            ));
        }

        let local_ids = PackageDatabase::open_existing(&db_path)?.list_package_ids()?;

        let delta = match self
            .service
            .get_differential_packages(self.repo.id(), &local_ids)?
        {
            ServiceReply::Ready(delta) => delta,
            ServiceReply::Locked => {
                info!("Service for '{}' is temporarily locked", self.repo.id());
                return Ok(DeltaOutcome::Locked);
            }
        };

        if delta.is_empty() {
            if force {
                return Ok(DeltaOutcome::Declined(
                    "empty delta on a forced refresh".to_string(),
                ));
            }
            info!("'{}': nothing to do", self.repo.id());
            return Ok(DeltaOutcome::Unchanged);
        }

        if delta.added.len() > self.settings.delta_threshold {
            return Ok(DeltaOutcome::Declined(format!(
                "delta of {} packages exceeds threshold {}",
                delta.added.len(),
                self.settings.delta_threshold
            )));
        }

        info!(
            "'{}': {} packages to add, {} to remove",
            self.repo.id(),
            delta.added.len(),
            delta.removed.len()
        );

        let segments = match self.fetch_segments(&delta.added, segment_dir)? {
            Some(segments) => segments,
            None => return Ok(DeltaOutcome::Locked),
        };

        let metadata = match self.service.get_repository_metadata(self.repo.id())? {
            ServiceReply::Ready(metadata) => metadata,
            ServiceReply::Locked => return Ok(DeltaOutcome::Locked),
        };

        PackageDatabase::open_existing(&db_path)?.snapshot_to(staging)?;
        {
            let mut work = PackageDatabase::open_existing(staging)?;
            let mut added = Vec::with_capacity(delta.added.len());
            for segment in &segments {
                added.extend(read_segment(segment)?);
            }
            let removed: Vec<i64> = delta.removed.iter().copied().collect();
            work.apply_delta(&added, &removed)?;

            work.replace_package_sets(&metadata.sets)?;
            work.replace_treeupdates(&metadata.treeupdates)?;
            if let Some(digest) = &metadata.treeupdates_digest {
                work.set_treeupdates_digest(self.repo.id(), digest)?;
            }
        }

        atomic_replace(staging, &db_path)?;

        let checksum = PackageDatabase::open_existing(&db_path)?.aggregate_checksum()?;
        let checksum_matches = checksum == delta.checksum;
        if !checksum_matches {
            warn!(
                "'{}': database checksum mismatch after differential sync (expected {}, got {})",
                self.repo.id(),
                delta.checksum,
                checksum
            );
        }

        let revision = if metadata.revision > 0 {
            metadata.revision
        } else {
            remote_revision
        };

        Ok(DeltaOutcome::Applied {
            revision,
            added: delta.added.len(),
            removed: delta.removed.len(),
            checksum_matches,
        })
    }

    /// Fetch all added records into segment files; `None` if the service locked
    fn fetch_segments(
        &self,
        added: &BTreeSet<i64>,
        segment_dir: &Path,
    ) -> Result<Option<Vec<PathBuf>>> {
        if segment_dir.exists() {
            fs::remove_dir_all(segment_dir)?;
        }
        fs::create_dir_all(segment_dir)?;

        let ids: Vec<i64> = added.iter().copied().collect();
        let mut segments = Vec::new();

        for (index, batch) in ids.chunks(self.settings.delta_batch_size.max(1)).enumerate() {
            let records = match self.fetch_batch(batch)? {
                Some(records) => records,
                None => return Ok(None),
            };
            let path = segment_dir.join(format!("segment_{}.cbor", index));
            write_segment(&path, &records)?;
            segments.push(path);
        }

        debug!("Stored {} segments for '{}'", segments.len(), self.repo.id());
        Ok(Some(segments))
    }

    fn fetch_batch(&self, batch: &[i64]) -> Result<Option<Vec<PackageRecord>>> {
        let retries = self.settings.delta_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=retries {
            match self.service.get_package_payloads(self.repo.id(), batch) {
                Ok(ServiceReply::Ready(records)) => {
                    check_batch(batch, &records)?;
                    return Ok(Some(records));
                }
                Ok(ServiceReply::Locked) => return Ok(None),
                Err(e) => {
                    warn!(
                        "Payload batch attempt {}/{} for '{}' failed: {}",
                        attempt,
                        retries,
                        self.repo.id(),
                        e
                    );
                    last_error = Some(e);
                    if attempt < retries {
                        std::thread::sleep(Duration::from_millis(
                            PAYLOAD_RETRY_DELAY_MS * attempt as u64,
                        ));
                    }
                }
            }
        }

        Err(Error::ProtocolError(format!(
            "payload batch failed after {} attempts: {}",
            retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

/// The service must return exactly the requested records
fn check_batch(batch: &[i64], records: &[PackageRecord]) -> Result<()> {
    let wanted: BTreeSet<i64> = batch.iter().copied().collect();
    let got: BTreeSet<i64> = records.iter().map(|r| r.package_id).collect();
    if wanted != got {
        return Err(Error::ProtocolError(format!(
            "payload batch mismatch: requested {:?}, received {:?}",
            wanted, got
        )));
    }
    Ok(())
}

fn write_segment(path: &Path, records: &[PackageRecord]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    ciborium::into_writer(records, &mut out)
        .map_err(|e| Error::IoError(format!("Failed to write {}: {}", path.display(), e)))?;
    Ok(())
}

fn read_segment(path: &Path) -> Result<Vec<PackageRecord>> {
    let reader = BufReader::new(File::open(path)?);
    ciborium::from_reader(reader)
        .map_err(|e| Error::ParseError(format!("Corrupt segment {}: {}", path.display(), e)))
}
