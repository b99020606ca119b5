// src/server/packager.rs

//! Upload artifact builder
//!
//! Builds, from the server's committed database, the files every enabled
//! EAPI level expects on a mirror:
//!
//! - EAPI1: the compressed database and its light variant (without the
//!   `content` table), plus the raw database digest
//! - EAPI2: the compressed light dump
//! - always: timestamp, package list, metafiles bundle and revision marker
//!
//! Every artifact gets an MD5 sidecar and, when a signer is configured, a
//! detached `.asc` signature. EAPI3 has no files; its service reads the
//! database directly.

use crate::compression::{compress_file, pack_bundle};
use crate::config::ServerSettings;
use crate::eapi::Eapi;
use crate::error::{Error, Result};
use crate::gpg::ArtifactSigner;
use crate::hash::{ChecksumRecord, write_sidecar};
use crate::repository::{FileNames, PackageDatabase, Repository, write_revision};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Artifacts ready for upload
///
/// `files` is in upload order with the revision marker last. The files live
/// in a temporary directory removed when the bundle is dropped.
pub struct UploadBundle {
    dir: TempDir,
    pub files: Vec<PathBuf>,
    pub revision: u64,
}

impl UploadBundle {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Base names in upload order
    pub fn names(&self) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|f| f.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect()
    }
}

/// Name of the published public key
pub fn public_key_name(names: &FileNames) -> String {
    format!("{}.key.asc", names.database())
}

/// Builds upload bundles for one repository
pub struct UploadPackager<'a> {
    repo: &'a Repository,
    settings: &'a ServerSettings,
    signer: Option<&'a dyn ArtifactSigner>,
}

impl<'a> UploadPackager<'a> {
    pub fn new(
        repo: &'a Repository,
        settings: &'a ServerSettings,
        signer: Option<&'a dyn ArtifactSigner>,
    ) -> Self {
        Self {
            repo,
            settings,
            signer,
        }
    }

    fn enabled(&self, eapi: Eapi) -> bool {
        self.settings.enabled_eapis.contains(&eapi.level())
    }

    /// Build the bundle for the current local revision
    pub fn build(&self) -> Result<UploadBundle> {
        let database = self.repo.files.database();
        if !database.is_file() {
            return Err(Error::NotFoundError(format!(
                "no database to publish for '{}' at {}",
                self.repo.id(),
                database.display()
            )));
        }

        let revision = self.repo.local_revision();
        let names = self.repo.names();
        let format = names.format();
        let dir = TempDir::new_in(self.repo.files.dir())?;
        let out = |name: &str| dir.path().join(name);
        let db = PackageDatabase::open_existing(&database)?;

        let mut artifacts = Vec::new();

        if self.enabled(Eapi::One) {
            let raw = out(&names.database());
            db.snapshot_to(&raw)?;
            let raw_digest = ChecksumRecord::for_file(&raw)?;
            let raw_digest_path = out(&names.database_digest());
            raw_digest.write(&raw_digest_path)?;
            artifacts.push(raw_digest_path);

            let compressed = out(&names.compressed_database());
            compress_file(&raw, &compressed, format)?;
            artifacts.push(compressed);

            let light = out(&names.light_database());
            db.make_light_copy(&light)?;
            let compressed_light = out(&names.compressed_light_database());
            compress_file(&light, &compressed_light, format)?;
            artifacts.push(compressed_light);

            fs::remove_file(&raw)?;
            fs::remove_file(&light)?;
        }

        if self.enabled(Eapi::Two) {
            let dump = out(&names.dump_light());
            db.export_dump(&dump, false)?;
            let compressed_dump = out(&names.compressed_dump_light());
            compress_file(&dump, &compressed_dump, format)?;
            artifacts.push(compressed_dump);
            fs::remove_file(&dump)?;
        }

        let timestamp = out(&names.timestamp());
        fs::write(&timestamp, format!("{}\n", chrono::Utc::now().to_rfc3339()))?;
        artifacts.push(timestamp);

        let pkglist = out(&names.pkglist());
        let listed = db.write_pkglist(&pkglist)?;
        debug!("Package list of '{}' holds {} entries", self.repo.id(), listed);
        artifacts.push(pkglist);

        artifacts.push(self.build_metafiles(dir.path())?);

        let mut files = Vec::new();
        for artifact in artifacts {
            let is_digest = artifact.extension().is_some_and(|e| e == "md5");
            files.push(artifact.clone());
            if !is_digest {
                files.push(write_sidecar(&artifact)?);
            }
            if let Some(signer) = self.signer {
                files.push(signer.sign_file(&artifact)?);
            }
        }

        if let Some(signer) = self.signer {
            let key = out(&public_key_name(names));
            fs::write(&key, signer.public_key()?)?;
            files.push(key);
        }

        let revision_path = out(&names.revision());
        write_revision(&revision_path, revision)?;
        if let Some(signer) = self.signer {
            files.push(signer.sign_file(&revision_path)?);
        }
        files.push(revision_path);

        info!(
            "Built {} upload artifacts for '{}' revision {}",
            files.len(),
            self.repo.id(),
            revision
        );
        Ok(UploadBundle {
            dir,
            files,
            revision,
        })
    }

    /// Pack the configured metafiles, listing missing ones in the not-found file
    fn build_metafiles(&self, out_dir: &Path) -> Result<PathBuf> {
        let names = self.repo.names();
        let mut present = Vec::new();
        let mut missing = Vec::new();

        for name in &self.settings.metafiles {
            let path = self.repo.files.path(name);
            if path.is_file() {
                present.push(path);
            } else {
                missing.push(name.as_str());
            }
        }

        let notfound = out_dir.join(names.metafiles_notfound());
        let mut listing = missing.join("\n");
        if !listing.is_empty() {
            listing.push('\n');
        }
        fs::write(&notfound, listing)?;
        present.push(notfound);

        let bundle = out_dir.join(names.metafiles());
        pack_bundle(&bundle, &present, names.format())?;
        debug!(
            "Packed {} metafiles for '{}' ({} missing)",
            present.len() - 1,
            self.repo.id(),
            missing.len()
        );
        Ok(bundle)
    }
}
