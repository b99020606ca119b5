// src/repository/model.rs

//! Repository model and derived file names
//!
//! All artifact names derive from the database file name (`packages.db` by
//! default). The same names are used locally and on mirrors, so a remote
//! path is always `<mirror>/<repo id>/database/<branch>/<name>`.

use crate::commit::write_atomic;
use crate::compression::DbFormat;
use crate::config::{RepositoryConfig, SyncContext};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Names of every artifact derived from the database file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNames {
    db: String,
    format: DbFormat,
}

impl FileNames {
    pub fn new(db: impl Into<String>, format: DbFormat) -> Self {
        Self {
            db: db.into(),
            format,
        }
    }

    fn with(&self, suffix: &str) -> String {
        format!("{}{}", self.db, suffix)
    }

    pub fn format(&self) -> DbFormat {
        self.format
    }

    pub fn database(&self) -> String {
        self.db.clone()
    }

    /// Staging copy used while merging or applying deltas
    pub fn staging(&self) -> String {
        self.with(".sync")
    }

    pub fn revision(&self) -> String {
        self.with(".revision")
    }

    pub fn timestamp(&self) -> String {
        self.with(".timestamp")
    }

    pub fn pkglist(&self) -> String {
        self.with(".pkglist")
    }

    /// Digest of the uncompressed database
    pub fn database_digest(&self) -> String {
        self.with(".md5")
    }

    /// Upload lock: a server is writing the mirror
    pub fn upload_lock(&self) -> String {
        self.with(".lock")
    }

    /// Local repository lock, never published to mirrors
    pub fn local_lock(&self) -> String {
        self.with(".local.lock")
    }

    /// Download lock: clients must not fetch
    pub fn download_lock(&self) -> String {
        self.with(".download.lock")
    }

    /// Differential sync service temporarily unavailable
    pub fn service_lock(&self) -> String {
        self.with(".eapi3_lock")
    }

    pub fn metafiles(&self) -> String {
        self.with(".meta")
    }

    pub fn metafiles_notfound(&self) -> String {
        self.with(".meta_notfound")
    }

    pub fn compressed_database(&self) -> String {
        self.with(&format!(".{}", self.format.extension()))
    }

    pub fn light_database(&self) -> String {
        self.with(".light")
    }

    pub fn compressed_light_database(&self) -> String {
        self.with(&format!(".light.{}", self.format.extension()))
    }

    pub fn dump_light(&self) -> String {
        self.with(".dumplight")
    }

    pub fn compressed_dump_light(&self) -> String {
        self.with(&format!(".dumplight.{}", self.format.extension()))
    }

    /// Sidecar digest name for any artifact name
    pub fn digest_of(name: &str) -> String {
        format!("{}.md5", name)
    }

    /// Detached signature name for any artifact name
    pub fn signature_of(name: &str) -> String {
        format!("{}.asc", name)
    }
}

/// Local paths of a repository's artifacts
#[derive(Debug, Clone)]
pub struct RepositoryFiles {
    dir: PathBuf,
    names: FileNames,
}

impl RepositoryFiles {
    pub fn new(dir: impl Into<PathBuf>, names: FileNames) -> Self {
        Self {
            dir: dir.into(),
            names,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn names(&self) -> &FileNames {
        &self.names
    }

    /// Local path of a derived name
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn database(&self) -> PathBuf {
        self.path(&self.names.database())
    }

    pub fn staging(&self) -> PathBuf {
        self.path(&self.names.staging())
    }

    pub fn revision(&self) -> PathBuf {
        self.path(&self.names.revision())
    }

    /// Directory of transient differential sync segments
    pub fn segment_dir(&self) -> PathBuf {
        self.dir.join("eapi3")
    }

    /// Files fetched or produced during a client update, purged on failure
    pub fn transient_artifacts(&self) -> Vec<PathBuf> {
        let n = &self.names;
        [
            n.staging(),
            n.compressed_database(),
            FileNames::digest_of(&n.compressed_database()),
            FileNames::signature_of(&n.compressed_database()),
            n.compressed_dump_light(),
            FileNames::digest_of(&n.compressed_dump_light()),
            FileNames::signature_of(&n.compressed_dump_light()),
            n.dump_light(),
            n.metafiles(),
        ]
        .iter()
        .map(|name| self.path(name))
        .collect()
    }
}

/// A configured repository bound to its local directory
#[derive(Debug, Clone)]
pub struct Repository {
    pub config: RepositoryConfig,
    pub branch: String,
    pub files: RepositoryFiles,
}

impl Repository {
    /// Bind a repository configuration to the directories of a sync context
    pub fn from_context(ctx: &SyncContext, config: &RepositoryConfig) -> Self {
        let names = FileNames::new(ctx.settings().database_name.clone(), config.dbformat);
        Self {
            config: config.clone(),
            branch: ctx.branch().to_string(),
            files: RepositoryFiles::new(ctx.repository_dir(&config.id), names),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn names(&self) -> &FileNames {
        self.files.names()
    }

    /// Remote database directory on a mirror
    pub fn remote_dir(&self, mirror: &str) -> String {
        format!(
            "{}/{}/database/{}",
            mirror.trim_end_matches('/'),
            self.config.id,
            self.branch
        )
    }

    /// Remote URI of a derived name on a mirror
    pub fn remote_uri(&self, mirror: &str, name: &str) -> String {
        format!("{}/{}", self.remote_dir(mirror), name)
    }

    /// Create the local repository directory
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(self.files.dir()).map_err(|e| {
            Error::IoError(format!(
                "Failed to create {}: {}",
                self.files.dir().display(),
                e
            ))
        })
    }

    /// Locally recorded revision, 0 when absent
    pub fn local_revision(&self) -> u64 {
        read_revision(&self.files.revision())
    }

    /// Record a new local revision
    pub fn write_revision(&self, revision: u64) -> Result<()> {
        write_revision(&self.files.revision(), revision)
    }
}

/// Parse revision file content; anything unparsable is 0
pub fn parse_revision(content: &str) -> u64 {
    let first = content.lines().next().unwrap_or_default().trim();
    match first.parse::<u64>() {
        Ok(revision) => revision,
        Err(_) => {
            if !first.is_empty() {
                warn!("Invalid revision marker '{}', treating as 0", first);
            }
            0
        }
    }
}

/// Read a revision marker file, 0 when missing or invalid
pub fn read_revision(path: &Path) -> u64 {
    fs::read_to_string(path)
        .map(|content| parse_revision(&content))
        .unwrap_or(0)
}

/// Atomically write a revision marker file
pub fn write_revision(path: &Path, revision: u64) -> Result<()> {
    write_atomic(path, format!("{}\n", revision).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvOverrides, Settings};
    use tempfile::TempDir;

    #[test]
    fn test_derived_names() {
        let names = FileNames::new("packages.db", DbFormat::Gz);
        assert_eq!(names.revision(), "packages.db.revision");
        assert_eq!(names.download_lock(), "packages.db.download.lock");
        assert_eq!(names.upload_lock(), "packages.db.lock");
        assert_eq!(names.local_lock(), "packages.db.local.lock");
        assert_eq!(names.service_lock(), "packages.db.eapi3_lock");
        assert_eq!(names.compressed_database(), "packages.db.gz");
        assert_eq!(names.compressed_light_database(), "packages.db.light.gz");
        assert_eq!(names.compressed_dump_light(), "packages.db.dumplight.gz");
        assert_eq!(
            FileNames::digest_of(&names.compressed_dump_light()),
            "packages.db.dumplight.gz.md5"
        );

        let names = FileNames::new("packages.db", DbFormat::Zst);
        assert_eq!(names.compressed_database(), "packages.db.zst");
    }

    #[test]
    fn test_remote_paths() {
        let mut settings = Settings::default();
        settings.repositories_dir = "/tmp/repos".into();
        let ctx = SyncContext::new(settings, EnvOverrides::default());
        let config = RepositoryConfig::new("core");
        let repo = Repository::from_context(&ctx, &config);

        assert_eq!(
            repo.remote_uri("http://mirror.example.org/pub/", "packages.db.revision"),
            "http://mirror.example.org/pub/core/database/main/packages.db.revision"
        );
        assert_eq!(repo.files.dir(), Path::new("/tmp/repos/core/main"));
    }

    #[test]
    fn test_revision_io() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("packages.db.revision");
        assert_eq!(read_revision(&path), 0);

        write_revision(&path, 42).unwrap();
        assert_eq!(read_revision(&path), 42);

        fs::write(&path, "garbage\n").unwrap();
        assert_eq!(read_revision(&path), 0);
        assert_eq!(parse_revision(" 17 \nextra"), 17);
    }
}
