// src/repository/database.rs

//! SQLite package database of a repository
//!
//! The database is the payload every EAPI level transports. EAPI 1 ships the
//! whole file, EAPI 2 ships a JSON-lines dump of the light variant (no
//! `content` table), EAPI 3 ships individual package records.
//!
//! `user_data` holds state added locally on a client. It never appears in
//! dumps and survives EAPI 2 alignment.

use crate::commit::write_atomic;
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, Hasher};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS packages (
        package_id INTEGER PRIMARY KEY,
        atom TEXT NOT NULL,
        name TEXT NOT NULL,
        version TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT '',
        slot TEXT NOT NULL DEFAULT '0',
        digest TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS dependencies (
        package_id INTEGER NOT NULL,
        dependency TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS content (
        package_id INTEGER NOT NULL,
        path TEXT NOT NULL,
        kind TEXT NOT NULL DEFAULT 'obj'
    );
    CREATE TABLE IF NOT EXISTS package_sets (
        set_name TEXT NOT NULL,
        dependency TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS treeupdates (
        repository TEXT NOT NULL,
        command TEXT NOT NULL,
        branch TEXT NOT NULL,
        date TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS treeupdates_digest (
        repository TEXT PRIMARY KEY,
        digest TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS user_data (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// A package row plus its dependencies, without file content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub package_id: i64,
    pub atom: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_slot")]
    pub slot: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_slot() -> String {
    "0".to_string()
}

impl PackageRecord {
    /// Create a record with defaults for the optional columns
    pub fn new(package_id: i64, category: &str, name: &str, version: &str) -> Self {
        Self {
            package_id,
            atom: format!("{}/{}-{}", category, name, version),
            name: name.to_string(),
            version: version.to_string(),
            category: category.to_string(),
            slot: default_slot(),
            digest: String::new(),
            size: 0,
            dependencies: Vec::new(),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package_id: row.get(0)?,
            atom: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            category: row.get(4)?,
            slot: row.get(5)?,
            digest: row.get(6)?,
            size: row.get(7)?,
            dependencies: Vec::new(),
        })
    }
}

/// One file owned by a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub package_id: i64,
    pub path: String,
    pub kind: String,
}

/// A package move/slotmove action recorded by the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUpdate {
    pub repository: String,
    pub command: String,
    pub branch: String,
    pub date: String,
}

/// A line of a database dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
enum DumpEntry {
    Package(PackageRecord),
    Content(ContentEntry),
    PackageSet { set_name: String, dependency: String },
    TreeUpdate(TreeUpdate),
    TreeUpdatesDigest { repository: String, digest: String },
    Setting { key: String, value: String },
}

/// Outcome of aligning a local database with a fresh snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignStats {
    pub added: usize,
    pub removed: usize,
}

const PACKAGE_COLUMNS: &str = "package_id, atom, name, version, category, slot, digest, size";

/// Package database handle
pub struct PackageDatabase {
    conn: Connection,
    path: PathBuf,
}

impl PackageDatabase {
    /// Open (creating if needed) a package database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )?;
        if version < SCHEMA_VERSION {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing database; missing files are an error
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotFoundError(format!(
                "database {} not found",
                path.display()
            )));
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // -------------------------------------------------------------------------
    // Packages
    // -------------------------------------------------------------------------

    /// Insert or replace a package and its dependencies
    pub fn insert_package(&self, record: &PackageRecord) -> Result<()> {
        insert_package_row(&self.conn, record)
    }

    /// Remove a package and everything it owns
    pub fn remove_package(&self, package_id: i64) -> Result<bool> {
        remove_package_rows(&self.conn, package_id)
    }

    /// Add a content entry
    pub fn insert_content(&self, entry: &ContentEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO content (package_id, path, kind) VALUES (?1, ?2, ?3)",
            params![entry.package_id, &entry.path, &entry.kind],
        )?;
        Ok(())
    }

    pub fn list_package_ids(&self) -> Result<BTreeSet<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT package_id FROM packages ORDER BY package_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<BTreeSet<i64>, _>>()?;
        Ok(ids)
    }

    pub fn count_packages(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Package record with dependencies but without content
    pub fn get_package_record(&self, package_id: i64) -> Result<Option<PackageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM packages WHERE package_id = ?1",
            PACKAGE_COLUMNS
        ))?;
        let record = stmt
            .query_row([package_id], PackageRecord::from_row)
            .optional()?;

        match record {
            Some(mut record) => {
                record.dependencies = self.dependencies_of(package_id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn dependencies_of(&self, package_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT dependency FROM dependencies WHERE package_id = ?1 ORDER BY dependency",
        )?;
        let deps = stmt
            .query_map([package_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(deps)
    }

    pub fn content_of(&self, package_id: i64) -> Result<Vec<ContentEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT package_id, path, kind FROM content WHERE package_id = ?1 ORDER BY path",
        )?;
        let entries = stmt
            .query_map([package_id], |row| {
                Ok(ContentEntry {
                    package_id: row.get(0)?,
                    path: row.get(1)?,
                    kind: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Dependencies that no package in this repository provides
    pub fn missing_dependencies(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.atom, d.dependency FROM dependencies d
             JOIN packages p ON p.package_id = d.package_id
             WHERE d.dependency NOT IN (SELECT name FROM packages)
               AND d.dependency NOT IN (SELECT category || '/' || name FROM packages)
             ORDER BY p.atom, d.dependency",
        )?;
        let missing = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(missing)
    }

    /// Apply a delta in a single transaction: inserts first, then deletes
    pub fn apply_delta(&mut self, added: &[PackageRecord], removed: &[i64]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for record in added {
            insert_package_row(&tx, record)?;
        }
        for package_id in removed {
            remove_package_rows(&tx, *package_id)?;
        }
        tx.commit()?;
        debug!(
            "Applied delta to {}: +{} -{}",
            self.path.display(),
            added.len(),
            removed.len()
        );
        Ok(())
    }

    /// Order-independent MD5 over all package rows
    ///
    /// Rows are hashed ordered by package id, so two databases holding the
    /// same packages agree regardless of insertion history.
    pub fn aggregate_checksum(&self) -> Result<String> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM packages ORDER BY package_id",
            PACKAGE_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut hasher = Hasher::new(HashAlgorithm::Md5);
        while let Some(row) = rows.next()? {
            let record = PackageRecord::from_row(row)?;
            hasher.update(
                format!(
                    "{}|{}|{}|{}|{}|{}|{}|{}\n",
                    record.package_id,
                    record.atom,
                    record.name,
                    record.version,
                    record.category,
                    record.slot,
                    record.digest,
                    record.size
                )
                .as_bytes(),
            );
        }
        Ok(hasher.finalize())
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    pub fn package_sets(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT set_name, dependency FROM package_sets")?;
        let mut rows = stmt.query([])?;
        let mut sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let dep: String = row.get(1)?;
            sets.entry(name).or_default().insert(dep);
        }
        Ok(sets)
    }

    pub fn replace_package_sets(&mut self, sets: &BTreeMap<String, BTreeSet<String>>) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM package_sets", [])?;
        for (name, deps) in sets {
            for dep in deps {
                tx.execute(
                    "INSERT INTO package_sets (set_name, dependency) VALUES (?1, ?2)",
                    params![name, dep],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn treeupdates(&self) -> Result<Vec<TreeUpdate>> {
        let mut stmt = self.conn.prepare(
            "SELECT repository, command, branch, date FROM treeupdates ORDER BY date, rowid",
        )?;
        let updates = stmt
            .query_map([], |row| {
                Ok(TreeUpdate {
                    repository: row.get(0)?,
                    command: row.get(1)?,
                    branch: row.get(2)?,
                    date: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(updates)
    }

    /// Replace all tree update actions
    pub fn replace_treeupdates(&mut self, updates: &[TreeUpdate]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM treeupdates", [])?;
        for update in updates {
            insert_treeupdate(&tx, update)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn add_treeupdate(&self, update: &TreeUpdate) -> Result<()> {
        insert_treeupdate(&self.conn, update)
    }

    pub fn treeupdates_digest(&self, repository: &str) -> Result<Option<String>> {
        let digest = self
            .conn
            .query_row(
                "SELECT digest FROM treeupdates_digest WHERE repository = ?1",
                [repository],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest)
    }

    pub fn set_treeupdates_digest(&self, repository: &str, digest: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO treeupdates_digest (repository, digest) VALUES (?1, ?2)",
            params![repository, digest],
        )?;
        Ok(())
    }

    pub fn user_data(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM user_data WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_user_data(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO user_data (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    /// Write a consistent copy of the database to `dst`
    pub fn snapshot_to(&self, dst: &Path) -> Result<()> {
        if dst.exists() {
            fs::remove_file(dst)?;
        }
        self.conn
            .execute("VACUUM INTO ?1", [dst.to_string_lossy().as_ref()])?;
        Ok(())
    }

    /// Write a copy without the `content` table rows or local user data
    pub fn make_light_copy(&self, dst: &Path) -> Result<()> {
        self.snapshot_to(dst)?;
        let light = Connection::open(dst)?;
        light.execute_batch("DELETE FROM content; DELETE FROM user_data; VACUUM;")?;
        Ok(())
    }

    /// Export all tables except local user data as JSON lines
    pub fn export_dump(&self, dst: &Path, include_content: bool) -> Result<()> {
        let mut out = BufWriter::new(File::create(dst)?);
        let mut write = |entry: DumpEntry| -> Result<()> {
            serde_json::to_writer(&mut out, &entry)?;
            out.write_all(b"\n")?;
            Ok(())
        };

        for package_id in self.list_package_ids()? {
            if let Some(record) = self.get_package_record(package_id)? {
                write(DumpEntry::Package(record))?;
            }
            if include_content {
                for entry in self.content_of(package_id)? {
                    write(DumpEntry::Content(entry))?;
                }
            }
        }
        for (set_name, deps) in self.package_sets()? {
            for dependency in deps {
                write(DumpEntry::PackageSet {
                    set_name: set_name.clone(),
                    dependency,
                })?;
            }
        }
        for update in self.treeupdates()? {
            write(DumpEntry::TreeUpdate(update))?;
        }
        {
            let mut stmt = self
                .conn
                .prepare("SELECT repository, digest FROM treeupdates_digest ORDER BY repository")?;
            let digests = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
            for (repository, digest) in digests {
                write(DumpEntry::TreeUpdatesDigest { repository, digest })?;
            }
        }
        {
            let mut stmt = self
                .conn
                .prepare("SELECT key, value FROM settings ORDER BY key")?;
            let settings = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
            for (key, value) in settings {
                write(DumpEntry::Setting { key, value })?;
            }
        }

        out.flush()?;
        out.get_ref().sync_all()?;
        debug!("Exported dump of {} to {}", self.path.display(), dst.display());
        Ok(())
    }

    /// Build a fresh database at `db_path` from a dump file
    pub fn import_dump(dump: &Path, db_path: &Path) -> Result<Self> {
        if db_path.exists() {
            fs::remove_file(db_path)?;
        }
        let mut db = Self::open(db_path)?;
        let reader = BufReader::new(File::open(dump).map_err(|e| {
            Error::IoError(format!("Failed to open dump {}: {}", dump.display(), e))
        })?);

        let tx = db.conn.transaction()?;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpEntry = serde_json::from_str(&line).map_err(|e| {
                Error::ParseError(format!("dump line {}: {}", lineno + 1, e))
            })?;
            match entry {
                DumpEntry::Package(record) => insert_package_row(&tx, &record)?,
                DumpEntry::Content(entry) => {
                    tx.execute(
                        "INSERT INTO content (package_id, path, kind) VALUES (?1, ?2, ?3)",
                        params![entry.package_id, entry.path, entry.kind],
                    )?;
                }
                DumpEntry::PackageSet {
                    set_name,
                    dependency,
                } => {
                    tx.execute(
                        "INSERT INTO package_sets (set_name, dependency) VALUES (?1, ?2)",
                        params![set_name, dependency],
                    )?;
                }
                DumpEntry::TreeUpdate(update) => insert_treeupdate(&tx, &update)?,
                DumpEntry::TreeUpdatesDigest { repository, digest } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO treeupdates_digest (repository, digest) VALUES (?1, ?2)",
                        params![repository, digest],
                    )?;
                }
                DumpEntry::Setting { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
            }
        }
        tx.commit()?;
        info!("Imported dump {} into {}", dump.display(), db_path.display());
        Ok(db)
    }

    /// Merge a fresh snapshot into this database, keeping local user data
    ///
    /// Packages missing from `fresh` or whose row changed are dropped, new
    /// ones are copied over, and repository metadata is replaced wholesale.
    pub fn align_with(&mut self, fresh: &Path) -> Result<AlignStats> {
        self.conn.execute(
            "ATTACH DATABASE ?1 AS fresh",
            [fresh.to_string_lossy().as_ref()],
        )?;
        let result = self.align_attached();
        let detach = self.conn.execute("DETACH DATABASE fresh", []);
        let stats = result?;
        detach?;
        info!(
            "Aligned {}: +{} -{}",
            self.path.display(),
            stats.added,
            stats.removed
        );
        Ok(stats)
    }

    fn align_attached(&mut self) -> Result<AlignStats> {
        let tx = self.conn.transaction()?;

        let removed = tx.execute(
            "DELETE FROM main.packages WHERE package_id NOT IN (
                 SELECT f.package_id FROM fresh.packages f
                 JOIN main.packages m ON m.package_id = f.package_id
                 WHERE m.atom = f.atom AND m.version = f.version AND m.slot = f.slot
                   AND m.digest = f.digest AND m.size = f.size
                   AND m.name = f.name AND m.category = f.category
             )",
            [],
        )?;
        tx.execute(
            "DELETE FROM main.content WHERE package_id NOT IN (SELECT package_id FROM main.packages)",
            [],
        )?;
        tx.execute(
            "DELETE FROM main.dependencies WHERE package_id NOT IN (SELECT package_id FROM main.packages)",
            [],
        )?;

        let added = tx.execute(
            &format!(
                "INSERT INTO main.packages ({cols}) SELECT {cols} FROM fresh.packages
                 WHERE package_id NOT IN (SELECT package_id FROM main.packages)",
                cols = PACKAGE_COLUMNS
            ),
            [],
        )?;
        tx.execute(
            "INSERT INTO main.dependencies (package_id, dependency)
             SELECT package_id, dependency FROM fresh.dependencies
             WHERE package_id NOT IN (SELECT DISTINCT package_id FROM main.dependencies)",
            [],
        )?;
        tx.execute(
            "INSERT INTO main.content (package_id, path, kind)
             SELECT package_id, path, kind FROM fresh.content
             WHERE package_id NOT IN (SELECT DISTINCT package_id FROM main.content)",
            [],
        )?;

        tx.execute_batch(
            "DELETE FROM main.package_sets;
             INSERT INTO main.package_sets SELECT set_name, dependency FROM fresh.package_sets;
             DELETE FROM main.treeupdates;
             INSERT INTO main.treeupdates SELECT repository, command, branch, date FROM fresh.treeupdates;
             DELETE FROM main.treeupdates_digest;
             INSERT INTO main.treeupdates_digest SELECT repository, digest FROM fresh.treeupdates_digest;
             DELETE FROM main.settings;
             INSERT INTO main.settings SELECT key, value FROM fresh.settings;",
        )?;

        tx.commit()?;
        Ok(AlignStats { added, removed })
    }

    /// Create lookup indexes and rebuild existing ones
    pub fn rebuild_indexes(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS packages_name ON packages(name);
             CREATE INDEX IF NOT EXISTS dependencies_pkg ON dependencies(package_id);
             CREATE INDEX IF NOT EXISTS content_pkg ON content(package_id);
             CREATE INDEX IF NOT EXISTS package_sets_name ON package_sets(set_name);
             REINDEX;",
        )?;
        Ok(())
    }

    /// Write the sorted list of package atoms, one per line
    pub fn write_pkglist(&self, dst: &Path) -> Result<usize> {
        let mut stmt = self.conn.prepare("SELECT atom FROM packages ORDER BY atom")?;
        let atoms = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        let mut content = atoms.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        write_atomic(dst, content.as_bytes())?;
        Ok(atoms.len())
    }
}

fn insert_package_row(conn: &Connection, record: &PackageRecord) -> Result<()> {
    remove_package_rows(conn, record.package_id)?;
    conn.execute(
        &format!(
            "INSERT INTO packages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            PACKAGE_COLUMNS
        ),
        params![
            record.package_id,
            &record.atom,
            &record.name,
            &record.version,
            &record.category,
            &record.slot,
            &record.digest,
            record.size,
        ],
    )?;
    for dep in &record.dependencies {
        conn.execute(
            "INSERT INTO dependencies (package_id, dependency) VALUES (?1, ?2)",
            params![record.package_id, dep],
        )?;
    }
    Ok(())
}

fn remove_package_rows(conn: &Connection, package_id: i64) -> Result<bool> {
    conn.execute("DELETE FROM content WHERE package_id = ?1", [package_id])?;
    conn.execute("DELETE FROM dependencies WHERE package_id = ?1", [package_id])?;
    let removed = conn.execute("DELETE FROM packages WHERE package_id = ?1", [package_id])?;
    Ok(removed > 0)
}

fn insert_treeupdate(conn: &Connection, update: &TreeUpdate) -> Result<()> {
    conn.execute(
        "INSERT INTO treeupdates (repository, command, branch, date) VALUES (?1, ?2, ?3, ?4)",
        params![&update.repository, &update.command, &update.branch, &update.date],
    )?;
    Ok(())
}
