// tests/common/mod.rs

//! Shared fixtures for integration tests.
//!
//! A fixture owns a temp directory holding a server repository tree, a
//! client repository tree and any number of `file://` mirrors.

#![allow(dead_code)]

use reposync::config::{EnvOverrides, RepositoryConfig, Settings, SyncContext};
use reposync::repository::{PackageDatabase, PackageRecord, Repository};
use reposync::server::{MirrorSync, MirrorSyncResult};
use std::path::PathBuf;
use tempfile::TempDir;

pub const REPO_ID: &str = "core";

pub struct Fixture {
    pub temp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn mirror_uri(&self, name: &str) -> String {
        url::Url::from_directory_path(self.temp.path().join(name))
            .unwrap()
            .to_string()
            .trim_end_matches('/')
            .to_string()
    }

    /// Remote database directory of `core` on a mirror
    pub fn mirror_dir(&self, name: &str) -> PathBuf {
        self.temp
            .path()
            .join(name)
            .join(REPO_ID)
            .join("database")
            .join("main")
    }

    fn settings(&self, root: &str, mirrors: &[&str]) -> Settings {
        let mut settings = Settings::default();
        settings.repositories_dir = self.temp.path().join(root);
        settings.server.lock_wait_secs = 0;
        settings.client.keyring_dir = self.temp.path().join("keys");
        settings.client.lock_poll_interval_ms = 20;

        let mut repo = RepositoryConfig::new(REPO_ID);
        repo.gpg_check = false;
        repo.database_mirrors = mirrors.iter().map(|m| self.mirror_uri(m)).collect();
        settings.repositories.push(repo);
        settings
    }

    pub fn server_settings(&self, mirrors: &[&str]) -> Settings {
        self.settings("server", mirrors)
    }

    pub fn client_settings(&self) -> Settings {
        self.settings("client", &["m1"])
    }

    pub fn server_context(&self) -> SyncContext {
        SyncContext::new(self.server_settings(&["m1"]), EnvOverrides::default())
    }

    pub fn client_context(&self) -> SyncContext {
        SyncContext::new(self.client_settings(), EnvOverrides::default())
    }

    pub fn repository(ctx: &SyncContext) -> Repository {
        Repository::from_context(ctx, &ctx.settings().repositories[0])
    }

    /// Make the server database hold exactly the packages `ids`
    pub fn seed_server(&self, ctx: &SyncContext, ids: &[i64]) -> Repository {
        let repo = Self::repository(ctx);
        repo.ensure_dir().unwrap();
        let db = PackageDatabase::open(&repo.files.database()).unwrap();
        for existing in db.list_package_ids().unwrap() {
            if !ids.contains(&existing) {
                db.remove_package(existing).unwrap();
            }
        }
        for id in ids {
            db.insert_package(&package(*id)).unwrap();
        }
        repo
    }

    /// Seed the server, bump its revision and push it to every mirror
    pub fn publish(&self, ids: &[i64]) -> u64 {
        let ctx = self.server_context();
        self.seed_server(&ctx, ids);
        let sync = MirrorSync::new(&ctx).unwrap();
        let revision = sync.bump_revision(REPO_ID).unwrap();
        match sync.sync_repository(REPO_ID, false).unwrap() {
            MirrorSyncResult::Synced { uploaded, .. } => assert!(!uploaded.is_empty()),
            other => panic!("publishing failed: {:?}", other),
        }
        revision
    }
}

pub fn package(id: i64) -> PackageRecord {
    let mut record = PackageRecord::new(id, "app-misc", &format!("pkg{}", id), "1.0");
    record.digest = format!("{:032x}", id);
    record.size = 1024 * id;
    record
}

pub fn client_package_ids(ctx: &SyncContext) -> Vec<i64> {
    let repo = Fixture::repository(ctx);
    PackageDatabase::open_existing(&repo.files.database())
        .unwrap()
        .list_package_ids()
        .unwrap()
        .into_iter()
        .collect()
}
