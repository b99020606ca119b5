// tests/client_sync.rs

//! Client update runs against `file://` mirrors populated by the server side.

mod common;

use common::{Fixture, REPO_ID, client_package_ids, package};
use reposync::config::{EnvOverrides, SyncContext};
use reposync::eapi::Eapi;
use reposync::repository::PackageDatabase;
use reposync::sync::{CancelToken, DeltaSet, MockService, ServiceReply, SyncOutcome, Updater};
use reposync::transport::{FileTransport, MirrorTransport, TransportKind};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn update(ctx: &SyncContext) -> SyncOutcome {
    let updater = Updater::new(ctx);
    let summary = updater.update(&[], false).unwrap();
    assert!(updater.locks().counts(REPO_ID).balanced());
    summary.outcomes[0].1.clone()
}

#[test]
fn test_update_is_idempotent() {
    let fixture = Fixture::new();
    let revision = fixture.publish(&[1, 2, 3]);
    let ctx = fixture.client_context();

    assert_eq!(
        update(&ctx),
        SyncOutcome::Updated {
            revision,
            eapi: Eapi::Two
        }
    );
    assert_eq!(client_package_ids(&ctx), vec![1, 2, 3]);

    let repo = Fixture::repository(&ctx);
    assert_eq!(repo.local_revision(), revision);
    let before = fs::read(repo.files.database()).unwrap();
    let modified = fs::metadata(repo.files.database()).unwrap().modified().unwrap();

    assert_eq!(update(&ctx), SyncOutcome::Unchanged);
    assert_eq!(fs::read(repo.files.database()).unwrap(), before);
    assert_eq!(
        fs::metadata(repo.files.database()).unwrap().modified().unwrap(),
        modified
    );
}

#[test]
fn test_new_revision_is_fetched() {
    let fixture = Fixture::new();
    fixture.publish(&[1, 2]);
    let ctx = fixture.client_context();
    update(&ctx);

    let revision = fixture.publish(&[2, 5]);
    assert!(matches!(update(&ctx), SyncOutcome::Updated { revision: r, .. } if r == revision));
    assert_eq!(client_package_ids(&ctx), vec![2, 5]);
}

#[test]
fn test_alignment_keeps_user_data() {
    let fixture = Fixture::new();
    fixture.publish(&[1, 2]);
    let ctx = fixture.client_context();
    update(&ctx);

    let repo = Fixture::repository(&ctx);
    PackageDatabase::open_existing(&repo.files.database())
        .unwrap()
        .set_user_data("note", "kept")
        .unwrap();

    fixture.publish(&[1, 3]);
    update(&ctx);

    let db = PackageDatabase::open_existing(&repo.files.database()).unwrap();
    assert_eq!(db.user_data("note").unwrap().as_deref(), Some("kept"));
    assert_eq!(
        db.list_package_ids().unwrap(),
        BTreeSet::from([1, 3])
    );
}

#[test]
fn test_forced_eapi1() {
    let fixture = Fixture::new();
    let revision = fixture.publish(&[4]);
    let overrides = EnvOverrides {
        force_eapi: Some(Eapi::One),
        ..EnvOverrides::default()
    };
    let ctx = SyncContext::new(fixture.client_settings(), overrides);

    assert_eq!(
        update(&ctx),
        SyncOutcome::Updated {
            revision,
            eapi: Eapi::One
        }
    );
    assert_eq!(client_package_ids(&ctx), vec![4]);
}

#[test]
fn test_missing_sidecar_still_commits() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);
    fs::remove_file(fixture.mirror_dir("m1").join("packages.db.dumplight.gz.md5")).unwrap();

    let ctx = fixture.client_context();
    assert!(matches!(update(&ctx), SyncOutcome::Updated { .. }));
    assert_eq!(client_package_ids(&ctx), vec![1]);
}

#[test]
fn test_checksum_mismatch_purges_artifacts() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);
    fs::write(
        fixture.mirror_dir("m1").join("packages.db.dumplight.gz.md5"),
        format!("{}  packages.db.dumplight.gz\n", "0".repeat(32)),
    )
    .unwrap();

    let ctx = fixture.client_context();
    assert!(matches!(update(&ctx), SyncOutcome::Error(_)));

    let repo = Fixture::repository(&ctx);
    assert_eq!(repo.local_revision(), 0);
    assert!(!repo.files.database().exists());
    for artifact in repo.files.transient_artifacts() {
        assert!(!artifact.exists(), "{} left behind", artifact.display());
    }
}

#[test]
fn test_malformed_sidecar_purges_artifacts() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);
    fs::write(
        fixture.mirror_dir("m1").join("packages.db.dumplight.gz.md5"),
        "<html><body>502 Bad Gateway</body></html>\n",
    )
    .unwrap();

    let ctx = fixture.client_context();
    assert!(matches!(update(&ctx), SyncOutcome::Error(_)));

    let repo = Fixture::repository(&ctx);
    assert_eq!(repo.local_revision(), 0);
    assert!(!repo.files.database().exists());
    for artifact in repo.files.transient_artifacts() {
        assert!(!artifact.exists(), "{} left behind", artifact.display());
    }
}

/// Drops the mirror download lock just as the database transfer starts
struct LockingTransport {
    inner: FileTransport,
    lock: PathBuf,
}

impl MirrorTransport for LockingTransport {
    fn download(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> reposync::Result<u64> {
        if uri.ends_with("packages.db.dumplight.gz") {
            fs::write(&self.lock, "1\n")?;
            thread::sleep(Duration::from_millis(300));
        }
        self.inner.download(uri, dest, cancel)
    }

    fn upload(&self, local: &Path, uri: &str) -> reposync::Result<()> {
        self.inner.upload(local, uri)
    }

    fn exists(&self, uri: &str) -> reposync::Result<bool> {
        self.inner.exists(uri)
    }

    fn delete(&self, uri: &str) -> reposync::Result<()> {
        self.inner.delete(uri)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::File
    }
}

#[test]
fn test_download_lock_mid_transfer_cancels() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);

    let ctx = fixture.client_context();
    let transport = LockingTransport {
        inner: FileTransport::new(),
        lock: fixture.mirror_dir("m1").join("packages.db.download.lock"),
    };
    let updater = Updater::new(&ctx).with_transport(&fixture.mirror_uri("m1"), Arc::new(transport));
    let summary = updater.update(&[], false).unwrap();

    assert_eq!(summary.outcomes[0].1, SyncOutcome::SkippedLocked);
    assert!(updater.locks().counts(REPO_ID).balanced());

    let repo = Fixture::repository(&ctx);
    assert_eq!(repo.local_revision(), 0);
    assert!(!repo.files.database().exists());
    for artifact in repo.files.transient_artifacts() {
        assert!(!artifact.exists(), "{} left behind", artifact.display());
    }
}

#[test]
fn test_download_lock_skips() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);
    fs::write(fixture.mirror_dir("m1").join("packages.db.download.lock"), "1\n").unwrap();

    let ctx = fixture.client_context();
    let updater = Updater::new(&ctx);
    let summary = updater.update(&[], false).unwrap();
    assert_eq!(summary.outcomes[0].1, SyncOutcome::SkippedLocked);
    assert_eq!(summary.exit_code(), 2);
    assert!(updater.locks().counts(REPO_ID).balanced());
    assert!(!Fixture::repository(&ctx).files.database().exists());
}

#[test]
fn test_strict_gpg_rejects_unsigned_mirror() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);

    let mut settings = fixture.client_settings();
    settings.repositories[0].gpg_check = true;
    settings.repositories[0].gpg_strict = true;
    let ctx = SyncContext::new(settings, EnvOverrides::default());

    assert!(matches!(update(&ctx), SyncOutcome::Error(_)));
    assert!(!Fixture::repository(&ctx).files.database().exists());
}

#[test]
fn test_post_update_hook_and_metafiles() {
    let fixture = Fixture::new();
    let server = Fixture::repository(&fixture.server_context());
    server.ensure_dir().unwrap();
    fs::write(server.files.path("packages.db.mask"), "app-misc/pkg9\n").unwrap();
    fixture.publish(&[1]);

    let marker = fixture.temp.path().join("hook.out");
    let hook = fixture.temp.path().join("hook.sh");
    fs::write(&hook, format!("echo \"$@\" > {}\n", marker.display())).unwrap();

    let mut settings = fixture.client_settings();
    settings.client.post_update_hook = Some(hook);
    let ctx = SyncContext::new(settings, EnvOverrides::default());
    assert!(matches!(update(&ctx), SyncOutcome::Updated { .. }));

    assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "core / main");
    let client = Fixture::repository(&ctx);
    assert_eq!(
        fs::read_to_string(client.files.path("packages.db.mask")).unwrap(),
        "app-misc/pkg9\n"
    );
}

#[test]
fn test_unknown_repository_is_an_error() {
    let fixture = Fixture::new();
    let ctx = fixture.client_context();
    assert!(Updater::new(&ctx).update(&["extra".to_string()], false).is_err());
}

// -----------------------------------------------------------------------------
// Differential sync
// -----------------------------------------------------------------------------

#[test]
fn test_differential_update() {
    let fixture = Fixture::new();
    fixture.publish(&[9, 10]);
    let ctx = fixture.client_context();
    update(&ctx);

    let mock = Arc::new(MockService::new());
    mock.set_revision(ServiceReply::Ready(7));
    mock.set_delta(ServiceReply::Ready(DeltaSet {
        added: BTreeSet::from([1, 2, 3]),
        removed: BTreeSet::from([9]),
        checksum: String::new(),
    }));
    for id in [1, 2, 3] {
        mock.add_payload(package(id));
    }

    let updater = Updater::new(&ctx).with_service(REPO_ID, mock.clone());
    let summary = updater.update(&[], false).unwrap();
    assert_eq!(
        summary.outcomes[0].1,
        SyncOutcome::Updated {
            revision: 7,
            eapi: Eapi::Three
        }
    );
    assert_eq!(client_package_ids(&ctx), vec![1, 2, 3, 10]);
    assert_eq!(Fixture::repository(&ctx).local_revision(), 7);
    assert_eq!(mock.payload_calls(), 1);
    assert!(updater.locks().counts(REPO_ID).balanced());
}

#[test]
fn test_differential_service_locked_is_unchanged() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);
    let ctx = fixture.client_context();

    let mock = Arc::new(MockService::new());
    mock.set_revision(ServiceReply::Locked);
    let summary = Updater::new(&ctx)
        .with_service(REPO_ID, mock)
        .update(&[], false)
        .unwrap();
    assert_eq!(summary.outcomes[0].1, SyncOutcome::Unchanged);
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn test_differential_falls_back_without_local_database() {
    let fixture = Fixture::new();
    let revision = fixture.publish(&[1, 2]);
    let ctx = fixture.client_context();

    let mock = Arc::new(MockService::new());
    mock.set_revision(ServiceReply::Ready(revision));
    let summary = Updater::new(&ctx)
        .with_service(REPO_ID, mock.clone())
        .update(&[], false)
        .unwrap();
    assert_eq!(
        summary.outcomes[0].1,
        SyncOutcome::Updated {
            revision,
            eapi: Eapi::Two
        }
    );
    assert_eq!(mock.payload_calls(), 0);
    assert_eq!(client_package_ids(&ctx), vec![1, 2]);
}
