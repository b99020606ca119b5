// tests/mirror_sync.rs

//! Server side mirror synchronization against `file://` mirrors.

mod common;

use common::{Fixture, REPO_ID, client_package_ids, package};
use reposync::config::{EnvOverrides, SyncContext};
use reposync::gpg::{GpgSigner, GpgVerifier};
use reposync::lock::LockKind;
use reposync::repository::PackageDatabase;
use reposync::server::{MirrorSync, MirrorSyncResult};
use reposync::sync::{CancelToken, SyncOutcome, Updater};
use reposync::transport::{FileTransport, MirrorTransport, TransportKind};
use reposync::Error;
use sequoia_openpgp as openpgp;
use openpgp::cert::CertBuilder;
use openpgp::serialize::SerializeInto;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const LOCK_FILES: [&str; 2] = ["packages.db.lock", "packages.db.download.lock"];

#[test]
fn test_publish_to_empty_mirror() {
    let fixture = Fixture::new();
    let ctx = fixture.server_context();
    fixture.seed_server(&ctx, &[1, 2]);

    let sync = MirrorSync::new(&ctx).unwrap();
    let revision = sync.bump_revision(REPO_ID).unwrap();
    assert_eq!(revision, 1);

    let result = sync.sync_repository(REPO_ID, false).unwrap();
    assert_eq!(
        result,
        MirrorSyncResult::Synced {
            revision: 1,
            downloaded: None,
            uploaded: vec![fixture.mirror_uri("m1")],
            failed: Vec::new(),
        }
    );
    assert_eq!(result.code(), 0);

    let remote = fixture.mirror_dir("m1");
    assert_eq!(fs::read_to_string(remote.join("packages.db.revision")).unwrap().trim(), "1");
    for name in [
        "packages.db.gz",
        "packages.db.gz.md5",
        "packages.db.dumplight.gz",
        "packages.db.dumplight.gz.md5",
        "packages.db.timestamp",
        "packages.db.pkglist",
        "packages.db.meta",
    ] {
        assert!(remote.join(name).is_file(), "{} missing", name);
    }
    for name in LOCK_FILES {
        assert!(!remote.join(name).exists(), "{} left on mirror", name);
    }
    assert!(sync.locks().counts(REPO_ID).balanced());
}

#[test]
fn test_second_run_is_in_sync() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);

    let ctx = fixture.server_context();
    let sync = MirrorSync::new(&ctx).unwrap();
    assert_eq!(sync.sync_repository(REPO_ID, false).unwrap(), MirrorSyncResult::InSync);
}

#[test]
fn test_download_from_ahead_mirror() {
    let fixture = Fixture::new();
    let revision = fixture.publish(&[3, 4]);

    // a second server sees m1 ahead and m2 empty
    let mut settings = fixture.server_settings(&["m1", "m2"]);
    settings.repositories_dir = fixture.temp.path().join("server2");
    let ctx = SyncContext::new(settings, EnvOverrides::default());

    let sync = MirrorSync::new(&ctx).unwrap();
    let result = sync.sync_repository(REPO_ID, false).unwrap();
    assert_eq!(
        result,
        MirrorSyncResult::Synced {
            revision,
            downloaded: Some(fixture.mirror_uri("m1")),
            uploaded: vec![fixture.mirror_uri("m2")],
            failed: Vec::new(),
        }
    );

    let repo = Fixture::repository(&ctx);
    assert_eq!(repo.local_revision(), revision);
    let ids: Vec<i64> = PackageDatabase::open_existing(&repo.files.database())
        .unwrap()
        .list_package_ids()
        .unwrap()
        .into_iter()
        .collect();
    assert_eq!(ids, vec![3, 4]);
    assert!(fixture.mirror_dir("m2").join("packages.db.revision").is_file());
    for name in LOCK_FILES {
        assert!(!fixture.mirror_dir("m1").join(name).exists());
    }
}

/// Accepts lock markers but refuses every compressed artifact
struct RefusingTransport {
    inner: FileTransport,
}

impl MirrorTransport for RefusingTransport {
    fn download(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> reposync::Result<u64> {
        self.inner.download(uri, dest, cancel)
    }

    fn upload(&self, local: &Path, uri: &str) -> reposync::Result<()> {
        if uri.ends_with(".gz") {
            return Err(Error::UploadError(format!("{}: connection reset", uri)));
        }
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

fn refusing() -> Arc<dyn MirrorTransport> {
    Arc::new(RefusingTransport {
        inner: FileTransport::new(),
    })
}

#[test]
fn test_partial_upload_failure_is_reported() {
    let fixture = Fixture::new();
    let ctx = SyncContext::new(fixture.server_settings(&["m1", "m2"]), EnvOverrides::default());
    fixture.seed_server(&ctx, &[1, 2]);

    let sync = MirrorSync::new(&ctx)
        .unwrap()
        .with_transport(&fixture.mirror_uri("m1"), refusing());
    let revision = sync.bump_revision(REPO_ID).unwrap();

    let result = sync.sync_repository(REPO_ID, false).unwrap();
    assert_eq!(
        result,
        MirrorSyncResult::Synced {
            revision,
            downloaded: None,
            uploaded: vec![fixture.mirror_uri("m2")],
            failed: vec![fixture.mirror_uri("m1")],
        }
    );
    assert_eq!(result.code(), 0);

    let good = fixture.mirror_dir("m2");
    assert_eq!(
        fs::read_to_string(good.join("packages.db.revision")).unwrap().trim(),
        revision.to_string()
    );
    for name in LOCK_FILES {
        assert!(!good.join(name).exists(), "{} left on mirror", name);
    }
    // clients stay off the half-written mirror
    let bad = fixture.mirror_dir("m1");
    assert!(!bad.join("packages.db.revision").exists());
    assert!(!bad.join("packages.db.lock").exists());
    assert!(bad.join("packages.db.download.lock").exists());
    assert!(sync.locks().counts(REPO_ID).balanced());
}

#[test]
fn test_all_uploads_failing_is_upload_failed() {
    let fixture = Fixture::new();
    let ctx = SyncContext::new(fixture.server_settings(&["m1", "m2"]), EnvOverrides::default());
    fixture.seed_server(&ctx, &[1]);

    let sync = MirrorSync::new(&ctx)
        .unwrap()
        .with_transport(&fixture.mirror_uri("m1"), refusing())
        .with_transport(&fixture.mirror_uri("m2"), refusing());
    sync.bump_revision(REPO_ID).unwrap();

    let result = sync.sync_repository(REPO_ID, false).unwrap();
    assert_eq!(
        result,
        MirrorSyncResult::UploadFailed(vec![fixture.mirror_uri("m1"), fixture.mirror_uri("m2")])
    );
    assert_eq!(result.code(), 2);
    for mirror in ["m1", "m2"] {
        let dir = fixture.mirror_dir(mirror);
        assert!(!dir.join("packages.db.lock").exists(), "upload lock left on {}", mirror);
        assert!(!dir.join("packages.db.revision").exists());
    }
}

#[test]
fn test_foreign_upload_lock_refuses_sync() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);
    fs::write(fixture.mirror_dir("m1").join("packages.db.lock"), "4242\n").unwrap();

    let ctx = fixture.server_context();
    fixture.seed_server(&ctx, &[1, 2]);
    let sync = MirrorSync::new(&ctx).unwrap();
    sync.bump_revision(REPO_ID).unwrap();

    assert!(matches!(
        sync.sync_repository(REPO_ID, false),
        Err(Error::MirrorsLocked(_))
    ));
    assert!(fixture.mirror_dir("m1").join("packages.db.lock").exists());
    assert_eq!(
        fs::read_to_string(fixture.mirror_dir("m1").join("packages.db.revision"))
            .unwrap()
            .trim(),
        "1"
    );
}

#[test]
fn test_lock_and_unlock_mirrors() {
    let fixture = Fixture::new();
    fixture.publish(&[1]);
    let ctx = fixture.server_context();
    let sync = MirrorSync::new(&ctx).unwrap();

    let locked = sync.lock_mirrors(REPO_ID, LockKind::Download).unwrap();
    assert_eq!(locked, vec![fixture.mirror_uri("m1")]);
    assert!(fixture.mirror_dir("m1").join("packages.db.download.lock").exists());

    // clients back off while the download lock is present
    let client = fixture.client_context();
    let summary = Updater::new(&client).update(&[], false).unwrap();
    assert_eq!(summary.outcomes[0].1, SyncOutcome::SkippedLocked);

    sync.unlock_mirrors(REPO_ID, LockKind::Download).unwrap();
    assert!(!fixture.mirror_dir("m1").join("packages.db.download.lock").exists());
    let summary = Updater::new(&client).update(&[], false).unwrap();
    assert!(matches!(summary.outcomes[0].1, SyncOutcome::Updated { .. }));
}

#[test]
fn test_dependency_qa_blocks_upload() {
    let fixture = Fixture::new();
    let ctx = fixture.server_context();
    let repo = fixture.seed_server(&ctx, &[1]);
    let mut broken = package(2);
    broken.dependencies = vec!["dev-libs/absent".to_string()];
    PackageDatabase::open(&repo.files.database())
        .unwrap()
        .insert_package(&broken)
        .unwrap();

    let sync = MirrorSync::new(&ctx).unwrap();
    sync.bump_revision(REPO_ID).unwrap();

    let result = sync.sync_repository(REPO_ID, false).unwrap();
    assert!(matches!(&result, MirrorSyncResult::DependencyQaFailed(issues) if issues.len() == 1));
    assert_eq!(result.code(), 3);
    assert!(!fixture.mirror_dir("m1").join("packages.db.revision").exists());

    let forced = sync.sync_repository(REPO_ID, true).unwrap();
    assert!(matches!(forced, MirrorSyncResult::Synced { .. }));
    assert!(fixture.mirror_dir("m1").join("packages.db.revision").exists());
}

#[test]
fn test_failing_qa_hook_blocks_upload() {
    let fixture = Fixture::new();
    let hook = fixture.temp.path().join("qa.sh");
    fs::write(&hook, "exit 1\n").unwrap();

    let mut settings = fixture.server_settings(&["m1"]);
    settings.server.qa_hooks = vec![hook];
    let ctx = SyncContext::new(settings, EnvOverrides::default());
    fixture.seed_server(&ctx, &[1]);

    let sync = MirrorSync::new(&ctx).unwrap();
    sync.bump_revision(REPO_ID).unwrap();
    let result = sync.sync_repository(REPO_ID, false).unwrap();
    assert!(matches!(result, MirrorSyncResult::SystemQaFailed(_)));
    assert_eq!(result.code(), 4);
}

#[test]
fn test_signed_upload_verified_by_client() {
    let fixture = Fixture::new();
    let (cert, _revocation) = CertBuilder::new()
        .add_userid("repository@example.org")
        .add_signing_subkey()
        .generate()
        .unwrap();
    let secret = cert.as_tsk().armored().to_vec().unwrap();
    let signer = GpgSigner::from_bytes(&secret).unwrap();
    let public = cert.armored().to_vec().unwrap();

    let ctx = fixture.server_context();
    fixture.seed_server(&ctx, &[5, 6]);
    let sync = MirrorSync::new(&ctx).unwrap().with_signer(Box::new(signer));
    sync.bump_revision(REPO_ID).unwrap();
    assert!(matches!(
        sync.sync_repository(REPO_ID, false).unwrap(),
        MirrorSyncResult::Synced { .. }
    ));

    let remote = fixture.mirror_dir("m1");
    assert!(remote.join("packages.db.dumplight.gz.asc").is_file());
    assert!(remote.join("packages.db.key.asc").is_file());

    let mut settings = fixture.client_settings();
    settings.repositories[0].gpg_check = true;
    settings.repositories[0].gpg_strict = true;
    GpgVerifier::new(settings.client.keyring_dir.clone())
        .unwrap()
        .import_key(&public, REPO_ID)
        .unwrap();
    let client = SyncContext::new(settings, EnvOverrides::default());

    let summary = Updater::new(&client).update(&[], false).unwrap();
    assert!(matches!(summary.outcomes[0].1, SyncOutcome::Updated { .. }));
    assert_eq!(client_package_ids(&client), vec![5, 6]);
}
