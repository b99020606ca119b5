// src/sync/service.rs

//! Repository service used by the EAPI3 differential sync
//!
//! [`RepositoryService`] is the client-side view of the RPC peer. Session
//! setup and framing belong to whatever carries the calls; this module
//! provides:
//!
//! - [`ServiceHandler`], answering calls from a server's local database
//! - [`HttpServiceClient`], posting [`ServiceRequest`]s as JSON
//! - [`MockService`], canned replies for tests
//!
//! Every call may answer [`ServiceReply::Locked`] while the server is
//! rebuilding its database.

use crate::error::{Error, Result};
use crate::repository::{PackageDatabase, PackageRecord, Repository, TreeUpdate};
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Package id delta between a client and the authoritative database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSet {
    pub added: BTreeSet<i64>,
    pub removed: BTreeSet<i64>,
    /// Aggregate checksum of the database after applying the delta
    pub checksum: String,
}

impl DeltaSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Compute the delta turning `local` into `authoritative`
    pub fn between(local: &BTreeSet<i64>, authoritative: &BTreeSet<i64>, checksum: String) -> Self {
        Self {
            added: authoritative.difference(local).copied().collect(),
            removed: local.difference(authoritative).copied().collect(),
            checksum,
        }
    }
}

/// Repository-wide metadata sent after the package delta
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub sets: BTreeMap<String, BTreeSet<String>>,
    pub treeupdates: Vec<TreeUpdate>,
    pub treeupdates_digest: Option<String>,
    pub revision: u64,
}

/// Reply of a service call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ServiceReply<T> {
    Ready(T),
    /// Service temporarily unavailable, try later
    Locked,
}

impl<T> ServiceReply<T> {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// Calls understood by the repository service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ServiceRequest {
    GetRepositoryRevision {
        repository: String,
    },
    GetDifferentialPackages {
        repository: String,
        package_ids: BTreeSet<i64>,
    },
    GetPackagePayloads {
        repository: String,
        package_ids: Vec<i64>,
    },
    GetRepositoryMetadata {
        repository: String,
    },
}

impl ServiceRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::GetRepositoryRevision { .. } => "get_repository_revision",
            Self::GetDifferentialPackages { .. } => "get_differential_packages",
            Self::GetPackagePayloads { .. } => "get_package_payloads",
            Self::GetRepositoryMetadata { .. } => "get_repository_metadata",
        }
    }
}

/// Client view of the differential sync RPC peer
pub trait RepositoryService: Send + Sync {
    fn get_repository_revision(&self, repository: &str) -> Result<ServiceReply<u64>>;

    fn get_differential_packages(
        &self,
        repository: &str,
        local_ids: &BTreeSet<i64>,
    ) -> Result<ServiceReply<DeltaSet>>;

    fn get_package_payloads(
        &self,
        repository: &str,
        package_ids: &[i64],
    ) -> Result<ServiceReply<Vec<PackageRecord>>>;

    fn get_repository_metadata(&self, repository: &str) -> Result<ServiceReply<RepositoryMetadata>>;
}

// =============================================================================
// Server side
// =============================================================================

/// Answers service calls from a server's repository directory
pub struct ServiceHandler {
    repo: Repository,
}

impl ServiceHandler {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    fn locked(&self) -> bool {
        self.repo
            .files
            .path(&self.repo.names().service_lock())
            .exists()
    }

    fn check_repository(&self, repository: &str) -> Result<()> {
        if repository != self.repo.id() {
            return Err(Error::ProtocolError(format!(
                "repository '{}' is not served here",
                repository
            )));
        }
        Ok(())
    }

    fn open(&self) -> Result<PackageDatabase> {
        PackageDatabase::open_existing(&self.repo.files.database())
    }

    /// Run `call` unless the service lock is present
    fn serve<T, F>(&self, repository: &str, call: F) -> Result<ServiceReply<T>>
    where
        F: FnOnce(&PackageDatabase) -> Result<T>,
    {
        self.check_repository(repository)?;
        if self.locked() {
            debug!("Service for '{}' is locked", repository);
            return Ok(ServiceReply::Locked);
        }
        let db = self.open()?;
        Ok(ServiceReply::Ready(call(&db)?))
    }

    /// Answer a request, serializing the reply to JSON
    pub fn dispatch(&self, request: &ServiceRequest) -> Result<serde_json::Value> {
        debug!("Service call {}", request.method());
        let value = match request {
            ServiceRequest::GetRepositoryRevision { repository } => {
                serde_json::to_value(self.get_repository_revision(repository)?)?
            }
            ServiceRequest::GetDifferentialPackages {
                repository,
                package_ids,
            } => serde_json::to_value(self.get_differential_packages(repository, package_ids)?)?,
            ServiceRequest::GetPackagePayloads {
                repository,
                package_ids,
            } => serde_json::to_value(self.get_package_payloads(repository, package_ids)?)?,
            ServiceRequest::GetRepositoryMetadata { repository } => {
                serde_json::to_value(self.get_repository_metadata(repository)?)?
            }
        };
        Ok(value)
    }
}

impl RepositoryService for ServiceHandler {
    fn get_repository_revision(&self, repository: &str) -> Result<ServiceReply<u64>> {
        self.check_repository(repository)?;
        if self.locked() {
            return Ok(ServiceReply::Locked);
        }
        Ok(ServiceReply::Ready(self.repo.local_revision()))
    }

    fn get_differential_packages(
        &self,
        repository: &str,
        local_ids: &BTreeSet<i64>,
    ) -> Result<ServiceReply<DeltaSet>> {
        self.serve(repository, |db| {
            let mine = db.list_package_ids()?;
            Ok(DeltaSet::between(local_ids, &mine, db.aggregate_checksum()?))
        })
    }

    fn get_package_payloads(
        &self,
        repository: &str,
        package_ids: &[i64],
    ) -> Result<ServiceReply<Vec<PackageRecord>>> {
        self.serve(repository, |db| {
            let mut records = Vec::with_capacity(package_ids.len());
            for id in package_ids {
                let record = db.get_package_record(*id)?.ok_or_else(|| {
                    Error::NotFoundError(format!("package {} not in '{}'", id, repository))
                })?;
                records.push(record);
            }
            Ok(records)
        })
    }

    fn get_repository_metadata(&self, repository: &str) -> Result<ServiceReply<RepositoryMetadata>> {
        let revision = self.repo.local_revision();
        self.serve(repository, |db| {
            Ok(RepositoryMetadata {
                sets: db.package_sets()?,
                treeupdates: db.treeupdates()?,
                treeupdates_digest: db.treeupdates_digest(repository)?,
                revision,
            })
        })
    }
}

// =============================================================================
// HTTP client
// =============================================================================

/// Default timeout for service calls
const SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

/// Posts [`ServiceRequest`]s to `<base>/<method>` as JSON
pub struct HttpServiceClient {
    client: Client,
    base: String,
}

impl HttpServiceClient {
    pub fn new(base: &str) -> Result<Self> {
        url::Url::parse(base)
            .map_err(|e| Error::ConfigError(format!("invalid service URI '{}': {}", base, e)))?;
        let client = Client::builder()
            .timeout(SERVICE_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn call<T: DeserializeOwned>(&self, request: &ServiceRequest) -> Result<ServiceReply<T>> {
        let url = format!("{}/{}", self.base, request.method());
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .map_err(|e| Error::ProtocolError(format!("{} failed: {}", request.method(), e)))?;

        if !response.status().is_success() {
            return Err(Error::ProtocolError(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }
        response
            .json()
            .map_err(|e| Error::ProtocolError(format!("invalid reply from {}: {}", url, e)))
    }
}

impl RepositoryService for HttpServiceClient {
    fn get_repository_revision(&self, repository: &str) -> Result<ServiceReply<u64>> {
        self.call(&ServiceRequest::GetRepositoryRevision {
            repository: repository.to_string(),
        })
    }

    fn get_differential_packages(
        &self,
        repository: &str,
        local_ids: &BTreeSet<i64>,
    ) -> Result<ServiceReply<DeltaSet>> {
        self.call(&ServiceRequest::GetDifferentialPackages {
            repository: repository.to_string(),
            package_ids: local_ids.clone(),
        })
    }

    fn get_package_payloads(
        &self,
        repository: &str,
        package_ids: &[i64],
    ) -> Result<ServiceReply<Vec<PackageRecord>>> {
        self.call(&ServiceRequest::GetPackagePayloads {
            repository: repository.to_string(),
            package_ids: package_ids.to_vec(),
        })
    }

    fn get_repository_metadata(&self, repository: &str) -> Result<ServiceReply<RepositoryMetadata>> {
        self.call(&ServiceRequest::GetRepositoryMetadata {
            repository: repository.to_string(),
        })
    }
}

// =============================================================================
// Mock
// =============================================================================

/// In-memory service with canned replies
///
/// Payload requests are answered from the configured records. A number of
/// leading payload calls can be made to fail to exercise retries.
#[derive(Debug, Default)]
pub struct MockService {
    revision: Mutex<Option<ServiceReply<u64>>>,
    delta: Mutex<Option<ServiceReply<DeltaSet>>>,
    payloads: Mutex<BTreeMap<i64, PackageRecord>>,
    metadata: Mutex<Option<RepositoryMetadata>>,
    payload_failures: Mutex<usize>,
    payload_calls: Mutex<usize>,
}

fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_revision(&self, reply: ServiceReply<u64>) {
        *guard(&self.revision) = Some(reply);
    }

    pub fn set_delta(&self, reply: ServiceReply<DeltaSet>) {
        *guard(&self.delta) = Some(reply);
    }

    pub fn add_payload(&self, record: PackageRecord) {
        guard(&self.payloads).insert(record.package_id, record);
    }

    pub fn set_metadata(&self, metadata: RepositoryMetadata) {
        *guard(&self.metadata) = Some(metadata);
    }

    /// Fail the next `count` payload calls
    pub fn fail_payloads(&self, count: usize) {
        *guard(&self.payload_failures) = count;
    }

    pub fn payload_calls(&self) -> usize {
        *guard(&self.payload_calls)
    }
}

impl RepositoryService for MockService {
    fn get_repository_revision(&self, _repository: &str) -> Result<ServiceReply<u64>> {
        guard(&self.revision)
            .clone()
            .ok_or_else(|| Error::ProtocolError("No mock revision set".into()))
    }

    fn get_differential_packages(
        &self,
        _repository: &str,
        _local_ids: &BTreeSet<i64>,
    ) -> Result<ServiceReply<DeltaSet>> {
        guard(&self.delta)
            .clone()
            .ok_or_else(|| Error::ProtocolError("No mock delta set".into()))
    }

    fn get_package_payloads(
        &self,
        _repository: &str,
        package_ids: &[i64],
    ) -> Result<ServiceReply<Vec<PackageRecord>>> {
        *guard(&self.payload_calls) += 1;
        {
            let mut failures = guard(&self.payload_failures);
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::ProtocolError("mock payload failure".into()));
            }
        }
        let payloads = guard(&self.payloads);
        let records = package_ids
            .iter()
            .map(|id| {
                payloads
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::NotFoundError(format!("no mock payload {}", id)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ServiceReply::Ready(records))
    }

    fn get_repository_metadata(&self, _repository: &str) -> Result<ServiceReply<RepositoryMetadata>> {
        Ok(ServiceReply::Ready(
            guard(&self.metadata).clone().unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvOverrides, RepositoryConfig, Settings, SyncContext};
    use tempfile::TempDir;

    fn server_repo(temp: &TempDir, ids: &[i64]) -> Repository {
        let mut settings = Settings::default();
        settings.repositories_dir = temp.path().to_path_buf();
        let ctx = SyncContext::new(settings, EnvOverrides::default());
        let repo = Repository::from_context(&ctx, &RepositoryConfig::new("core"));
        repo.ensure_dir().unwrap();

        let db = PackageDatabase::open(&repo.files.database()).unwrap();
        for id in ids {
            db.insert_package(&PackageRecord::new(*id, "app-misc", &format!("p{}", id), "1"))
                .unwrap();
        }
        repo.write_revision(7).unwrap();
        repo
    }

    #[test]
    fn test_delta_between() {
        let local = BTreeSet::from([9, 10]);
        let remote = BTreeSet::from([1, 2, 3, 10]);
        let delta = DeltaSet::between(&local, &remote, "x".into());
        assert_eq!(delta.added, BTreeSet::from([1, 2, 3]));
        assert_eq!(delta.removed, BTreeSet::from([9]));
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_handler_answers_calls() {
        let temp = TempDir::new().unwrap();
        let repo = server_repo(&temp, &[1, 2, 3]);
        let handler = ServiceHandler::new(repo.clone());

        assert_eq!(
            handler.get_repository_revision("core").unwrap(),
            ServiceReply::Ready(7)
        );

        let reply = handler
            .get_differential_packages("core", &BTreeSet::from([2, 5]))
            .unwrap();
        let ServiceReply::Ready(delta) = reply else {
            panic!("expected delta");
        };
        assert_eq!(delta.added, BTreeSet::from([1, 3]));
        assert_eq!(delta.removed, BTreeSet::from([5]));

        let ServiceReply::Ready(records) = handler.get_package_payloads("core", &[3]).unwrap()
        else {
            panic!("expected payloads");
        };
        assert_eq!(records[0].atom, "app-misc/p3-1");

        assert!(handler.get_repository_revision("other").is_err());
    }

    #[test]
    fn test_handler_locked() {
        let temp = TempDir::new().unwrap();
        let repo = server_repo(&temp, &[1]);
        std::fs::write(repo.files.path(&repo.names().service_lock()), "").unwrap();
        let handler = ServiceHandler::new(repo);

        assert!(handler.get_repository_revision("core").unwrap().is_locked());
        assert!(
            handler
                .get_differential_packages("core", &BTreeSet::new())
                .unwrap()
                .is_locked()
        );
    }

    #[test]
    fn test_dispatch_json_shape() {
        let temp = TempDir::new().unwrap();
        let handler = ServiceHandler::new(server_repo(&temp, &[1]));
        let request: ServiceRequest = serde_json::from_str(
            r#"{"method":"get_repository_revision","repository":"core"}"#,
        )
        .unwrap();
        let value = handler.dispatch(&request).unwrap();
        assert_eq!(value, serde_json::json!({"status": "ready", "data": 7}));

        let locked: ServiceReply<u64> =
            serde_json::from_value(serde_json::json!({"status": "locked"})).unwrap();
        assert!(locked.is_locked());
    }

    #[test]
    fn test_mock_payload_failures() {
        let mock = MockService::new();
        mock.add_payload(PackageRecord::new(1, "a", "b", "1"));
        mock.fail_payloads(1);
        assert!(mock.get_package_payloads("core", &[1]).is_err());
        assert!(mock.get_package_payloads("core", &[1]).is_ok());
        assert_eq!(mock.payload_calls(), 2);
    }
}
