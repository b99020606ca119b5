// src/config/mod.rs
//! Configuration for the sync engine
//!
//! Supports a TOML configuration file with the following sections:
//! - top level - repositories directory, database file name, legacy file
//! - [[repository]] - one table per repository
//! - [client] - client update behavior (hooks, delta sync tuning)
//! - [server] - mirror sync behavior (EAPIs published, signing, QA)
//!
//! Environment overrides are captured once into [`EnvOverrides`]. Settings and
//! overrides are frozen together in a [`SyncContext`] that the engine borrows
//! for a whole run; nothing re-reads the environment mid-run.

pub mod legacy;

use crate::compression::DbFormat;
use crate::eapi::Eapi;
use crate::error::{Error, Result};
use crate::transport::TransportKind;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/reposync/reposync.toml";

/// Environment variable forcing an EAPI level
pub const ENV_FORCE_EAPI: &str = "REPOSYNC_FORCE_EAPI";
/// Environment variable forcing a download bandwidth limit (KiB/s)
pub const ENV_DOWNLOAD_SPEED_LIMIT: &str = "REPOSYNC_DOWNLOAD_SPEED_LIMIT";
/// Environment variable forcing the repository branch
pub const ENV_BRANCH: &str = "REPOSYNC_BRANCH";

/// TOML configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root directory holding one subdirectory per repository
    #[serde(default = "default_repositories_dir")]
    pub repositories_dir: PathBuf,

    /// Name of the repository database file
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Optional legacy `repositories.conf` merged at load time
    #[serde(default)]
    pub legacy_config: Option<PathBuf>,

    /// Configured repositories
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default)]
    pub client: ClientSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repositories_dir: default_repositories_dir(),
            database_name: default_database_name(),
            legacy_config: None,
            repositories: Vec::new(),
            client: ClientSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

fn default_repositories_dir() -> PathBuf {
    PathBuf::from("/var/lib/reposync/repositories")
}

fn default_database_name() -> String {
    "packages.db".to_string()
}

fn default_true() -> bool {
    true
}

/// A configured repository
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    /// Globally unique repository identifier
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// Ordered database mirror base URIs
    #[serde(default)]
    pub database_mirrors: Vec<String>,

    /// Ordered package mirror base URIs
    #[serde(default)]
    pub package_mirrors: Vec<String>,

    #[serde(default)]
    pub dbformat: DbFormat,

    /// Differential sync service endpoint
    #[serde(default)]
    pub service_uri: Option<String>,

    /// Community repositories tolerate failed dependency tests
    #[serde(default)]
    pub community: bool,

    #[serde(default = "default_true")]
    pub gpg_check: bool,

    #[serde(default)]
    pub gpg_strict: bool,
}

impl RepositoryConfig {
    /// Create a repository configuration with defaults
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            database_mirrors: Vec::new(),
            package_mirrors: Vec::new(),
            dbformat: DbFormat::default(),
            service_uri: None,
            community: false,
            gpg_check: true,
            gpg_strict: false,
        }
    }
}

/// Client update settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// Repository branch
    #[serde(default = "default_branch")]
    pub branch: String,

    /// System root passed to hooks
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Script run after a repository is updated
    #[serde(default)]
    pub post_update_hook: Option<PathBuf>,

    #[serde(default = "default_hook_timeout")]
    pub hook_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub rebuild_indexes: bool,

    /// Added-package count above which differential sync is declined
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: usize,

    /// Package payloads requested per RPC call
    #[serde(default = "default_delta_batch_size")]
    pub delta_batch_size: usize,

    /// Attempts per payload batch
    #[serde(default = "default_delta_retries")]
    pub delta_retries: u32,

    /// Interval of the mirror lock poller during downloads
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,

    /// Download bandwidth limit in KiB/s
    #[serde(default)]
    pub download_speed_limit_kbps: Option<u64>,

    /// Directory holding per-repository public keys
    #[serde(default = "default_keyring_dir")]
    pub keyring_dir: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            root: default_root(),
            post_update_hook: None,
            hook_timeout_secs: default_hook_timeout(),
            rebuild_indexes: true,
            delta_threshold: default_delta_threshold(),
            delta_batch_size: default_delta_batch_size(),
            delta_retries: default_delta_retries(),
            lock_poll_interval_ms: default_lock_poll_interval(),
            download_speed_limit_kbps: None,
            keyring_dir: default_keyring_dir(),
        }
    }
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_hook_timeout() -> u64 {
    60
}

fn default_delta_threshold() -> usize {
    1500
}

fn default_delta_batch_size() -> usize {
    12
}

fn default_delta_retries() -> u32 {
    5
}

fn default_lock_poll_interval() -> u64 {
    500
}

fn default_keyring_dir() -> PathBuf {
    PathBuf::from("/var/lib/reposync/keys")
}

/// Server mirror-sync settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// EAPI levels whose artifacts are built and uploaded
    #[serde(default = "default_enabled_eapis")]
    pub enabled_eapis: Vec<u8>,

    /// Armored secret key used to sign uploaded artifacts
    #[serde(default)]
    pub signing_key: Option<PathBuf>,

    /// How long to wait for a foreign upload lock before giving up on a mirror
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,

    /// Auxiliary files packed into the metafiles bundle
    #[serde(default = "default_metafiles")]
    pub metafiles: Vec<String>,

    /// Package sets that must exist before uploading
    #[serde(default)]
    pub required_sets: Vec<String>,

    /// External QA scripts; a non-zero exit blocks the upload
    #[serde(default)]
    pub qa_hooks: Vec<PathBuf>,

    #[serde(default = "default_hook_timeout")]
    pub qa_hook_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled_eapis: default_enabled_eapis(),
            signing_key: None,
            lock_wait_secs: default_lock_wait(),
            metafiles: default_metafiles(),
            required_sets: Vec::new(),
            qa_hooks: Vec::new(),
            qa_hook_timeout_secs: default_hook_timeout(),
        }
    }
}

fn default_enabled_eapis() -> Vec<u8> {
    vec![1, 2]
}

fn default_lock_wait() -> u64 {
    120
}

fn default_metafiles() -> Vec<String> {
    [
        "packages.db.mask",
        "packages.db.system_mask",
        "packages.db.lic_whitelist",
        "packages.db.repo_updates",
        "packages.db.conflicting_tagged",
        "notice.rss",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Settings {
    /// Load configuration from a TOML file, merging the legacy file if set
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut settings: Settings = toml::from_str(&content)?;

        if let Some(legacy_path) = settings.legacy_config.clone() {
            let legacy_content = std::fs::read_to_string(&legacy_path).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to read legacy config {}: {}",
                    legacy_path.display(),
                    e
                ))
            })?;
            legacy::LegacyParser::new().apply(&legacy_content, &mut settings)?;
        }

        settings.validate()?;
        debug!(
            "Loaded {} repositories from {}",
            settings.repositories.len(),
            path.display()
        );
        Ok(settings)
    }

    /// Validate the configuration before any I/O happens
    pub fn validate(&self) -> Result<()> {
        if self.repositories.is_empty() {
            return Err(Error::ConfigError("no repositories configured".to_string()));
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.id.trim().is_empty() {
                return Err(Error::ConfigError("repository with empty id".to_string()));
            }
            if !seen.insert(repo.id.as_str()) {
                return Err(Error::ConfigError(format!(
                    "duplicate repository id '{}'",
                    repo.id
                )));
            }
            if repo.database_mirrors.is_empty() {
                return Err(Error::ConfigError(format!(
                    "repository '{}' has no database mirrors",
                    repo.id
                )));
            }
            for uri in repo.database_mirrors.iter().chain(&repo.package_mirrors) {
                TransportKind::for_uri(uri).map_err(|e| {
                    Error::ConfigError(format!("repository '{}': {}", repo.id, e))
                })?;
            }
            if let Some(service) = &repo.service_uri {
                url::Url::parse(service).map_err(|e| {
                    Error::ConfigError(format!(
                        "repository '{}': invalid service URI '{}': {}",
                        repo.id, service, e
                    ))
                })?;
            }
        }

        for level in &self.server.enabled_eapis {
            if Eapi::from_level(*level).is_none() {
                return Err(Error::ConfigError(format!("unknown EAPI level {}", level)));
            }
        }

        if self.client.delta_batch_size == 0 {
            return Err(Error::ConfigError("delta_batch_size must be > 0".to_string()));
        }

        Ok(())
    }

    /// Find a repository by identifier
    pub fn repository(&self, id: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.id == id)
    }
}

/// Environment overrides, captured once per run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub force_eapi: Option<Eapi>,
    pub download_speed_limit_kbps: Option<u64>,
    pub branch: Option<String>,
}

impl EnvOverrides {
    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let force_eapi = lookup(ENV_FORCE_EAPI).and_then(|value| {
            let parsed = value.trim().parse::<u8>().ok().and_then(Eapi::from_level);
            if parsed.is_none() {
                warn!("Ignoring invalid {}={}", ENV_FORCE_EAPI, value);
            }
            parsed
        });

        let download_speed_limit_kbps = lookup(ENV_DOWNLOAD_SPEED_LIMIT).and_then(|value| {
            let parsed = value.trim().parse::<u64>().ok().filter(|v| *v > 0);
            if parsed.is_none() {
                warn!("Ignoring invalid {}={}", ENV_DOWNLOAD_SPEED_LIMIT, value);
            }
            parsed
        });

        let branch = lookup(ENV_BRANCH)
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());

        Self {
            force_eapi,
            download_speed_limit_kbps,
            branch,
        }
    }
}

/// Immutable snapshot of configuration for one sync run
#[derive(Debug, Clone)]
pub struct SyncContext {
    settings: Settings,
    overrides: EnvOverrides,
}

impl SyncContext {
    pub fn new(settings: Settings, overrides: EnvOverrides) -> Self {
        Self {
            settings,
            overrides,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn overrides(&self) -> &EnvOverrides {
        &self.overrides
    }

    /// Effective branch: override first, then configuration
    pub fn branch(&self) -> &str {
        self.overrides
            .branch
            .as_deref()
            .unwrap_or(&self.settings.client.branch)
    }

    /// Effective download limit in bytes per second
    pub fn download_speed_limit(&self) -> Option<u64> {
        self.overrides
            .download_speed_limit_kbps
            .or(self.settings.client.download_speed_limit_kbps)
            .map(|kbps| kbps * 1024)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.client.lock_poll_interval_ms.max(10))
    }

    /// Local directory of a repository for the effective branch
    pub fn repository_dir(&self, repo_id: &str) -> PathBuf {
        self.settings
            .repositories_dir
            .join(repo_id)
            .join(self.branch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_toml() -> &'static str {
        r#"
repositories_dir = "/srv/repos"

[[repository]]
id = "core"
description = "Core packages"
database_mirrors = ["http://mirror1.example.org/pub", "file:///srv/mirror2"]
package_mirrors = ["http://mirror1.example.org/pkgs"]
dbformat = "xz"
service_uri = "http://sync.example.org:1026/"

[[repository]]
id = "community"
database_mirrors = ["rsync://mirror3.example.org/repos"]
community = true

[client]
branch = "stable"
delta_threshold = 200

[server]
enabled_eapis = [1, 2]
lock_wait_secs = 30
"#
    }

    #[test]
    fn test_parse_toml() {
        let settings: Settings = toml::from_str(sample_toml()).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.repositories.len(), 2);

        let core = settings.repository("core").unwrap();
        assert_eq!(core.dbformat, DbFormat::Xz);
        assert!(core.gpg_check);
        assert!(!core.community);

        let community = settings.repository("community").unwrap();
        assert_eq!(community.dbformat, DbFormat::Gz);
        assert!(community.community);

        assert_eq!(settings.client.branch, "stable");
        assert_eq!(settings.client.delta_threshold, 200);
        assert_eq!(settings.client.delta_batch_size, 12);
        assert_eq!(settings.server.lock_wait_secs, 30);
        assert_eq!(settings.database_name, "packages.db");
    }

    #[test]
    fn test_no_repositories_is_fatal() {
        let settings = Settings::default();
        assert!(matches!(settings.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_invalid_mirror_uri_is_fatal() {
        let mut settings = Settings::default();
        let mut repo = RepositoryConfig::new("core");
        repo.database_mirrors.push("gopher://old.example.org/".to_string());
        settings.repositories.push(repo);
        assert!(matches!(settings.validate(), Err(Error::ConfigError(_))));

        settings.repositories[0].database_mirrors = vec!["not a uri".to_string()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut settings = Settings::default();
        for _ in 0..2 {
            let mut repo = RepositoryConfig::new("core");
            repo.database_mirrors.push("file:///srv/m".to_string());
            settings.repositories.push(repo);
        }
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_FORCE_EAPI, "2"),
            (ENV_DOWNLOAD_SPEED_LIMIT, "128"),
            (ENV_BRANCH, " testing "),
        ]
        .into_iter()
        .collect();

        let overrides = EnvOverrides::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(overrides.force_eapi, Some(Eapi::Two));
        assert_eq!(overrides.download_speed_limit_kbps, Some(128));
        assert_eq!(overrides.branch.as_deref(), Some("testing"));
    }

    #[test]
    fn test_invalid_env_overrides_ignored() {
        let overrides = EnvOverrides::from_lookup(|k| match k {
            ENV_FORCE_EAPI => Some("9".to_string()),
            ENV_DOWNLOAD_SPEED_LIMIT => Some("fast".to_string()),
            _ => None,
        });
        assert_eq!(overrides, EnvOverrides::default());
    }

    #[test]
    fn test_context_prefers_overrides() {
        let settings: Settings = toml::from_str(sample_toml()).unwrap();
        let overrides = EnvOverrides {
            branch: Some("testing".to_string()),
            download_speed_limit_kbps: Some(10),
            force_eapi: None,
        };
        let ctx = SyncContext::new(settings, overrides);
        assert_eq!(ctx.branch(), "testing");
        assert_eq!(ctx.download_speed_limit(), Some(10 * 1024));
        assert_eq!(
            ctx.repository_dir("core"),
            PathBuf::from("/srv/repos/core/testing")
        );
    }

    #[test]
    fn test_load_merges_legacy_file() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("repositories.conf");
        std::fs::write(
            &legacy,
            "# legacy\nrepository|extra|Extra repo|http://pkgs.example.org|http://db.example.org#xz\n",
        )
        .unwrap();

        let config = temp.path().join("reposync.toml");
        std::fs::write(
            &config,
            format!("legacy_config = {:?}\n", legacy.to_string_lossy()),
        )
        .unwrap();

        let settings = Settings::load(&config).unwrap();
        let extra = settings.repository("extra").unwrap();
        assert_eq!(extra.dbformat, DbFormat::Xz);
        assert_eq!(extra.database_mirrors, vec!["http://db.example.org"]);
    }
}
