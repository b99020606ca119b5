// src/config/legacy.rs
//! Parser for the legacy `repositories.conf` format
//!
//! Each non-comment line is `key|field|field...`. The key selects a handler
//! from a registry built when the parser is constructed:
//!
//! ```text
//! repository|<id>|<description>|<package mirrors>|<database uri>[#<format>][#<port>[,<ssl port>]]
//! branch|<name>
//! downloadspeedlimit|<KiB/s>
//! ```
//!
//! Package mirrors are whitespace separated. Unknown keys are logged and
//! skipped; malformed lines for known keys are configuration errors.

use super::{RepositoryConfig, Settings};
use crate::compression::DbFormat;
use crate::error::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A handler receives the `|`-separated fields after the key
pub type Handler = fn(&[&str], &mut Settings) -> Result<()>;

/// Registry-driven parser for `repositories.conf`
pub struct LegacyParser {
    handlers: HashMap<&'static str, Handler>,
}

impl Default for LegacyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyParser {
    /// Create a parser with the built-in handlers registered
    pub fn new() -> Self {
        let mut parser = Self {
            handlers: HashMap::new(),
        };
        parser.register("repository", parse_repository);
        parser.register("branch", parse_branch);
        parser.register("downloadspeedlimit", parse_speed_limit);
        parser
    }

    /// Register (or replace) the handler for a key
    pub fn register(&mut self, key: &'static str, handler: Handler) {
        self.handlers.insert(key, handler);
    }

    /// Apply every line of `content` to `settings`
    pub fn apply(&self, content: &str, settings: &mut Settings) -> Result<()> {
        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split('|').map(str::trim).collect();
            let key = fields[0].to_lowercase();

            match self.handlers.get(key.as_str()) {
                Some(handler) => handler(&fields[1..], settings).map_err(|e| {
                    Error::ConfigError(format!("repositories.conf line {}: {}", lineno + 1, e))
                })?,
                None => warn!(
                    "repositories.conf line {}: unknown key '{}'",
                    lineno + 1,
                    key
                ),
            }
        }
        Ok(())
    }
}

fn parse_repository(fields: &[&str], settings: &mut Settings) -> Result<()> {
    if fields.len() < 4 {
        return Err(Error::ConfigError(format!(
            "repository line needs 4 fields, found {}",
            fields.len()
        )));
    }

    let id = fields[0];
    if id.is_empty() {
        return Err(Error::ConfigError("empty repository id".to_string()));
    }

    let mut repo = RepositoryConfig::new(id);
    repo.description = fields[1].to_string();
    repo.package_mirrors = fields[2].split_whitespace().map(str::to_string).collect();

    let (database, dbformat, service_port) = split_database_field(fields[3])?;
    repo.dbformat = dbformat;
    if let Some(port) = service_port {
        let host = url::Url::parse(&database)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| {
                Error::ConfigError(format!("no host in database uri '{}'", database))
            })?;
        repo.service_uri = Some(format!("http://{}:{}/", host, port));
    }
    repo.database_mirrors = vec![database];

    debug!("Legacy repository '{}' parsed", repo.id);

    // later definitions replace earlier ones
    settings.repositories.retain(|r| r.id != repo.id);
    settings.repositories.push(repo);
    Ok(())
}

/// Split `uri[#format][#port[,ssl_port]]`
fn split_database_field(field: &str) -> Result<(String, DbFormat, Option<u16>)> {
    let mut parts = field.split('#');
    let uri = parts.next().unwrap_or_default().trim().to_string();
    if uri.is_empty() {
        return Err(Error::ConfigError("empty database uri".to_string()));
    }

    let mut format = DbFormat::default();
    let mut port = None;
    for part in parts.map(str::trim).filter(|p| !p.is_empty()) {
        let first = part.split(',').next().unwrap_or_default();
        if let Ok(p) = first.parse::<u16>() {
            port = Some(p);
        } else {
            format = part.parse()?;
        }
    }
    Ok((uri, format, port))
}

fn parse_branch(fields: &[&str], settings: &mut Settings) -> Result<()> {
    match fields.first() {
        Some(branch) if !branch.is_empty() => {
            settings.client.branch = branch.to_string();
            Ok(())
        }
        _ => Err(Error::ConfigError("empty branch".to_string())),
    }
}

fn parse_speed_limit(fields: &[&str], settings: &mut Settings) -> Result<()> {
    let value = fields.first().copied().unwrap_or_default();
    let limit = value
        .parse::<u64>()
        .map_err(|_| Error::ConfigError(format!("invalid speed limit '{}'", value)))?;
    settings.client.download_speed_limit_kbps = (limit > 0).then_some(limit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_line() {
        let mut settings = Settings::default();
        LegacyParser::new()
            .apply(
                "repository|main|Main repo|http://a.example.org/pkgs ftp://b.example.org/pkgs|http://db.example.org/repo#xz#1026,1027\n",
                &mut settings,
            )
            .unwrap();

        let repo = settings.repository("main").unwrap();
        assert_eq!(repo.description, "Main repo");
        assert_eq!(repo.package_mirrors.len(), 2);
        assert_eq!(repo.database_mirrors, vec!["http://db.example.org/repo"]);
        assert_eq!(repo.dbformat, DbFormat::Xz);
        assert_eq!(
            repo.service_uri.as_deref(),
            Some("http://db.example.org:1026/")
        );
    }

    #[test]
    fn test_defaults_without_suffixes() {
        let (uri, format, port) = split_database_field("file:///srv/db").unwrap();
        assert_eq!(uri, "file:///srv/db");
        assert_eq!(format, DbFormat::Gz);
        assert_eq!(port, None);
    }

    #[test]
    fn test_other_handlers_and_comments() {
        let mut settings = Settings::default();
        let content = "# comment\n\nbranch|testing\ndownloadspeedlimit|256\nsomethingelse|x\n";
        LegacyParser::new().apply(content, &mut settings).unwrap();
        assert_eq!(settings.client.branch, "testing");
        assert_eq!(settings.client.download_speed_limit_kbps, Some(256));
    }

    #[test]
    fn test_malformed_line_is_error() {
        let mut settings = Settings::default();
        let err = LegacyParser::new()
            .apply("repository|only-id\n", &mut settings)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_custom_handler_registration() {
        fn set_root(fields: &[&str], settings: &mut Settings) -> Result<()> {
            settings.client.root = fields[0].into();
            Ok(())
        }

        let mut parser = LegacyParser::new();
        parser.register("root", set_root);
        let mut settings = Settings::default();
        parser.apply("root|/mnt/target", &mut settings).unwrap();
        assert_eq!(settings.client.root, std::path::PathBuf::from("/mnt/target"));
    }
}
