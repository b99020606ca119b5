// src/server/qa.rs

//! Pre-upload quality checks
//!
//! Checks report issues with a severity. `Error` issues block the upload
//! unless QA is forced; `Fatal` issues always block.

use crate::config::ServerSettings;
use crate::error::Result;
use crate::hooks::{self, HookStatus};
use crate::repository::{PackageDatabase, Repository};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Which mirror-sync result code a failing check maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaCategory {
    Dependency,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QaSeverity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaIssue {
    pub check: String,
    pub category: QaCategory,
    pub severity: QaSeverity,
    pub message: String,
}

/// A single quality check over the server's database
pub trait QaCheck {
    fn name(&self) -> &str;

    fn category(&self) -> QaCategory;

    fn run(&self, repo: &Repository, db: &PackageDatabase) -> Result<Vec<QaIssue>>;

    fn issue(&self, severity: QaSeverity, message: String) -> QaIssue {
        QaIssue {
            check: self.name().to_string(),
            category: self.category(),
            severity,
            message,
        }
    }
}

/// Verdict over all checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QaVerdict {
    Passed { warnings: Vec<QaIssue> },
    /// Blocking issues overridden by `force`
    Forced { issues: Vec<QaIssue> },
    Blocked { category: QaCategory, issues: Vec<QaIssue> },
}

impl QaVerdict {
    pub fn allows_upload(&self) -> bool {
        !matches!(self, Self::Blocked { .. })
    }
}

/// The database must pass SQLite's own integrity check
pub struct IntegrityCheck;

impl QaCheck for IntegrityCheck {
    fn name(&self) -> &str {
        "integrity"
    }

    fn category(&self) -> QaCategory {
        QaCategory::System
    }

    fn run(&self, _repo: &Repository, db: &PackageDatabase) -> Result<Vec<QaIssue>> {
        let verdict: String =
            db.connection()
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict == "ok" {
            Ok(Vec::new())
        } else {
            Ok(vec![self.issue(
                QaSeverity::Fatal,
                format!("database integrity check failed: {}", verdict),
            )])
        }
    }
}

/// Configured package sets must exist and be non-empty
pub struct RequiredSetsCheck {
    pub sets: Vec<String>,
}

impl QaCheck for RequiredSetsCheck {
    fn name(&self) -> &str {
        "required-sets"
    }

    fn category(&self) -> QaCategory {
        QaCategory::System
    }

    fn run(&self, _repo: &Repository, db: &PackageDatabase) -> Result<Vec<QaIssue>> {
        let present = db.package_sets()?;
        Ok(self
            .sets
            .iter()
            .filter(|set| present.get(*set).is_none_or(|deps| deps.is_empty()))
            .map(|set| {
                self.issue(
                    QaSeverity::Error,
                    format!("required package set '{}' is missing", set),
                )
            })
            .collect())
    }
}

/// Every declared dependency must be provided by a package in the repository
///
/// Community repositories only get warnings.
pub struct DependencyCheck;

impl QaCheck for DependencyCheck {
    fn name(&self) -> &str {
        "dependencies"
    }

    fn category(&self) -> QaCategory {
        QaCategory::Dependency
    }

    fn run(&self, repo: &Repository, db: &PackageDatabase) -> Result<Vec<QaIssue>> {
        let severity = if repo.config.community {
            QaSeverity::Warning
        } else {
            QaSeverity::Error
        };
        Ok(db
            .missing_dependencies()?
            .into_iter()
            .map(|(atom, dep)| {
                self.issue(severity, format!("{} depends on missing {}", atom, dep))
            })
            .collect())
    }
}

/// External QA script: `/bin/sh <hook> <repo_id> <database>`
pub struct HookCheck {
    pub script: PathBuf,
    pub timeout: Duration,
}

impl QaCheck for HookCheck {
    fn name(&self) -> &str {
        "hook"
    }

    fn category(&self) -> QaCategory {
        QaCategory::System
    }

    fn run(&self, repo: &Repository, _db: &PackageDatabase) -> Result<Vec<QaIssue>> {
        let database = repo.files.database();
        let database = database.to_string_lossy();
        let status = hooks::run_hook(&self.script, &[repo.id(), database.as_ref()], self.timeout)?;
        let script = self.script.display();
        Ok(match status {
            HookStatus::Exited(0) => Vec::new(),
            HookStatus::Exited(code) => vec![self.issue(
                QaSeverity::Error,
                format!("{} exited with status {}", script, code),
            )],
            HookStatus::Signaled => vec![self.issue(
                QaSeverity::Error,
                format!("{} was killed by a signal", script),
            )],
            HookStatus::TimedOut => vec![self.issue(
                QaSeverity::Error,
                format!("{} timed out", script),
            )],
        })
    }
}

/// Checks derived from the server settings
pub fn default_checks(settings: &ServerSettings) -> Vec<Box<dyn QaCheck>> {
    let mut checks: Vec<Box<dyn QaCheck>> = vec![
        Box::new(IntegrityCheck),
        Box::new(DependencyCheck),
    ];
    if !settings.required_sets.is_empty() {
        checks.push(Box::new(RequiredSetsCheck {
            sets: settings.required_sets.clone(),
        }));
    }
    for script in &settings.qa_hooks {
        checks.push(Box::new(HookCheck {
            script: script.clone(),
            timeout: Duration::from_secs(settings.qa_hook_timeout_secs),
        }));
    }
    checks
}

/// Run `checks` and decide whether the upload may proceed
pub fn run_checks(
    checks: &[Box<dyn QaCheck>],
    repo: &Repository,
    db: &PackageDatabase,
    force: bool,
) -> Result<QaVerdict> {
    let mut issues = Vec::new();
    for check in checks {
        let found = check.run(repo, db)?;
        for issue in &found {
            warn!("QA [{}] {}: {}", issue.check, repo.id(), issue.message);
        }
        issues.extend(found);
    }

    let worst = issues.iter().map(|i| i.severity).max();
    let blocking_category = |min: QaSeverity| {
        issues
            .iter()
            .filter(|i| i.severity >= min)
            .map(|i| i.category)
            .max_by_key(|c| matches!(c, QaCategory::System))
    };

    let verdict = match worst {
        None | Some(QaSeverity::Warning) => QaVerdict::Passed { warnings: issues },
        Some(QaSeverity::Fatal) => QaVerdict::Blocked {
            category: blocking_category(QaSeverity::Fatal).unwrap_or(QaCategory::System),
            issues,
        },
        Some(QaSeverity::Error) if force => {
            info!("QA failures in '{}' overridden by force", repo.id());
            QaVerdict::Forced { issues }
        }
        Some(QaSeverity::Error) => QaVerdict::Blocked {
            category: blocking_category(QaSeverity::Error).unwrap_or(QaCategory::System),
            issues,
        },
    };
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvOverrides, RepositoryConfig, Settings, SyncContext};
    use crate::repository::PackageRecord;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    fn repo(temp: &TempDir, community: bool) -> (Repository, PackageDatabase) {
        let mut settings = Settings::default();
        settings.repositories_dir = temp.path().to_path_buf();
        let ctx = SyncContext::new(settings, EnvOverrides::default());
        let mut config = RepositoryConfig::new("core");
        config.community = community;
        let repo = Repository::from_context(&ctx, &config);
        repo.ensure_dir().unwrap();

        let db = PackageDatabase::open(&repo.files.database()).unwrap();
        let mut app = PackageRecord::new(1, "app-misc", "hello", "1.0");
        app.dependencies = vec!["dev-libs/missing".to_string()];
        db.insert_package(&app).unwrap();
        (repo, db)
    }

    #[test]
    fn test_dependency_failure_blocks_unless_forced() {
        let temp = TempDir::new().unwrap();
        let (repo, db) = repo(&temp, false);
        let checks = vec![Box::new(DependencyCheck) as Box<dyn QaCheck>];

        let verdict = run_checks(&checks, &repo, &db, false).unwrap();
        assert!(matches!(
            verdict,
            QaVerdict::Blocked {
                category: QaCategory::Dependency,
                ..
            }
        ));

        let forced = run_checks(&checks, &repo, &db, true).unwrap();
        assert!(matches!(forced, QaVerdict::Forced { .. }));
        assert!(forced.allows_upload());
    }

    #[test]
    fn test_community_only_warns() {
        let temp = TempDir::new().unwrap();
        let (repo, db) = repo(&temp, true);
        let checks = vec![Box::new(DependencyCheck) as Box<dyn QaCheck>];
        match run_checks(&checks, &repo, &db, false).unwrap() {
            QaVerdict::Passed { warnings } => assert_eq!(warnings.len(), 1),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_required_sets() {
        let temp = TempDir::new().unwrap();
        let (repo, mut db) = repo(&temp, true);
        let check = RequiredSetsCheck {
            sets: vec!["system".to_string()],
        };
        assert_eq!(check.run(&repo, &db).unwrap().len(), 1);

        let mut sets = BTreeMap::new();
        sets.insert(
            "system".to_string(),
            BTreeSet::from(["app-misc/hello".to_string()]),
        );
        db.replace_package_sets(&sets).unwrap();
        assert!(check.run(&repo, &db).unwrap().is_empty());
    }

    struct AlwaysFatal;

    impl QaCheck for AlwaysFatal {
        fn name(&self) -> &str {
            "fatal"
        }
        fn category(&self) -> QaCategory {
            QaCategory::System
        }
        fn run(&self, _repo: &Repository, _db: &PackageDatabase) -> Result<Vec<QaIssue>> {
            Ok(vec![self.issue(QaSeverity::Fatal, "broken".to_string())])
        }
    }

    #[test]
    fn test_fatal_blocks_even_when_forced() {
        let temp = TempDir::new().unwrap();
        let (repo, db) = repo(&temp, true);
        let checks: Vec<Box<dyn QaCheck>> = vec![Box::new(AlwaysFatal), Box::new(IntegrityCheck)];
        assert!(matches!(
            run_checks(&checks, &repo, &db, true).unwrap(),
            QaVerdict::Blocked {
                category: QaCategory::System,
                ..
            }
        ));
    }

    #[test]
    fn test_hook_exit_status() {
        let temp = TempDir::new().unwrap();
        let (repo, db) = repo(&temp, true);
        let script = temp.path().join("qa.sh");
        std::fs::write(&script, "test \"$1\" = core || exit 1\nexit 0\n").unwrap();
        let check = HookCheck {
            script: script.clone(),
            timeout: Duration::from_secs(10),
        };
        assert!(check.run(&repo, &db).unwrap().is_empty());

        std::fs::write(&script, "exit 5\n").unwrap();
        let issues = check.run(&repo, &db).unwrap();
        assert_eq!(issues[0].severity, QaSeverity::Error);
    }
}
