// src/transport/command.rs

//! FTP and rsync mirrors driven through external tools
//!
//! FTP goes through `curl`, rsync-class URIs through `rsync`. Both binaries
//! are located with `which` when the transport is built. Child processes
//! are polled with a short `wait_timeout` so a cancelled token or an expired
//! transfer timeout kills them.

use super::{MirrorTransport, TransportKind, TransportOptions};
use crate::error::{Error, Result};
use crate::sync::CancelToken;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info};
use wait_timeout::ChildExt;

/// Poll interval while waiting on a transfer process
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// curl: remote file not found
const CURL_REMOTE_FILE_NOT_FOUND: i32 = 78;
/// curl: server denied access / directory missing
const CURL_REMOTE_ACCESS_DENIED: i32 = 9;
/// rsync: partial transfer, e.g. source vanished or missing
const RSYNC_PARTIAL_TRANSFER: i32 = 23;

/// Transport shelling out to `curl` (FTP) or `rsync`
pub struct CommandTransport {
    kind: TransportKind,
    program: PathBuf,
    options: TransportOptions,
}

impl CommandTransport {
    pub fn new(kind: TransportKind, options: TransportOptions) -> Result<Self> {
        let tool = match kind {
            TransportKind::Ftp => "curl",
            TransportKind::Rsync => "rsync",
            other => {
                return Err(Error::InitError(format!(
                    "{:?} mirrors are not served by external tools",
                    other
                )));
            }
        };
        let program = which::which(tool)
            .map_err(|e| Error::InitError(format!("{} not found in PATH: {}", tool, e)))?;

        Ok(Self {
            kind,
            program,
            options,
        })
    }

    fn base_args(&self) -> Vec<String> {
        match self.kind {
            TransportKind::Ftp => {
                let mut args = vec!["-sS".to_string(), "-f".to_string()];
                if let Some(limit) = self.options.speed_limit {
                    args.push("--limit-rate".to_string());
                    args.push(limit.to_string());
                }
                args
            }
            _ => {
                let mut args = vec!["-q".to_string(), "--no-motd".to_string()];
                if let Some(limit) = self.options.speed_limit {
                    // rsync takes KiB/s
                    args.push(format!("--bwlimit={}", (limit / 1024).max(1)));
                }
                args
            }
        }
    }

    /// Run the tool, killing it on cancellation or timeout
    fn run(&self, args: &[String], cancel: &CancelToken, what: &str) -> Result<()> {
        debug!("Running {} {:?}", self.program.display(), args);
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::InitError(format!("Failed to spawn {}: {}", self.program.display(), e))
            })?;

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Cancelled(format!("{} aborted: mirror locked", what)));
            }
            if started.elapsed() > self.options.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::DownloadError(format!(
                    "{} timed out after {} seconds",
                    what,
                    self.options.timeout.as_secs()
                )));
            }
        };

        self.check_status(status, &mut child, what)
    }

    fn check_status(&self, status: ExitStatus, child: &mut Child, what: &str) -> Result<()> {
        if status.success() {
            return Ok(());
        }

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let code = status.code().unwrap_or(-1);
        let message = format!("{} failed with exit code {}: {}", what, code, stderr.trim());

        let missing = match self.kind {
            TransportKind::Ftp => {
                code == CURL_REMOTE_FILE_NOT_FOUND || code == CURL_REMOTE_ACCESS_DENIED
            }
            _ => code == RSYNC_PARTIAL_TRANSFER,
        };
        if missing {
            Err(Error::NotFoundError(message))
        } else {
            Err(Error::DownloadError(message))
        }
    }

    fn split_parent(uri: &str) -> Result<(&str, &str)> {
        uri.rsplit_once('/')
            .filter(|(_, name)| !name.is_empty())
            .ok_or_else(|| Error::ParseError(format!("no file name in '{}'", uri)))
    }
}

impl MirrorTransport for CommandTransport {
    fn download(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<u64> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let temp = NamedTempFile::new_in(dir)?;
        let target = temp.path().to_string_lossy().to_string();

        let mut args = self.base_args();
        match self.kind {
            TransportKind::Ftp => {
                args.extend(["-o".to_string(), target, uri.to_string()]);
            }
            _ => {
                args.extend([uri.to_string(), target]);
            }
        }
        self.run(&args, cancel, &format!("download of {}", uri))?;

        // rsync replaces the file by rename, so stat the path rather than the handle
        let bytes = std::fs::metadata(temp.path())?.len();
        temp.persist(dest).map_err(|e| Error::IoError(e.to_string()))?;
        info!("Downloaded {} ({} bytes)", uri, bytes);
        Ok(bytes)
    }

    fn upload(&self, local: &Path, uri: &str) -> Result<()> {
        let mut args = self.base_args();
        let local = local.to_string_lossy().to_string();
        match self.kind {
            TransportKind::Ftp => {
                args.extend([
                    "--ftp-create-dirs".to_string(),
                    "-T".to_string(),
                    local,
                    uri.to_string(),
                ]);
            }
            _ => {
                args.extend(["--mkpath".to_string(), local, uri.to_string()]);
            }
        }
        self.run(&args, &CancelToken::new(), &format!("upload to {}", uri))
            .map_err(|e| Error::UploadError(e.to_string()))
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        let mut args = self.base_args();
        match self.kind {
            TransportKind::Ftp => args.extend(["-I".to_string(), uri.to_string()]),
            _ => args.extend(["--list-only".to_string(), uri.to_string()]),
        }
        match self.run(&args, &CancelToken::new(), &format!("query of {}", uri)) {
            Ok(()) => Ok(true),
            Err(Error::NotFoundError(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, uri: &str) -> Result<()> {
        let (parent, name) = Self::split_parent(uri)?;
        let mut args = self.base_args();
        // kept alive until the command has run
        let empty = TempDir::new()?;
        match self.kind {
            TransportKind::Ftp => {
                args.extend([
                    "-Q".to_string(),
                    format!("DELE {}", name),
                    format!("{}/", parent),
                ]);
            }
            _ => {
                args.extend([
                    "-r".to_string(),
                    "--delete".to_string(),
                    format!("--include={}", name),
                    "--exclude=*".to_string(),
                    format!("{}/", empty.path().display()),
                    format!("{}/", parent),
                ]);
            }
        }
        match self.run(&args, &CancelToken::new(), &format!("delete of {}", uri)) {
            Ok(()) | Err(Error::NotFoundError(_)) => Ok(()),
            Err(e) => Err(Error::UploadError(e.to_string())),
        }
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}
