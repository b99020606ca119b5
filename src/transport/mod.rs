// src/transport/mod.rs

//! Mirror transports
//!
//! The sync engine talks to every mirror through [`MirrorTransport`]. The
//! variant is chosen from the URI scheme:
//!
//! - `http://`, `https://` - reqwest, read-only
//! - `file://` - local or network-mounted directory
//! - `ftp://`, `ftps://` - curl
//! - `rsync://`, `ssh://` - rsync
//!
//! Missing remote files are reported as [`Error::NotFoundError`] so callers
//! can tell "absent" from "failed".

mod command;
mod file;
mod http;

pub use command::CommandTransport;
pub use file::FileTransport;
pub use http::HttpTransport;

use crate::error::{Error, Result};
use crate::sync::CancelToken;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Default timeout for a single transfer
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Capability to move files to and from one mirror
pub trait MirrorTransport: Send + Sync {
    /// Fetch `uri` into `dest`, honoring the cancel token between chunks
    ///
    /// Returns the number of bytes written. `dest` is only replaced once the
    /// transfer completed.
    fn download(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<u64>;

    /// Store `local` at `uri`, creating remote directories as needed
    fn upload(&self, local: &Path, uri: &str) -> Result<()>;

    fn exists(&self, uri: &str) -> Result<bool>;

    /// Delete `uri`; deleting a missing file succeeds
    fn delete(&self, uri: &str) -> Result<()>;

    /// Scheme family of this transport
    fn kind(&self) -> TransportKind;

    /// Fetch a small remote file into memory
    fn fetch_bytes(&self, uri: &str) -> Result<Vec<u8>> {
        let temp = NamedTempFile::new()?;
        self.download(uri, temp.path(), &CancelToken::new())?;
        Ok(std::fs::read(temp.path())?)
    }

    /// Store in-memory content at `uri`
    fn upload_bytes(&self, data: &[u8], uri: &str) -> Result<()> {
        let temp = NamedTempFile::new()?;
        std::fs::write(temp.path(), data)?;
        self.upload(temp.path(), uri)
    }
}

/// Transport families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Http,
    File,
    Ftp,
    Rsync,
}

impl TransportKind {
    /// Classify a mirror URI; unparsable URIs and unknown schemes are errors
    pub fn for_uri(uri: &str) -> Result<Self> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| Error::ParseError(format!("invalid mirror URI '{}': {}", uri, e)))?;

        match parsed.scheme() {
            "http" | "https" => Ok(Self::Http),
            "file" => Ok(Self::File),
            "ftp" | "ftps" => Ok(Self::Ftp),
            "rsync" | "ssh" => Ok(Self::Rsync),
            other => Err(Error::ParseError(format!(
                "unsupported scheme '{}' in mirror URI '{}'",
                other, uri
            ))),
        }
    }

    /// Whether uploads and deletes are possible
    pub fn is_writable(&self) -> bool {
        !matches!(self, Self::Http)
    }
}

/// Tuning shared by all transports
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Bandwidth limit in bytes per second
    pub speed_limit: Option<u64>,
    pub timeout: Duration,
    /// Show an indicatif progress bar for HTTP downloads
    pub show_progress: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            speed_limit: None,
            timeout: TRANSFER_TIMEOUT,
            show_progress: false,
        }
    }
}

/// Build the transport serving `uri`
pub fn for_uri(uri: &str, options: &TransportOptions) -> Result<Arc<dyn MirrorTransport>> {
    let transport: Arc<dyn MirrorTransport> = match TransportKind::for_uri(uri)? {
        TransportKind::Http => Arc::new(HttpTransport::new(options.clone())?),
        TransportKind::File => Arc::new(FileTransport::new()),
        kind @ (TransportKind::Ftp | TransportKind::Rsync) => {
            Arc::new(CommandTransport::new(kind, options.clone())?)
        }
    };
    Ok(transport)
}

/// Sleep long enough to keep `transferred` bytes under `limit` bytes/s
pub(crate) fn throttle(limit: Option<u64>, transferred: u64, started: std::time::Instant) {
    if let Some(limit) = limit.filter(|l| *l > 0) {
        let expected = Duration::from_secs_f64(transferred as f64 / limit as f64);
        let elapsed = started.elapsed();
        if expected > elapsed {
            std::thread::sleep(expected - elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_uri() {
        assert_eq!(
            TransportKind::for_uri("https://mirror.example.org/pub").unwrap(),
            TransportKind::Http
        );
        assert_eq!(
            TransportKind::for_uri("file:///srv/mirror").unwrap(),
            TransportKind::File
        );
        assert_eq!(
            TransportKind::for_uri("ftp://user@ftp.example.org/repo").unwrap(),
            TransportKind::Ftp
        );
        assert_eq!(
            TransportKind::for_uri("rsync://rsync.example.org/repo").unwrap(),
            TransportKind::Rsync
        );
    }

    #[test]
    fn test_invalid_uris() {
        assert!(TransportKind::for_uri("gopher://old.example.org").is_err());
        assert!(TransportKind::for_uri("/no/scheme").is_err());
        assert!(!TransportKind::Http.is_writable());
        assert!(TransportKind::File.is_writable());
    }

    #[test]
    fn test_factory_file() {
        let transport = for_uri("file:///tmp", &TransportOptions::default()).unwrap();
        assert_eq!(transport.kind(), TransportKind::File);
    }
}
