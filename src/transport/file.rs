// src/transport/file.rs

//! `file://` mirrors

use super::{MirrorTransport, TransportKind};
use crate::error::{Error, Result};
use crate::sync::CancelToken;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Mirror reachable through the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTransport;

impl FileTransport {
    pub fn new() -> Self {
        Self
    }

    fn path_of(uri: &str) -> Result<PathBuf> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| Error::ParseError(format!("invalid file URI '{}': {}", uri, e)))?;
        parsed
            .to_file_path()
            .map_err(|_| Error::ParseError(format!("not a local path: '{}'", uri)))
    }

    /// Copy `src` into a temp file next to `dest`, then rename it into place
    fn copy_into_place(src: &Path, dest: &Path, cancel: Option<&CancelToken>) -> Result<u64> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut input = File::open(src).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                Error::NotFoundError(format!("{} does not exist", src.display()))
            }
            _ => Error::DownloadError(format!("Failed to open {}: {}", src.display(), e)),
        })?;

        let mut temp = NamedTempFile::new_in(dir)?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            if let Some(token) = cancel {
                token.check(&format!("copy of {}", src.display()))?;
            }
            let n = input.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            temp.write_all(&buffer[..n])?;
            copied += n as u64;
        }
        temp.as_file().sync_all()?;
        temp.persist(dest).map_err(|e| Error::IoError(e.to_string()))?;
        Ok(copied)
    }
}

impl MirrorTransport for FileTransport {
    fn download(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<u64> {
        let src = Self::path_of(uri)?;
        let bytes = Self::copy_into_place(&src, dest, Some(cancel))?;
        debug!("Copied {} ({} bytes)", uri, bytes);
        Ok(bytes)
    }

    fn upload(&self, local: &Path, uri: &str) -> Result<()> {
        let dest = Self::path_of(uri)?;
        Self::copy_into_place(local, &dest, None)
            .map_err(|e| Error::UploadError(format!("{} -> {}: {}", local.display(), uri, e)))?;
        Ok(())
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        Ok(Self::path_of(uri)?.exists())
    }

    fn delete(&self, uri: &str) -> Result<()> {
        match fs::remove_file(Self::path_of(uri)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::UploadError(format!("Failed to delete {}: {}", uri, e))),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uri(path: &Path) -> String {
        url::Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn test_upload_download_delete() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("local.txt");
        fs::write(&local, b"payload").unwrap();

        let remote = temp.path().join("mirror/core/database/main/local.txt");
        let transport = FileTransport::new();
        transport.upload(&local, &uri(&remote)).unwrap();
        assert!(transport.exists(&uri(&remote)).unwrap());

        let fetched = temp.path().join("fetched.txt");
        let n = transport
            .download(&uri(&remote), &fetched, &CancelToken::new())
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(fs::read(&fetched).unwrap(), b"payload");

        transport.delete(&uri(&remote)).unwrap();
        transport.delete(&uri(&remote)).unwrap();
        assert!(!transport.exists(&uri(&remote)).unwrap());
    }

    #[test]
    fn test_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = FileTransport::new()
            .download(
                &uri(&temp.path().join("absent")),
                &temp.path().join("out"),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFoundError(_)));
        assert!(!temp.path().join("out").exists());
    }

    #[test]
    fn test_cancelled_download_leaves_no_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::write(&src, b"data").unwrap();

        let token = CancelToken::new();
        token.cancel();
        let dest = temp.path().join("dest");
        let err = FileTransport::new()
            .download(&uri(&src), &dest, &token)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_bytes_helpers() {
        let temp = TempDir::new().unwrap();
        let remote = uri(&temp.path().join("rev"));
        let transport = FileTransport::new();
        transport.upload_bytes(b"12\n", &remote).unwrap();
        assert_eq!(transport.fetch_bytes(&remote).unwrap(), b"12\n");
    }
}
