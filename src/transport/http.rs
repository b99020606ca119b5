// src/transport/http.rs

//! HTTP(S) mirrors
//!
//! Downloads stream to a temp file next to the destination with retry
//! support, an optional bandwidth limit and an optional progress bar. HTTP
//! mirrors are read-only.

use super::{MirrorTransport, TransportKind, TransportOptions, throttle};
use crate::error::{Error, Result};
use crate::sync::CancelToken;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Maximum retry attempts for failed downloads
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Read-only HTTP mirror client
pub struct HttpTransport {
    client: Client,
    options: TransportOptions,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(options: TransportOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            options,
            max_retries: MAX_RETRIES,
        })
    }

    fn progress_bar(&self, uri: &str) -> Option<ProgressBar> {
        if !self.options.show_progress {
            return None;
        }
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(uri.rsplit('/').next().unwrap_or(uri).to_string());
        Some(pb)
    }

    /// Stream a response into `file`, checking the cancel token per chunk
    fn stream_response(
        &self,
        mut response: Response,
        file: &mut impl Write,
        cancel: &CancelToken,
        uri: &str,
    ) -> Result<u64> {
        let progress = self.progress_bar(uri);
        if let (Some(pb), Some(total)) = (&progress, response.content_length()) {
            pb.set_length(total);
        }

        let started = Instant::now();
        let mut downloaded: u64 = 0;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];

        loop {
            cancel.check(&format!("download of {}", uri))?;

            let bytes_read = response
                .read(&mut buffer)
                .map_err(|e| Error::DownloadError(format!("Failed to read response: {e}")))?;
            if bytes_read == 0 {
                break;
            }

            file.write_all(&buffer[..bytes_read])
                .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;
            downloaded += bytes_read as u64;

            if let Some(pb) = &progress {
                pb.set_position(downloaded);
            }
            throttle(self.options.speed_limit, downloaded, started);
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        Ok(downloaded)
    }

    fn send_get(&self, uri: &str) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(uri).send() {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    return Err(Error::NotFoundError(format!("{} does not exist", uri)));
                }
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status().is_client_error() => {
                    return Err(Error::DownloadError(format!(
                        "HTTP {} from {}",
                        response.status(),
                        uri
                    )));
                }
                Ok(response) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {} after {attempt} attempts",
                            response.status(),
                            uri
                        )));
                    }
                    warn!(
                        "Download attempt {} of {} returned {}, retrying...",
                        attempt,
                        uri,
                        response.status()
                    );
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch {} after {attempt} attempts: {e}",
                            uri
                        )));
                    }
                    warn!("Download attempt {} of {} failed: {}, retrying...", attempt, uri, e);
                }
            }
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
        }
    }
}

impl MirrorTransport for HttpTransport {
    fn download(&self, uri: &str, dest: &Path, cancel: &CancelToken) -> Result<u64> {
        debug!("Downloading {} to {}", uri, dest.display());
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let response = self.send_get(uri)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        let bytes = self.stream_response(response, &mut temp, cancel, uri)?;
        temp.as_file().sync_all()?;
        temp.persist(dest).map_err(|e| Error::IoError(e.to_string()))?;

        info!("Downloaded {} ({} bytes)", uri, bytes);
        Ok(bytes)
    }

    fn upload(&self, _local: &Path, uri: &str) -> Result<()> {
        Err(Error::UploadError(format!(
            "HTTP mirrors are read-only: {}",
            uri
        )))
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        let response = self
            .client
            .head(uri)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to query {}: {}", uri, e)))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(false),
            status => Err(Error::DownloadError(format!("HTTP {} from {}", status, uri))),
        }
    }

    fn delete(&self, uri: &str) -> Result<()> {
        Err(Error::UploadError(format!(
            "HTTP mirrors are read-only: {}",
            uri
        )))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}
