// src/hash.rs

//! Digests and sidecar checksum files for repository artifacts
//!
//! Every artifact published on a mirror travels with a sidecar digest file
//! holding a single line in the form `<hexdigest>  <filename>`. Mirrors only
//! publish MD5 sidecars; SHA-256 is available for local bookkeeping.
//!
//! # Verification outcomes
//!
//! | Situation | [`VerifyStatus`] |
//! |-----------|------------------|
//! | sidecar present, digest matches | `Verified` |
//! | sidecar present, digest differs or is malformed | `Mismatch` |
//! | sidecar missing, unreadable or empty | `CannotVerify` |
//!
//! `CannotVerify` is deliberately distinct from `Mismatch`: callers treat it
//! as a warning rather than an integrity failure.

use crate::error::{Error, Result};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// MD5, the sidecar format every mirror speaks
    #[default]
    Md5,
    /// SHA-256
    Sha256,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha256 => 32,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    /// Sidecar file extension for this algorithm
    #[inline]
    pub const fn sidecar_extension(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(Error::ParseError(format!("unknown hash algorithm: {}", s))),
        }
    }
}

/// Incremental hasher over any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(hasher) => hasher.update(data),
            HasherState::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Md5(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
        }
    }

    /// Get the algorithm being used
    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// Compute a digest of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute a digest of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute the MD5 digest of a file, streaming its content
pub fn compute_digest(path: &Path) -> Result<String> {
    compute_digest_with(path, HashAlgorithm::Md5)
}

/// Compute a file digest with an explicit algorithm
pub fn compute_digest_with(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {}", path.display(), e)))?;
    hash_reader(algorithm, &mut file)
        .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))
}

/// One sidecar digest file: `<hexdigest>  <filename>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumRecord {
    /// Path of the artifact the digest covers
    pub artifact: PathBuf,
    pub algorithm: HashAlgorithm,
    /// Lowercase hex digest
    pub digest: String,
}

impl ChecksumRecord {
    /// Compute a record for an existing artifact
    pub fn for_file(artifact: &Path) -> Result<Self> {
        Ok(Self {
            artifact: artifact.to_path_buf(),
            algorithm: HashAlgorithm::Md5,
            digest: compute_digest(artifact)?,
        })
    }

    /// Default sidecar location: `<artifact>.md5`
    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push(".");
        name.push(HashAlgorithm::Md5.sidecar_extension());
        PathBuf::from(name)
    }

    /// Render the sidecar line
    pub fn to_line(&self) -> String {
        let basename = self
            .artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}  {}\n", self.digest, basename)
    }

    /// Parse sidecar content, taking the first whitespace-delimited token as digest
    pub fn parse(content: &str, artifact: &Path) -> Result<Self> {
        let digest = content
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::ParseError("empty checksum file".to_string()))?;

        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::ParseError(format!("invalid hex digest: {}", digest)));
        }

        let algorithm = match digest.len() {
            32 => HashAlgorithm::Md5,
            64 => HashAlgorithm::Sha256,
            n => {
                return Err(Error::ParseError(format!(
                    "digest of unexpected length {}",
                    n
                )));
            }
        };

        Ok(Self {
            artifact: artifact.to_path_buf(),
            algorithm,
            digest: digest.to_lowercase(),
        })
    }

    /// Write this record to a sidecar file
    pub fn write(&self, sidecar: &Path) -> Result<()> {
        fs::write(sidecar, self.to_line())
            .map_err(|e| Error::IoError(format!("Failed to write {}: {}", sidecar.display(), e)))
    }
}

/// Write `<artifact>.md5` next to an artifact and return its path
pub fn write_sidecar(artifact: &Path) -> Result<PathBuf> {
    let sidecar = ChecksumRecord::sidecar_path(artifact);
    ChecksumRecord::for_file(artifact)?.write(&sidecar)?;
    Ok(sidecar)
}

/// Outcome of checking an artifact against its sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
    Verified,
    Mismatch { expected: String, actual: String },
    /// The sidecar is absent or unreadable
    CannotVerify(String),
}

impl VerifyStatus {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::Mismatch { .. })
    }
}

/// Verify an artifact against its sidecar digest file
///
/// A missing artifact is an error. A sidecar that is missing, unreadable or
/// empty is `CannotVerify`. A sidecar whose first token is not a digest is a
/// `Mismatch`.
pub fn verify(path: &Path, sidecar: &Path) -> Result<VerifyStatus> {
    if !path.exists() {
        return Err(Error::NotFoundError(format!(
            "artifact {} not found",
            path.display()
        )));
    }

    let content = match fs::read(sidecar) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Cannot verify {}: cannot read {}: {}", path.display(), sidecar.display(), e);
            return Ok(VerifyStatus::CannotVerify(format!(
                "cannot read {}: {}",
                sidecar.display(),
                e
            )));
        }
    };
    if content.trim().is_empty() {
        warn!("Cannot verify {}: {} is empty", path.display(), sidecar.display());
        return Ok(VerifyStatus::CannotVerify(format!("{} is empty", sidecar.display())));
    }

    let record = match ChecksumRecord::parse(&content, path) {
        Ok(record) => record,
        Err(e) => {
            warn!("Malformed checksum file {}: {}", sidecar.display(), e);
            let expected = content.split_whitespace().next().unwrap_or_default();
            return Ok(VerifyStatus::Mismatch {
                expected: expected.chars().take(64).collect(),
                actual: compute_digest(path)?,
            });
        }
    };

    let actual = compute_digest_with(path, record.algorithm)?;
    if actual == record.digest {
        debug!("Checksum OK for {}", path.display());
        Ok(VerifyStatus::Verified)
    } else {
        Ok(VerifyStatus::Mismatch {
            expected: record.digest,
            actual,
        })
    }
}
