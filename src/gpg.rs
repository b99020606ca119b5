// src/gpg.rs

//! OpenPGP detached signatures for repository artifacts
//!
//! Clients verify `<artifact>.asc` against the public key imported for the
//! repository (`<keyring>/<repo id>.asc`). Servers sign every uploaded
//! artifact with an armored secret key. Both sides use sequoia-openpgp.

use crate::error::{Error, Result};
use crate::repository::FileNames;
use openpgp::armor;
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::SerializeInto;
use openpgp::serialize::stream::{Armorer, Message, Signer};
use sequoia_openpgp as openpgp;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Signature verifier backed by a per-repository keyring directory
pub struct GpgVerifier {
    keyring_dir: PathBuf,
    policy: StandardPolicy<'static>,
}

impl GpgVerifier {
    /// Create a verifier, creating the keyring directory if needed
    pub fn new(keyring_dir: PathBuf) -> Result<Self> {
        if !keyring_dir.exists() {
            fs::create_dir_all(&keyring_dir).map_err(|e| {
                Error::IoError(format!("Failed to create keyring directory: {}", e))
            })?;
        }

        Ok(Self {
            keyring_dir,
            policy: StandardPolicy::new(),
        })
    }

    /// Import a public key for a repository, returning its fingerprint
    pub fn import_key(&self, key_data: &[u8], repository: &str) -> Result<String> {
        let cert = openpgp::Cert::from_bytes(key_data)
            .map_err(|e| Error::ParseError(format!("Failed to parse GPG key: {}", e)))?;
        let fingerprint = cert.fingerprint().to_string();

        fs::write(self.key_path(repository), key_data)
            .map_err(|e| Error::IoError(format!("Failed to write GPG key: {}", e)))?;

        info!(
            "Imported GPG key for repository '{}' (fingerprint: {})",
            repository, fingerprint
        );
        Ok(fingerprint)
    }

    fn key_path(&self, repository: &str) -> PathBuf {
        self.keyring_dir.join(format!("{}.asc", repository))
    }

    pub fn has_key(&self, repository: &str) -> bool {
        self.key_path(repository).exists()
    }

    /// Verify a detached signature of `file_path`
    pub fn verify_signature(
        &self,
        file_path: &Path,
        signature_path: &Path,
        repository: &str,
    ) -> Result<()> {
        debug!(
            "Verifying signature for {:?} using repository '{}'",
            file_path, repository
        );

        let key_path = self.key_path(repository);
        if !key_path.exists() {
            return Err(Error::NotFoundError(format!(
                "GPG key not found for repository '{}'",
                repository
            )));
        }

        let key_data = fs::read(&key_path)
            .map_err(|e| Error::IoError(format!("Failed to read GPG key: {}", e)))?;
        let cert = openpgp::Cert::from_bytes(&key_data)
            .map_err(|e| Error::ParseError(format!("Failed to parse GPG key: {}", e)))?;

        let message_data = fs::read(file_path)
            .map_err(|e| Error::IoError(format!("Failed to read file to verify: {}", e)))?;
        let signature_data = fs::read(signature_path)
            .map_err(|e| Error::IoError(format!("Failed to read signature file: {}", e)))?;

        let signature_pile = openpgp::PacketPile::from_bytes(&signature_data)
            .map_err(|e| Error::ParseError(format!("Failed to parse signature: {}", e)))?;

        let valid = signature_pile.descendants().any(|packet| match packet {
            openpgp::Packet::Signature(sig) => cert
                .keys()
                .with_policy(&self.policy, None)
                .filter(|key| key.for_signing())
                .any(|key| sig.verify_message(key.key(), &message_data).is_ok()),
            _ => false,
        });

        if !valid {
            return Err(Error::GpgVerificationFailed(format!(
                "no valid signature for {}",
                file_path.display()
            )));
        }

        info!("Successfully verified signature for {:?}", file_path);
        Ok(())
    }
}

/// Outcome of checking an artifact signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    Verified,
    /// No signature published; tolerated outside strict mode
    Unsigned,
    /// Checking disabled for the repository
    Skipped,
}

/// Signature policy of one repository
#[derive(Debug, Clone)]
pub struct SignaturePolicy {
    pub gpg_check: bool,
    /// Missing signatures are errors
    pub gpg_strict: bool,
    pub keyring_dir: PathBuf,
    pub repository: String,
}

/// Check `artifact` against `signature` (if one was fetched) under `policy`
///
/// An invalid signature always fails. A missing signature fails only in
/// strict mode. A missing key fails.
pub fn check_artifact(
    artifact: &Path,
    signature: Option<&Path>,
    policy: &SignaturePolicy,
) -> Result<SignatureStatus> {
    if !policy.gpg_check {
        return Ok(SignatureStatus::Skipped);
    }

    let Some(signature) = signature.filter(|s| s.exists()) else {
        if policy.gpg_strict {
            return Err(Error::GpgVerificationFailed(format!(
                "GPG signature required but not found for '{}' (strict mode enabled)",
                artifact.display()
            )));
        }
        warn!("No GPG signature found for {}", artifact.display());
        return Ok(SignatureStatus::Unsigned);
    };

    let verifier = GpgVerifier::new(policy.keyring_dir.clone())?;
    match verifier.verify_signature(artifact, signature, &policy.repository) {
        Ok(()) => Ok(SignatureStatus::Verified),
        Err(Error::NotFoundError(msg)) => Err(Error::GpgVerificationFailed(format!(
            "{}; import the repository key or disable gpg_check for '{}'",
            msg, policy.repository
        ))),
        Err(e) => Err(e),
    }
}

/// Produces detached signatures for uploaded artifacts
pub trait ArtifactSigner {
    /// Write `<path>.asc` and return its path
    fn sign_file(&self, path: &Path) -> Result<PathBuf>;

    /// Armored public key matching the signatures
    fn public_key(&self) -> Result<Vec<u8>>;
}

/// Signer using an armored OpenPGP secret key
pub struct GpgSigner {
    cert: openpgp::Cert,
    policy: StandardPolicy<'static>,
}

impl GpgSigner {
    pub fn from_bytes(key_data: &[u8]) -> Result<Self> {
        let cert = openpgp::Cert::from_bytes(key_data)
            .map_err(|e| Error::ParseError(format!("Failed to parse signing key: {}", e)))?;
        if !cert.is_tsk() {
            return Err(Error::SigningError(format!(
                "key {} has no secret key material",
                cert.fingerprint()
            )));
        }
        Ok(Self {
            cert,
            policy: StandardPolicy::new(),
        })
    }

    pub fn from_file(key_path: &Path) -> Result<Self> {
        let key_data = fs::read(key_path).map_err(|e| {
            Error::IoError(format!(
                "Failed to read signing key {}: {}",
                key_path.display(),
                e
            ))
        })?;
        Self::from_bytes(&key_data)
    }

    pub fn fingerprint(&self) -> String {
        self.cert.fingerprint().to_string()
    }

    /// Armored detached signature over `data`
    pub fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let keypair = self
            .cert
            .keys()
            .unencrypted_secret()
            .with_policy(&self.policy, None)
            .alive()
            .revoked(false)
            .for_signing()
            .next()
            .ok_or_else(|| {
                Error::SigningError(format!(
                    "no usable unencrypted signing key in {}",
                    self.cert.fingerprint()
                ))
            })?
            .key()
            .clone()
            .into_keypair()
            .map_err(|e| Error::SigningError(e.to_string()))?;

        let mut sink = Vec::new();
        {
            let message = Message::new(&mut sink);
            let message = Armorer::new(message)
                .kind(armor::Kind::Signature)
                .build()
                .map_err(|e| Error::SigningError(e.to_string()))?;
            let mut signer = Signer::new(message, keypair)
                .detached()
                .build()
                .map_err(|e| Error::SigningError(e.to_string()))?;
            signer.write_all(data)?;
            signer
                .finalize()
                .map_err(|e| Error::SigningError(e.to_string()))?;
        }
        Ok(sink)
    }
}

impl ArtifactSigner for GpgSigner {
    fn sign_file(&self, path: &Path) -> Result<PathBuf> {
        let data = fs::read(path)?;
        let signature = self.sign_bytes(&data)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::SigningError(format!("no file name in {}", path.display())))?;
        let sig_path = path.with_file_name(FileNames::signature_of(&name));
        fs::write(&sig_path, signature)?;
        debug!("Signed {}", path.display());
        Ok(sig_path)
    }

    fn public_key(&self) -> Result<Vec<u8>> {
        self.cert
            .armored()
            .to_vec()
            .map_err(|e| Error::SigningError(e.to_string()))
    }
}
