//! PIN and password storage (SHA-256 digests) and the unlock gatekeeper.

use crate::store::write_atomic;
use sentinel_core::{CosineMatcher, Credential, EnrollmentRecord, LockMethod, LockVerifier, Matcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("{0} is not a secret-based lock method")]
    NotASecret(LockMethod),
    #[error("secret must not be empty")]
    EmptySecret,
    #[error("credential I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file is malformed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("credential encoding failed: {0}")]
    Encode(#[from] toml::ser::Error),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

fn digest(secret: &str) -> String {
    format!("{:x}", Sha256::digest(secret.as_bytes()))
}

/// One secret per secret-based lock type.
pub struct CredentialStore {
    path: PathBuf,
    file: CredentialFile,
}

impl CredentialStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CredentialFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, file })
    }

    fn slot(&self, method: LockMethod) -> Option<&String> {
        match method {
            LockMethod::Pin => self.file.pin.as_ref(),
            LockMethod::Password => self.file.password.as_ref(),
            LockMethod::Fingerprint | LockMethod::Face => None,
        }
    }

    pub fn has_secret(&self, method: LockMethod) -> bool {
        self.slot(method).is_some()
    }

    pub fn set_secret(&mut self, method: LockMethod, secret: &str) -> Result<(), CredentialError> {
        if secret.is_empty() {
            return Err(CredentialError::EmptySecret);
        }
        let mut next = self.file.clone();
        match method {
            LockMethod::Pin => next.pin = Some(digest(secret)),
            LockMethod::Password => next.password = Some(digest(secret)),
            other => return Err(CredentialError::NotASecret(other)),
        }
        write_atomic(&self.path, toml::to_string(&next)?.as_bytes())?;
        self.file = next;
        tracing::info!(method = %method, "secret updated");
        Ok(())
    }

    /// Equality check of `input` against the stored secret. False if unset.
    pub fn verify_secret(&self, method: LockMethod, input: &str) -> bool {
        self.slot(method).is_some_and(|stored| *stored == digest(input))
    }
}

/// Unlock decisions across every lock method.
pub struct Gatekeeper<'a> {
    credentials: &'a CredentialStore,
    gallery: &'a [EnrollmentRecord],
}

impl<'a> Gatekeeper<'a> {
    pub fn new(credentials: &'a CredentialStore, gallery: &'a [EnrollmentRecord]) -> Self {
        Self {
            credentials,
            gallery,
        }
    }
}

impl LockVerifier for Gatekeeper<'_> {
    fn verify(&self, method: LockMethod, credential: Credential<'_>) -> bool {
        let verified = match (method, credential) {
            (LockMethod::Pin | LockMethod::Password, Credential::Secret(input)) => {
                self.credentials.verify_secret(method, input)
            }
            (LockMethod::Fingerprint, Credential::Fingerprint(accepted)) => accepted,
            (LockMethod::Face, Credential::Face(candidate)) => {
                CosineMatcher.compare(candidate, self.gallery).matched
            }
            _ => false,
        };
        tracing::info!(method = %method, verified, "unlock attempt");
        verified
    }
}
