use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::signature::FaceSignature;

/// Ways the owner can unlock the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMethod {
    Pin,
    Password,
    Fingerprint,
    Face,
}

impl LockMethod {
    /// Methods backed by a stored secret string.
    pub fn is_secret(&self) -> bool {
        matches!(self, LockMethod::Pin | LockMethod::Password)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMethod::Pin => "pin",
            LockMethod::Password => "password",
            LockMethod::Fingerprint => "fingerprint",
            LockMethod::Face => "face",
        }
    }
}

impl fmt::Display for LockMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown lock method: {0} (expected pin, password, fingerprint, or face)")]
pub struct UnknownLockMethod(pub String);

impl FromStr for LockMethod {
    type Err = UnknownLockMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pin" => Ok(LockMethod::Pin),
            "password" => Ok(LockMethod::Password),
            "fingerprint" => Ok(LockMethod::Fingerprint),
            "face" => Ok(LockMethod::Face),
            other => Err(UnknownLockMethod(other.to_string())),
        }
    }
}

/// User input offered to a lock method.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    /// Entered PIN or password.
    Secret(&'a str),
    /// Verdict of the platform fingerprint reader.
    Fingerprint(bool),
    /// Signature of the face currently in front of the camera.
    Face(&'a FaceSignature),
}

/// Common verification capability across lock methods.
///
/// Implementations fail closed: a credential of the wrong kind for the
/// method, or a method with nothing configured, never verifies.
pub trait LockVerifier {
    fn verify(&self, method: LockMethod, credential: Credential<'_>) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lock_method() {
        assert_eq!("PIN".parse::<LockMethod>(), Ok(LockMethod::Pin));
        assert_eq!(" face ".parse::<LockMethod>(), Ok(LockMethod::Face));
        assert_eq!(
            "pattern".parse::<LockMethod>(),
            Err(UnknownLockMethod("pattern".into()))
        );
    }

    #[test]
    fn test_display_roundtrips() {
        for m in [LockMethod::Pin, LockMethod::Password, LockMethod::Fingerprint, LockMethod::Face] {
            assert_eq!(m.to_string().parse::<LockMethod>(), Ok(m));
        }
    }

    #[test]
    fn test_is_secret() {
        assert!(LockMethod::Pin.is_secret());
        assert!(LockMethod::Password.is_secret());
        assert!(!LockMethod::Face.is_secret());
        assert!(!LockMethod::Fingerprint.is_secret());
    }
}
