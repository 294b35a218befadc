//! Face enrollment store: one JSON file per enrollment.
//!
//! Layout: `<root>/<owner_id>/<record_id>.json`. Every listing re-reads the
//! directory; there is no cache.

use sentinel_core::{EnrollmentRecord, FaceSignature};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("signature is empty or incomplete; not all facial features were detected")]
    InvalidSignature,
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),
    #[error("enrollment not found: {0}")]
    NotFound(String),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Write `bytes` to `path` via a `.tmp` sibling and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Owner and record ids become path components.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        && !id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

pub struct EnrollmentStore {
    root: PathBuf,
}

impl EnrollmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn owner_dir(&self, owner_id: &str) -> Result<PathBuf, StoreError> {
        validate_id(owner_id)?;
        Ok(self.root.join(owner_id))
    }

    /// Persist a new enrollment. Multiple enrollments per owner are expected.
    pub fn enroll(&self, owner_id: &str, signature: &FaceSignature) -> Result<String, StoreError> {
        if !signature.is_valid() {
            return Err(StoreError::InvalidSignature);
        }
        let dir = self.owner_dir(owner_id)?;
        let record = EnrollmentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            signature: signature.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        write_atomic(&dir.join(format!("{}.json", record.id)), &json)?;

        tracing::info!(owner = owner_id, id = %record.id, "enrollment stored");
        Ok(record.id)
    }

    /// All decodable records for an owner, oldest first.
    pub fn gallery(&self, owner_id: &str) -> Result<Vec<EnrollmentRecord>, StoreError> {
        let dir = self.owner_dir(owner_id)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record = std::fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<EnrollmentRecord>(&bytes)?));
            match record {
                Ok(r) if r.signature.is_valid() => records.push(r),
                Ok(_) => tracing::warn!(path = %path.display(), "skipping record with invalid signature"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    pub fn list_enrollments(&self, owner_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.gallery(owner_id)?.into_iter().map(|r| r.id).collect())
    }

    /// Remove one enrollment. A missing record is `StoreError::NotFound`.
    pub fn delete(&self, owner_id: &str, record_id: &str) -> Result<(), StoreError> {
        validate_id(record_id)?;
        let path = self.owner_dir(owner_id)?.join(format!("{record_id}.json"));
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(owner = owner_id, id = record_id, "enrollment removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(record_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
