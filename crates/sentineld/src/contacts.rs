//! Emergency contacts, one `name,recipient` line each.

use crate::store::write_atomic;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContactsError {
    #[error("contact {0} must be non-empty and free of commas and newlines")]
    InvalidField(&'static str),
    #[error("contacts I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmergencyContact {
    pub name: String,
    /// Phone number or chat id, whatever the messaging sink addresses.
    pub recipient: String,
}

/// Parse the contacts file. Malformed lines are skipped.
pub fn parse_contacts(text: &str) -> Vec<EmergencyContact> {
    text.lines()
        .filter_map(|line| {
            let (name, recipient) = line.split_once(',')?;
            let (name, recipient) = (name.trim(), recipient.trim());
            if name.is_empty() || recipient.is_empty() {
                return None;
            }
            Some(EmergencyContact {
                name: name.to_string(),
                recipient: recipient.to_string(),
            })
        })
        .collect()
}

fn check_field(value: &str, field: &'static str) -> Result<(), ContactsError> {
    if value.trim().is_empty() || value.contains([',', '\n', '\r']) {
        return Err(ContactsError::InvalidField(field));
    }
    Ok(())
}

pub struct ContactsStore {
    path: PathBuf,
}

impl ContactsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current contacts; a missing file means none.
    pub fn load(&self) -> Result<Vec<EmergencyContact>, ContactsError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_contacts(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn add(&self, name: &str, recipient: &str) -> Result<(), ContactsError> {
        check_field(name, "name")?;
        check_field(recipient, "recipient")?;
        let mut contacts = self.load()?;
        contacts.push(EmergencyContact {
            name: name.trim().to_string(),
            recipient: recipient.trim().to_string(),
        });

        let text: String = contacts
            .iter()
            .map(|c| format!("{},{}\n", c.name, c.recipient))
            .collect();
        write_atomic(&self.path, text.as_bytes())?;
        tracing::info!(name = name.trim(), "emergency contact added");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;

    #[test]
    fn test_parse_skips_malformed_lines() {
        let contacts = parse_contacts("Mom,+15550100\ngarbage\n,+1555\nDad , +15550101 \n\n");
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[1].name, "Dad");
        assert_eq!(contacts[1].recipient, "+15550101");
    }

    #[test]
    fn test_add_and_load() {
        let dir = scratch_dir("contacts");
        let store = ContactsStore::new(dir.join("contacts.txt"));
        assert!(store.load().unwrap().is_empty());

        store.add("Mom", "+15550100").unwrap();
        store.add("Sam", "987654").unwrap();
        let contacts = store.load().unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].recipient, "+15550100");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_add_rejects_separator() {
        let dir = scratch_dir("contacts");
        let store = ContactsStore::new(dir.join("contacts.txt"));
        assert!(matches!(
            store.add("Smith, J", "1"),
            Err(ContactsError::InvalidField("name"))
        ));
        assert!(matches!(store.add("J", " "), Err(ContactsError::InvalidField("recipient"))));
        std::fs::remove_dir_all(&dir).ok();
    }
}
