use crate::store::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is malformed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("settings encoding failed: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Owner preferences shared by the motion detector and the decoy flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub sound_alert_enabled: bool,
    /// Calculator disguise; only persisted and reported here.
    pub stealth_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sound_alert_enabled: true,
            stealth_mode: false,
        }
    }
}

/// Settings read once at startup and changed only through the setters.
pub struct SettingsStore {
    path: PathBuf,
    current: Settings,
}

impl SettingsStore {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let current = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), ?current, "settings loaded");
        Ok(Self { path, current })
    }

    pub fn get(&self) -> Settings {
        self.current
    }

    pub fn set_sound_alert_enabled(&mut self, enabled: bool) -> Result<(), SettingsError> {
        self.update(|s| s.sound_alert_enabled = enabled)
    }

    pub fn set_stealth_mode(&mut self, enabled: bool) -> Result<(), SettingsError> {
        self.update(|s| s.stealth_mode = enabled)
    }

    fn update(&mut self, change: impl FnOnce(&mut Settings)) -> Result<(), SettingsError> {
        let mut next = self.current;
        change(&mut next);
        write_atomic(&self.path, toml::to_string(&next)?.as_bytes())?;
        self.current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = scratch_dir("settings");
        let store = SettingsStore::load(dir.join("settings.toml")).unwrap();
        assert_eq!(store.get(), Settings::default());
        assert!(store.get().sound_alert_enabled);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_setters_persist() {
        let dir = scratch_dir("settings");
        let path = dir.join("settings.toml");
        let mut store = SettingsStore::load(&path).unwrap();
        store.set_sound_alert_enabled(false).unwrap();
        store.set_stealth_mode(true).unwrap();

        let reloaded = SettingsStore::load(&path).unwrap().get();
        assert!(!reloaded.sound_alert_enabled);
        assert!(reloaded.stealth_mode);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = scratch_dir("settings");
        let path = dir.join("settings.toml");
        std::fs::write(&path, "stealth_mode = true\n").unwrap();
        let s = SettingsStore::load(&path).unwrap().get();
        assert!(s.stealth_mode);
        assert!(s.sound_alert_enabled);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = scratch_dir("settings");
        let path = dir.join("settings.toml");
        std::fs::write(&path, "stealth_mode = maybe").unwrap();
        assert!(matches!(SettingsStore::load(&path), Err(SettingsError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }
}
