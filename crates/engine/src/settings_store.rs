//! Persistence for [`EngineSettings`].

use parking_lot::Mutex;
use shared::settings::EngineSettings;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::StoreError;

/// Load/save hooks for the engine configuration. Writes are last-writer-wins,
/// one whole settings object at a time.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<EngineSettings, StoreError>;
    fn save(&self, settings: &EngineSettings) -> Result<(), StoreError>;
}

pub fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com.local", "Quill Notes", "QuillNotes")
}

/// Settings kept in one JSON file.
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `engine.json` in the platform config directory.
    pub fn open_default() -> Result<Self, StoreError> {
        let dirs = project_dirs().ok_or_else(|| {
            StoreError::Initialization("Could not determine config directory".to_string())
        })?;
        Ok(Self::new(dirs.config_dir().join("engine.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<EngineSettings, StoreError> {
        if !self.path.exists() {
            return Ok(EngineSettings::default());
        }
        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt settings file, using defaults");
                Ok(EngineSettings::default())
            }
        }
    }

    fn save(&self, settings: &EngineSettings) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Settings that live only as long as the process.
#[derive(Default)]
pub struct MemorySettingsStore {
    settings: Mutex<EngineSettings>,
}

impl MemorySettingsStore {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<EngineSettings, StoreError> {
        Ok(self.settings.lock().clone())
    }

    fn save(&self, settings: &EngineSettings) -> Result<(), StoreError> {
        *self.settings.lock() = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::settings::BackendKind;
    use tempfile::TempDir;

    #[test]
    fn test_json_store_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("engine.json");

        let store = JsonSettingsStore::new(&path);
        assert_eq!(store.load().unwrap(), EngineSettings::default());

        let mut settings = EngineSettings::default();
        settings.backend = BackendKind::RemoteApi;
        settings.daemon.port = 11500;
        settings.remember_model(BackendKind::LocalDaemon, "llama3.2:3b");
        store.save(&settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = JsonSettingsStore::new(&path);
        assert_eq!(reopened.load().unwrap(), settings);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonSettingsStore::new(&path);
        assert_eq!(store.load().unwrap(), EngineSettings::default());
    }
}
