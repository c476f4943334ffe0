//! Persistence for the user settings record.
//!
//! The core only reads settings, except for the auto-read flag and the
//! first-install defaults. Settings are fetched again for every request so
//! edits made by the options surface apply without a restart.

use crate::config::Settings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The stored record, or `None` when nothing has been written yet.
    async fn load(&self) -> Result<Option<Settings>>;

    async fn save(&self, settings: &Settings) -> Result<()>;
}

/// Read the current settings, falling back to defaults when the record is
/// missing or unreadable.
pub async fn load_settings(store: &dyn SettingsStore) -> Settings {
    match store.load().await {
        Ok(Some(settings)) => settings,
        Ok(None) => {
            debug!("No stored settings; using defaults");
            Settings::default()
        }
        Err(err) => {
            warn!("Falling back to default settings: {err:#}");
            Settings::default()
        }
    }
}

/// Settings kept as one JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("settings.json")
            .to_string();
        name.push_str(&format!(".tmp-{}", std::process::id()));
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SettingsStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Settings>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading settings from {}", self.path.display()));
            }
        };
        let settings = Settings::from_json_str(&raw)
            .with_context(|| format!("parsing settings in {}", self.path.display()))?;
        Ok(Some(settings))
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let contents = serde_json::to_string_pretty(settings).context("serializing settings")?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, contents)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Saved settings");
        Ok(())
    }
}

/// In-memory store for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<Option<Settings>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            record: Mutex::new(Some(settings)),
        }
    }

    /// Replace the record, as the options surface would.
    pub fn set(&self, settings: Settings) {
        if let Ok(mut record) = self.record.lock() {
            *record = Some(settings);
        }
    }

    pub fn snapshot(&self) -> Option<Settings> {
        self.record.lock().ok().and_then(|record| record.clone())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn load(&self) -> Result<Option<Settings>> {
        Ok(self.snapshot().map(Settings::normalized))
    }

    async fn save(&self, settings: &Settings) -> Result<()> {
        self.set(settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnginePreference;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_store_round_trips_and_reports_missing() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join("settings.json");
        let store = JsonFileStore::new(&path);
        assert_eq!(store.load().await.expect("missing is ok"), None);

        let settings = Settings {
            api_key: "sk-test".to_string(),
            engine: EnginePreference::Local,
            auto_read: true,
            ..Settings::default()
        };
        store.save(&settings).await.expect("save");
        let loaded = store.load().await.expect("load").expect("record present");
        assert_eq!(loaded, settings);

        let raw = std::fs::read_to_string(&path).expect("file written");
        assert!(raw.contains("\"apiKey\""));
    }

    #[tokio::test]
    async fn unreadable_record_falls_back_to_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").expect("write");

        let store = JsonFileStore::new(&path);
        assert!(store.load().await.is_err());
        assert_eq!(load_settings(&store).await, Settings::default());
    }

    #[tokio::test]
    async fn memory_store_normalizes_on_read() {
        let store = MemoryStore::with_settings(Settings {
            speed: 9.0,
            ..Settings::default()
        });
        assert_eq!(load_settings(&store).await.speed, 1.2);
    }
}
