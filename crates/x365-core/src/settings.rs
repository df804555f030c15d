use crate::config::{DownloadOptions, LaunchConfig};
use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Everything the manager persists between runs.
///
/// Unknown keys are ignored and missing keys fall back to defaults, so documents written
/// by older versions load unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerSettings {
    pub emulator_path: Option<PathBuf>,
    pub games_directory: Option<PathBuf>,
    pub download_directory: Option<PathBuf>,
    pub emulator_download_url: Option<String>,
    pub setup_completed: bool,
    pub default_launch: LaunchConfig,
    pub download: DownloadOptions,
}

impl ManagerSettings {
    /// Global launch defaults with a game's own config laid over them.
    pub fn launch_config_for(&self, per_game: Option<&LaunchConfig>) -> LaunchConfig {
        match per_game {
            Some(cfg) => self.default_launch.overlay(cfg),
            None => self.default_launch.clone(),
        }
    }
}

/// Where settings live. Injected so callers never reach for a global.
pub trait SettingsStore {
    fn load(&self) -> CoreResult<ManagerSettings>;
    fn save(&self, settings: &ManagerSettings) -> CoreResult<()>;
}

/// Pretty-printed JSON document on disk.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn load(&self) -> CoreResult<ManagerSettings> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no settings file, using defaults");
            return Ok(ManagerSettings::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, settings: &ManagerSettings) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<ManagerSettings>,
}

impl MemoryStore {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> CoreResult<ManagerSettings> {
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, settings: &ManagerSettings) -> CoreResult<()> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = settings.clone();
        Ok(())
    }
}
