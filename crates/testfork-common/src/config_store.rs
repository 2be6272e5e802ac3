// ConfigurationStore: loads and saves dispatcher settings from a JSON file,
// then applies environment overrides.

use crate::constants::{self, variables};
use crate::fork_options::ForkOptions;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// DispatcherSettings
// ---------------------------------------------------------------------------

/// Persisted dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSettings {
    /// Maximum number of worker processes running at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Explicit worker executable. When unset the worker binary is looked up
    /// next to the current executable, then on `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_executable: Option<PathBuf>,

    /// Base URL of the user guide linked from remediation messages.
    #[serde(default = "default_documentation_url")]
    pub documentation_url: String,

    /// Module name → implementation classpath entries, in precedence order.
    #[serde(default)]
    pub modules: BTreeMap<String, Vec<PathBuf>>,

    /// Options applied to every forked worker.
    #[serde(default)]
    pub fork_options: ForkOptions,

    /// Default test command when none is given on the command line.
    #[serde(default)]
    pub test_command: Vec<String>,

    /// How long to wait for a forked worker to connect back.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Directory for IPC sockets. Defaults to `/tmp` to stay under the
    /// platform limit on socket path length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
}

fn default_max_workers() -> usize {
    constants::DEFAULT_MAX_WORKERS
}

fn default_documentation_url() -> String {
    constants::DEFAULT_DOCUMENTATION_URL.to_string()
}

fn default_connect_timeout_secs() -> u64 {
    constants::DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_executable: None,
            documentation_url: default_documentation_url(),
            modules: BTreeMap::new(),
            fork_options: ForkOptions::default(),
            test_command: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            socket_dir: None,
        }
    }
}

impl DispatcherSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(variables::MAX_WORKERS) {
            self.max_workers = value.trim().parse().with_context(|| {
                format!("{} must be a positive integer, got '{}'", variables::MAX_WORKERS, value)
            })?;
        }
        if let Some(value) = lookup(variables::WORKER_PATH).filter(|v| !v.is_empty()) {
            self.worker_executable = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(variables::DOCS_URL).filter(|v| !v.is_empty()) {
            self.documentation_url = value;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConfigurationStore
// ---------------------------------------------------------------------------

/// Loads and saves [`DispatcherSettings`]. Settings are cached after the
/// first successful load.
pub struct ConfigurationStore {
    config_file_path: PathBuf,
    settings: Mutex<Option<DispatcherSettings>>,
}

impl ConfigurationStore {
    pub fn new(config_file_path: impl Into<PathBuf>) -> Self {
        Self {
            config_file_path: config_file_path.into(),
            settings: Mutex::new(None),
        }
    }

    /// Store rooted at `dir`, using the well-known settings file name.
    pub fn in_directory(dir: &Path) -> Self {
        Self::new(dir.join(constants::WellKnownConfigFile::Settings.file_name()))
    }

    pub fn config_file_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Whether a settings file exists on disk.
    pub fn is_configured(&self) -> bool {
        self.config_file_path.exists()
    }

    /// Load settings from disk (defaults when the file is absent) and apply
    /// environment overrides.
    pub fn get_settings(&self) -> Result<DispatcherSettings> {
        self.get_settings_with(|name| std::env::var(name).ok())
    }

    pub fn get_settings_with<F>(&self, lookup: F) -> Result<DispatcherSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut guard = self.settings.lock();
        if let Some(ref settings) = *guard {
            return Ok(settings.clone());
        }

        let mut settings = if self.is_configured() {
            let json = fs::read_to_string(&self.config_file_path).with_context(|| {
                format!("Failed to read settings from {:?}", self.config_file_path)
            })?;
            serde_json::from_str(&json).with_context(|| {
                format!("Failed to deserialize settings in {:?}", self.config_file_path)
            })?
        } else {
            DispatcherSettings::default()
        };
        settings.apply_env_overrides(lookup)?;

        *guard = Some(settings.clone());
        Ok(settings)
    }

    /// Save settings to disk and refresh the cache.
    pub fn save_settings(&self, settings: &DispatcherSettings) -> Result<()> {
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.config_file_path, &json).with_context(|| {
            format!("Failed to write settings to {:?}", self.config_file_path)
        })?;

        *self.settings.lock() = Some(settings.clone());
        Ok(())
    }

    /// Delete the settings file and clear the cache.
    pub fn delete_settings(&self) {
        let _ = fs::remove_file(&self.config_file_path);
        *self.settings.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::in_directory(dir.path());
        assert!(!store.is_configured());
        let settings = store.get_settings_with(no_env).unwrap();
        assert_eq!(settings, DispatcherSettings::default());
        assert_eq!(settings.max_workers, constants::DEFAULT_MAX_WORKERS);
    }

    #[test]
    fn save_then_load_from_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::in_directory(dir.path());
        let mut settings = DispatcherSettings {
            max_workers: 2,
            test_command: vec!["sh".into(), "-c".into()],
            ..DispatcherSettings::default()
        };
        settings
            .modules
            .insert("testfork-core".into(), vec![PathBuf::from("/opt/tf/core")]);
        store.save_settings(&settings).unwrap();

        let reloaded = ConfigurationStore::in_directory(dir.path())
            .get_settings_with(no_env)
            .unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::in_directory(dir.path());
        fs::write(store.config_file_path(), r#"{"maxWorkers": 8}"#).unwrap();
        let settings = store.get_settings_with(no_env).unwrap();
        assert_eq!(settings.max_workers, 8);
        assert_eq!(settings.connect_timeout_secs, constants::DEFAULT_CONNECT_TIMEOUT_SECS);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (variables::MAX_WORKERS, "3"),
            (variables::WORKER_PATH, "/opt/testfork-worker"),
            (variables::DOCS_URL, "https://docs.internal/"),
        ]
        .into_iter()
        .collect();
        let mut settings = DispatcherSettings::default();
        settings
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.max_workers, 3);
        assert_eq!(
            settings.worker_executable,
            Some(PathBuf::from("/opt/testfork-worker"))
        );
        assert_eq!(settings.documentation_url, "https://docs.internal/");
    }

    #[test]
    fn bad_max_workers_is_an_error() {
        let mut settings = DispatcherSettings::default();
        let err = settings
            .apply_env_overrides(|k| (k == variables::MAX_WORKERS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(variables::MAX_WORKERS));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigurationStore::in_directory(dir.path());
        fs::write(store.config_file_path(), "{not json").unwrap();
        assert!(store.get_settings_with(no_env).is_err());
    }
}
