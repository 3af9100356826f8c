use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::kubernetes::ReadinessProbe;

/// Errors that can occur during settings operations
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse settings file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error("Home directory not found")]
    HomeDirNotFound,
}

/// Port-forward tunnel tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Bytes relayed per read in each direction
    #[serde(default = "default_relay_chunk_size")]
    pub relay_chunk_size: usize,
    /// Upper bound on how long the accept loop waits before re-checking for stop
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
    /// First readiness probe wait
    #[serde(default = "default_probe_initial_ms")]
    pub probe_initial_ms: u64,
    /// Readiness probe backoff cap
    #[serde(default = "default_probe_max_ms")]
    pub probe_max_ms: u64,
}

fn default_relay_chunk_size() -> usize {
    4096
}

fn default_accept_poll_ms() -> u64 {
    1000
}

fn default_probe_initial_ms() -> u64 {
    50
}

fn default_probe_max_ms() -> u64 {
    2000
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            relay_chunk_size: default_relay_chunk_size(),
            accept_poll_ms: default_accept_poll_ms(),
            probe_initial_ms: default_probe_initial_ms(),
            probe_max_ms: default_probe_max_ms(),
        }
    }
}

impl TunnelSettings {
    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }

    pub fn probe(&self) -> ReadinessProbe {
        ReadinessProbe::new(
            Duration::from_millis(self.probe_initial_ms.max(1)),
            Duration::from_millis(self.probe_max_ms.max(1)),
        )
    }
}

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Where cluster state lives. Defaults to `~/.light`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// System kubeconfig to merge into. Defaults to `$KUBECONFIG` or `~/.kube/config`.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub tunnel: TunnelSettings,
}

impl Settings {
    /// Get the settings directory path
    pub fn config_dir() -> Result<PathBuf, SettingsError> {
        Ok(dirs::config_dir()
            .ok_or(SettingsError::ConfigDirNotFound)?
            .join("light"))
    }

    /// Get the settings file path
    pub fn config_path() -> Result<PathBuf, SettingsError> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load settings from `path`, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::info!("Settings file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&contents)?;

        tracing::info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<(), SettingsError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf, SettingsError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::home_dir()
                .ok_or(SettingsError::HomeDirNotFound)?
                .join(".light")),
        }
    }

    pub fn clusters_dir(&self) -> Result<PathBuf, SettingsError> {
        Ok(self.data_dir()?.join("clusters"))
    }

    pub fn cluster_dir(&self, name: &str) -> Result<PathBuf, SettingsError> {
        Ok(self.clusters_dir()?.join(name))
    }

    /// Symlink to the directory of the active cluster
    pub fn current_cluster_link(&self) -> Result<PathBuf, SettingsError> {
        Ok(self.data_dir()?.join("current_cluster"))
    }

    /// Kubeconfig of the active cluster
    pub fn cluster_kubeconfig_path(&self) -> Result<PathBuf, SettingsError> {
        Ok(self.current_cluster_link()?.join("kubeconfig.yaml"))
    }

    /// The system kubeconfig: the override, else the first `$KUBECONFIG` entry,
    /// else `~/.kube/config`. The file does not need to exist.
    pub fn system_kubeconfig_path(&self) -> Result<PathBuf, SettingsError> {
        if let Some(path) = &self.kubeconfig {
            return Ok(path.clone());
        }

        if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
            let separator = if cfg!(windows) { ';' } else { ':' };
            if let Some(first) = kubeconfig.split(separator).find(|p| !p.is_empty()) {
                return Ok(PathBuf::from(first));
            }
        }

        Ok(dirs::home_dir()
            .ok_or(SettingsError::HomeDirNotFound)?
            .join(".kube")
            .join("config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.tunnel.relay_chunk_size, 4096);
        assert_eq!(settings.tunnel.accept_poll(), Duration::from_secs(1));
        assert_eq!(settings.tunnel.probe(), ReadinessProbe::default());
    }

    #[test]
    fn test_partial_settings_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"data_dir": "/srv/light", "tunnel": {"relay_chunk_size": 1024}}"#)
            .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.data_dir().unwrap(), PathBuf::from("/srv/light"));
        assert_eq!(settings.tunnel.relay_chunk_size, 1024);
        assert_eq!(settings.tunnel.probe_max_ms, 2000);
    }

    #[test]
    fn test_missing_settings_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.json")).unwrap();
        assert!(settings.data_dir.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            kubeconfig: Some(PathBuf::from("/etc/kube/config")),
            ..Default::default()
        };

        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.kubeconfig, settings.kubeconfig);
    }

    #[test]
    fn test_cluster_paths() {
        let settings = Settings {
            data_dir: Some(PathBuf::from("/data")),
            kubeconfig: Some(PathBuf::from("/kube/config")),
            ..Default::default()
        };
        assert_eq!(
            settings.cluster_dir("prod").unwrap(),
            PathBuf::from("/data/clusters/prod")
        );
        assert_eq!(
            settings.cluster_kubeconfig_path().unwrap(),
            PathBuf::from("/data/current_cluster/kubeconfig.yaml")
        );
        assert_eq!(
            settings.system_kubeconfig_path().unwrap(),
            PathBuf::from("/kube/config")
        );
    }
}
