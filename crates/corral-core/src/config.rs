//! Daemon configuration file model.
//!
//! One typed file per daemon, YAML or JSON by extension. Unset options
//! fall back to the defaults below; a file that fails to parse is a
//! configuration error the daemon turns into exit code 2.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read config {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {0}: {1}")]
    Parse(PathBuf, String),
}

/// Alerts aggregator options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_alerts_send_period")]
    pub send_period_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { send_period_secs: default_alerts_send_period() }
    }
}

/// Monitoring aggregator options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_send_period")]
    pub send_period_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { send_period_secs: default_monitoring_send_period() }
    }
}

/// Image store options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Percent of the backing partition the image store may consume
    /// (0 = no dedicated quota).
    #[serde(default)]
    pub partition_limit_percent: u8,
    #[serde(default = "default_install_workers")]
    pub install_workers: usize,
    #[serde(default = "default_remove_outdated_period")]
    pub remove_outdated_period_secs: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            partition_limit_percent: 0,
            install_workers: default_install_workers(),
            remove_outdated_period_secs: default_remove_outdated_period(),
        }
    }
}

/// Launcher options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// How long an environment-variable override stays active.
    #[serde(default = "default_instance_ttl")]
    pub instance_ttl_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self { instance_ttl_secs: default_instance_ttl() }
    }
}

/// Top-level CM daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmConfig {
    pub work_dir: PathBuf,
    pub storage_dir: PathBuf,
    /// SM heartbeat freshness window.
    #[serde(default = "default_nodes_connection_timeout")]
    pub nodes_connection_timeout_secs: u64,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    /// Install updates without waiting for cloud confirmation.
    #[serde(default)]
    pub auto_install: bool,
}

impl CmConfig {
    /// Load a config file, YAML for `.yaml`/`.yml`, JSON otherwise.
    pub fn from_file(path: &Path) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigFileError::Io(path.to_path_buf(), e))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| ConfigFileError::Parse(path.to_path_buf(), e.to_string()))
        } else {
            serde_json::from_str(&content)
                .map_err(|e| ConfigFileError::Parse(path.to_path_buf(), e.to_string()))
        }
    }

    /// Path of the persisted unit config.
    pub fn unit_config_file(&self) -> PathBuf {
        self.work_dir.join("unit_config.json")
    }

    /// Path of the state database (node rows, placements, update state).
    pub fn database_file(&self) -> PathBuf {
        self.work_dir.join("nodes.db")
    }
}

fn default_alerts_send_period() -> u64 {
    10
}

fn default_monitoring_send_period() -> u64 {
    60
}

fn default_nodes_connection_timeout() -> u64 {
    30
}

fn default_install_workers() -> usize {
    crate::limits::INSTALL_WORKERS
}

fn default_remove_outdated_period() -> u64 {
    24 * 60 * 60
}

fn default_instance_ttl() -> u64 {
    60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm.json");
        std::fs::write(&path, r#"{"work_dir": "/var/corral", "storage_dir": "/srv/corral"}"#)
            .unwrap();

        let config = CmConfig::from_file(&path).unwrap();
        assert_eq!(config.nodes_connection_timeout_secs, 30);
        assert_eq!(config.alerts.send_period_secs, 10);
        assert_eq!(config.monitoring.send_period_secs, 60);
        assert_eq!(config.images.install_workers, 5);
        assert!(!config.auto_install);
        assert_eq!(config.unit_config_file(), PathBuf::from("/var/corral/unit_config.json"));
    }

    #[test]
    fn yaml_is_accepted_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm.yaml");
        std::fs::write(
            &path,
            "work_dir: /var/corral\nstorage_dir: /srv/corral\nnodes_connection_timeout_secs: 5\n",
        )
        .unwrap();

        let config = CmConfig::from_file(&path).unwrap();
        assert_eq!(config.nodes_connection_timeout_secs, 5);
    }

    #[test]
    fn parse_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cm.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(CmConfig::from_file(&path), Err(ConfigFileError::Parse(_, _))));
    }
}
