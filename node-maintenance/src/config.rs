// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with node maintenance configuration

use camino::{Utf8Path, Utf8PathBuf};
use hci_utils::cluster::FailbackMode;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for node maintenance.
///
/// Every field has a default, so an empty file (or no file at all) is a
/// valid configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Overrides the local cluster node name, which otherwise comes from
    /// the `COMPUTERNAME` environment variable.
    pub node_name: Option<String>,
    pub log: LogConfig,
    pub continuation: ContinuationConfig,
    pub drain: DrainConfig,
    pub maintenance: MaintenanceConfig,
    pub restart: RestartConfig,
    pub host: HostConfig,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for slog::FilterLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => slog::FilterLevel::Trace,
            LogLevel::Debug => slog::FilterLevel::Debug,
            LogLevel::Info => slog::FilterLevel::Info,
            LogLevel::Warn => slog::FilterLevel::Warning,
            LogLevel::Error => slog::FilterLevel::Error,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// The event log. Opened for append; never truncated.
    pub path: Utf8PathBuf,
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: Utf8PathBuf::from(
                r"C:\ProgramData\NodeMaintenance\node-maintenance.log",
            ),
            level: LogLevel::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContinuationConfig {
    /// The name of the startup task that resumes the node after a restart.
    pub task_name: String,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self { task_name: "NodeMaintenancePostReboot".to_string() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrainConfig {
    /// Ceiling on moving a single shared volume.
    pub move_timeout_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self { move_timeout_secs: 300 }
    }
}

impl DrainConfig {
    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    pub failback: FailbackMode,
    pub suspend_timeout_secs: u64,
    pub resume_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            failback: FailbackMode::Immediate,
            suspend_timeout_secs: 1800,
            resume_timeout_secs: 600,
            poll_interval_secs: 5,
        }
    }
}

impl MaintenanceConfig {
    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_secs(self.suspend_timeout_secs)
    }

    pub fn resume_timeout(&self) -> Duration {
        Duration::from_secs(self.resume_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartConfig {
    /// Delay between scheduling a restart and the restart itself, so that
    /// the event log is flushed first.
    pub grace_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self { grace_secs: 30 }
    }
}

impl RestartConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    pub powershell: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { powershell: hci_utils::POWERSHELL.to_string() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid config in {path}: {field} must be greater than zero")]
    Zero { path: Utf8PathBuf, field: &'static str },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        if let Some(field) = config.first_zero_duration() {
            return Err(ConfigError::Zero { path: path.into(), field });
        }
        Ok(config)
    }

    /// Timeouts and the poll interval must be positive; a zero poll interval
    /// would query the cluster in a tight loop.
    fn first_zero_duration(&self) -> Option<&'static str> {
        [
            ("drain.move_timeout_secs", self.drain.move_timeout_secs),
            (
                "maintenance.suspend_timeout_secs",
                self.maintenance.suspend_timeout_secs,
            ),
            (
                "maintenance.resume_timeout_secs",
                self.maintenance.resume_timeout_secs,
            ),
            (
                "maintenance.poll_interval_secs",
                self.maintenance.poll_interval_secs,
            ),
        ]
        .into_iter()
        .find(|(_, secs)| *secs == 0)
        .map(|(field, _)| field)
    }
}
