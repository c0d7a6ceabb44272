mod controller;
mod manager;
mod mqtt;
mod observability;
mod workers;

pub use controller::*;
pub use manager::*;
pub use mqtt::*;
pub use observability::*;
pub use workers::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
}

impl Config {
    /// Read and parse a TOML config file.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ConfigError {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.mqtt.port == 0 {
            errors.push(ConfigError::error("mqtt.port", "port must be greater than 0"));
        }

        if self.controller.base_url.is_empty() {
            errors.push(ConfigError::error("controller.base_url", "base_url must not be empty"));
        }

        if self.manager.heartbeat.pong_timeout_secs == 0 {
            errors.push(ConfigError::error(
                "manager.heartbeat.pong_timeout_secs",
                "pong timeout must be greater than 0",
            ));
        }

        if self.workers.is_empty() {
            errors.push(ConfigError::warning("workers", "no node servers configured"));
        }

        let mut ids: HashMap<&str, usize> = HashMap::new();
        let mut profiles: HashMap<u32, usize> = HashMap::new();
        for (i, worker) in self.workers.iter().enumerate() {
            if let Err(e) = pg_protocol::validate_worker_id(&worker.id) {
                errors.push(ConfigError::error(format!("workers[{i}].id"), e.to_string()));
            }
            if let Some(first) = ids.insert(&worker.id, i) {
                errors.push(ConfigError::error(
                    format!("workers[{i}].id"),
                    format!("duplicate id `{}` (also workers[{first}])", worker.id),
                ));
            }
            if let Some(profile) = worker.profile_number {
                if let Some(first) = profiles.insert(profile, i) {
                    errors.push(ConfigError::error(
                        format!("workers[{i}].profile_number"),
                        format!("profile {profile} already used by workers[{first}]"),
                    ));
                }
            }
            match (worker.interface, &worker.executable) {
                (InterfaceKind::Stdio, None) => errors.push(ConfigError::error(
                    format!("workers[{i}].executable"),
                    "stdio workers need an executable",
                )),
                (InterfaceKind::Mqtt, None) => errors.push(ConfigError::warning(
                    format!("workers[{i}].executable"),
                    "no executable; the worker must be started outside the supervisor",
                )),
                _ => {}
            }
        }

        errors
    }
}
