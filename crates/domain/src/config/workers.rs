use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker (node server) definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the supervisor exchanges frames with a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    #[default]
    Stdio,
    Mqtt,
}

impl InterfaceKind {
    /// The value workers receive as `params.interface`.
    pub fn params_name(self) -> &'static str {
        match self {
            Self::Stdio => "Default",
            Self::Mqtt => "mqtt",
        }
    }
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Mqtt => f.write_str("mqtt"),
        }
    }
}

/// One configured node server instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerDefinition {
    /// Stable id; also the node address prefix and the sandbox name.
    pub id: String,

    /// Display name (defaults to `id`).
    #[serde(default)]
    pub name: Option<String>,

    /// Program to spawn. Required for stdio workers; optional for MQTT
    /// workers that are started outside the supervisor.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub interface: InterfaceKind,

    /// Controller slot. May be assigned later by an `install` request.
    #[serde(default)]
    pub profile_number: Option<u32>,

    /// Name of the worker's own config file, passed through in `params`.
    #[serde(default)]
    pub configfile: Option<String>,

    /// Working directory override (default `<config_dir>/nodeservers/<id>`).
    #[serde(default)]
    pub sandbox: Option<PathBuf>,

    #[serde(default = "d_true")]
    pub auto_start: bool,
}

impl WorkerDefinition {
    /// Minimal stdio definition, mostly for tests and programmatic setup.
    pub fn stdio(id: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: None,
            executable: Some(executable.into()),
            args: Vec::new(),
            env: HashMap::new(),
            interface: InterfaceKind::Stdio,
            profile_number: None,
            configfile: None,
            sandbox: None,
            auto_start: true,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Directory holding the executable, reported to workers as `path`.
    pub fn install_path(&self) -> Option<PathBuf> {
        self.executable
            .as_deref()
            .and_then(|exe| exe.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
    }
}

fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_worker() {
        let def: WorkerDefinition = toml::from_str(
            r#"
            id = "hue"
            executable = "/opt/ns/hue/hue.py"
        "#,
        )
        .unwrap();
        assert_eq!(def.interface, InterfaceKind::Stdio);
        assert_eq!(def.display_name(), "hue");
        assert!(def.auto_start);
        assert_eq!(def.install_path(), Some(PathBuf::from("/opt/ns/hue")));
        assert_eq!(WorkerDefinition::stdio("x", "hue.py").install_path(), None);
    }

    #[test]
    fn interface_names() {
        assert_eq!(InterfaceKind::Stdio.params_name(), "Default");
        assert_eq!(InterfaceKind::Mqtt.params_name(), "mqtt");
        assert_eq!(InterfaceKind::Mqtt.to_string(), "mqtt");
    }
}
