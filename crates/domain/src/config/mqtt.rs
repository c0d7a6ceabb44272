use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MQTT broker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Broker shared by every worker whose interface is `mqtt`.
///
/// The host and port are also handed to those workers in their `params`
/// frame so both sides meet at the same broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_1883")]
    pub port: u16,
    #[serde(default = "d_client_id")]
    pub client_id: String,
    #[serde(default = "d_10")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub username: Option<String>,
    /// Environment variable holding the broker password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "d_1000")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "d_30000")]
    pub reconnect_max_ms: u64,
    /// Capacity of the client's request queue.
    #[serde(default = "d_64")]
    pub request_queue: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 1883,
            client_id: d_client_id(),
            keep_alive_secs: 10,
            username: None,
            password_env: None,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            request_queue: 64,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }

    /// Resolve the password from the configured environment variable.
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

fn d_host() -> String {
    "localhost".into()
}
fn d_client_id() -> String {
    "polyglot".into()
}
fn d_1883() -> u16 {
    1883
}
fn d_10() -> u64 {
    10
}
fn d_64() -> usize {
    64
}
fn d_1000() -> u64 {
    1000
}
fn d_30000() -> u64 {
    30_000
}
