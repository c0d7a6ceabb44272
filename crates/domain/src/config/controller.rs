use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Home-automation controller (ISY)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// e.g. `http://192.168.10.100:80`
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default = "d_username")]
    pub username: String,
    /// Environment variable holding the controller password.
    #[serde(default = "d_password_env")]
    pub password_env: String,
    #[serde(default = "d_25000")]
    pub timeout_ms: u64,
    /// Retries after the first failed attempt.
    #[serde(default = "d_3")]
    pub max_retries: u32,
    /// Firmware version reported to workers as `isyver`.
    #[serde(default = "d_version")]
    pub version: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            username: d_username(),
            password_env: d_password_env(),
            timeout_ms: 25_000,
            max_retries: 3,
            version: d_version(),
        }
    }
}

impl ControllerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn password(&self) -> Option<String> {
        std::env::var(&self.password_env).ok().filter(|v| !v.is_empty())
    }
}

fn d_base_url() -> String {
    "http://192.168.10.100:80".into()
}
fn d_username() -> String {
    "admin".into()
}
fn d_password_env() -> String {
    "POLYGLOT_ISY_PASSWORD".into()
}
fn d_25000() -> u64 {
    25_000
}
fn d_3() -> u32 {
    3
}
fn d_version() -> String {
    "0.0.0".into()
}
