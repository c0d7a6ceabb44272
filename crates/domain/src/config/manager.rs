use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node server manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Root of the per-worker sandboxes and persisted configs.
    /// When unset the binary picks `~/.polyglot`.
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    /// How long a worker gets to honour `exit` before it is killed.
    #[serde(default = "d_5000")]
    pub stop_timeout_ms: u64,
    /// Upper bound on a single frame write before the transport is
    /// considered closed.
    #[serde(default = "d_5000")]
    pub send_timeout_ms: u64,
    /// Capacity of the inbound frame queue shared by all transports.
    #[serde(default = "d_1024")]
    pub inbound_queue: usize,
    /// Capacity of each session's upstream (controller) queue.
    #[serde(default = "d_256")]
    pub upstream_queue: usize,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            config_dir: None,
            stop_timeout_ms: 5000,
            send_timeout_ms: 5000,
            inbound_queue: 1024,
            upstream_queue: 256,
            heartbeat: HeartbeatConfig::default(),
            restart: RestartConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Ping/pong liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time between pings to a healthy worker.
    #[serde(default = "d_30")]
    pub interval_secs: u64,
    /// A ping unanswered for this long marks the worker stalled.
    #[serde(default = "d_30")]
    pub pong_timeout_secs: u64,
    /// A stalled worker that stays silent this long is killed.
    #[serde(default = "d_10")]
    pub kill_grace_secs: u64,
    /// A freshly started worker must speak within this window.
    #[serde(default = "d_60")]
    pub startup_timeout_secs: u64,
    /// Resolution of the deadline checks.
    #[serde(default = "d_1000")]
    pub tick_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            pong_timeout_secs: 30,
            kill_grace_secs: 10,
            startup_timeout_secs: 60,
            tick_ms: 1000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Automatic restart of crashed workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_1000")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_60000")]
    pub max_delay_ms: u64,
    /// A worker running this long has its restart backoff reset.
    #[serde(default = "d_60")]
    pub stable_after_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            stable_after_secs: 60,
        }
    }
}

impl RestartConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_secs)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_10() -> u64 {
    10
}
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_256() -> usize {
    256
}
fn d_1000() -> u64 {
    1000
}
fn d_1024() -> usize {
    1024
}
fn d_5000() -> u64 {
    5000
}
fn d_60000() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg: ManagerConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.heartbeat.pong_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(5));
        assert!(cfg.restart.enabled);
        assert!(cfg.config_dir.is_none());
    }

    #[test]
    fn heartbeat_overrides() {
        let cfg: ManagerConfig = toml::from_str(
            r#"
            [heartbeat]
            pong_timeout_secs = 5
            kill_grace_secs = 2
        "#,
        )
        .unwrap();
        assert_eq!(cfg.heartbeat.pong_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.heartbeat.kill_grace(), Duration::from_secs(2));
        assert_eq!(cfg.heartbeat.interval(), Duration::from_secs(30));
    }

    #[test]
    fn zero_tick_is_clamped() {
        let hb = HeartbeatConfig {
            tick_ms: 0,
            ..Default::default()
        };
        assert_eq!(hb.tick(), Duration::from_millis(1));
    }
}
