//! Retry pacing for crashed workers and for the broker connection.

use std::time::Duration;

use pg_domain::config::{MqttConfig, RestartConfig};

/// Doubling delay from `base` up to `cap`. Retries after the first are
/// pushed back by up to a quarter so that workers that crashed together
/// come back spread out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn restart(cfg: &RestartConfig) -> Self {
        Self {
            base: cfg.initial_delay(),
            cap: cfg.max_delay(),
        }
    }

    pub fn reconnect(cfg: &MqttConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.reconnect_initial_ms),
            cap: Duration::from_millis(cfg.reconnect_max_ms),
        }
    }

    /// Wait before retry `attempt` (the first retry is attempt 0 and waits
    /// exactly `base`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        if attempt == 0 {
            return delay;
        }
        delay.saturating_add((delay / 4).saturating_mul(spread(attempt)) / 255)
    }
}

/// 0..=255, scrambled so neighbouring attempts land far apart.
fn spread(attempt: u32) -> u32 {
    attempt.wrapping_mul(0x9E37_79B9) >> 24
}
