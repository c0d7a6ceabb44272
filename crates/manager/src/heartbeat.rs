//! Liveness deadlines for one session.
//!
//! The tracker only does arithmetic on instants; the manager's tick feeds it
//! the current time and state and carries out whatever it asks for. Keeping
//! it pure makes the timing rules testable without a runtime.

use std::time::Duration;

use tokio::time::Instant;

use pg_domain::config::HeartbeatConfig;

use crate::session::SessionState;

/// What the manager should do for a session on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Idle,
    SendPing,
    /// A ping went unanswered for the pong timeout.
    MarkStalled,
    /// A stalled worker stayed silent through the kill grace period.
    Kill,
    /// The worker never spoke after being started.
    StartupTimeout,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    started_at: Instant,
    last_ping_at: Option<Instant>,
    /// Send time of the oldest unanswered ping.
    outstanding_since: Option<Instant>,
    stalled_at: Option<Instant>,
}

impl Heartbeat {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            last_ping_at: None,
            outstanding_since: None,
            stalled_at: None,
        }
    }

    pub fn evaluate(&self, state: SessionState, now: Instant, cfg: &HeartbeatConfig) -> HeartbeatAction {
        match state {
            SessionState::AwaitingConfig => {
                if elapsed(self.started_at, now) >= cfg.startup_timeout() {
                    HeartbeatAction::StartupTimeout
                } else {
                    HeartbeatAction::Idle
                }
            }
            SessionState::Running => {
                if let Some(sent) = self.outstanding_since {
                    if elapsed(sent, now) >= cfg.pong_timeout() {
                        return HeartbeatAction::MarkStalled;
                    }
                }
                let ping_due = self
                    .last_ping_at
                    .map_or(true, |last| elapsed(last, now) >= cfg.interval());
                if ping_due {
                    HeartbeatAction::SendPing
                } else {
                    HeartbeatAction::Idle
                }
            }
            SessionState::Stalled => match self.stalled_at {
                Some(at) if elapsed(at, now) >= cfg.kill_grace() => HeartbeatAction::Kill,
                _ => HeartbeatAction::Idle,
            },
            SessionState::Created | SessionState::Crashed | SessionState::Stopped => HeartbeatAction::Idle,
        }
    }

    pub fn ping_sent(&mut self, now: Instant) {
        self.last_ping_at = Some(now);
        self.outstanding_since.get_or_insert(now);
    }

    pub fn pong_received(&mut self) {
        self.outstanding_since = None;
    }

    pub fn stalled(&mut self, now: Instant) {
        self.stalled_at = Some(now);
    }

    /// The worker spoke again while stalled.
    pub fn recovered(&mut self) {
        self.outstanding_since = None;
        self.stalled_at = None;
    }

    /// Forget outstanding pings, e.g. while the broker is unreachable and
    /// no pong could possibly arrive.
    pub fn suspend(&mut self, now: Instant) {
        self.outstanding_since = None;
        self.stalled_at = None;
        self.last_ping_at = Some(now);
    }
}

fn elapsed(since: Instant, now: Instant) -> Duration {
    now.saturating_duration_since(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_secs: 30,
            pong_timeout_secs: 30,
            kill_grace_secs: 10,
            startup_timeout_secs: 60,
            tick_ms: 1000,
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn first_ping_is_immediate_then_on_interval() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(t0);
        assert_eq!(hb.evaluate(SessionState::Running, t0, &cfg()), HeartbeatAction::SendPing);
        hb.ping_sent(t0);
        hb.pong_received();
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(29), &cfg()), HeartbeatAction::Idle);
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(30), &cfg()), HeartbeatAction::SendPing);
    }

    #[test]
    fn unanswered_ping_stalls_then_kills() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(t0);
        hb.ping_sent(t0);
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(29), &cfg()), HeartbeatAction::Idle);
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(30), &cfg()), HeartbeatAction::MarkStalled);

        hb.stalled(t0 + secs(30));
        assert_eq!(hb.evaluate(SessionState::Stalled, t0 + secs(39), &cfg()), HeartbeatAction::Idle);
        assert_eq!(hb.evaluate(SessionState::Stalled, t0 + secs(40), &cfg()), HeartbeatAction::Kill);
    }

    #[test]
    fn later_pings_do_not_extend_the_deadline() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(t0);
        hb.ping_sent(t0);
        hb.ping_sent(t0 + secs(20));
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(30), &cfg()), HeartbeatAction::MarkStalled);
    }

    #[test]
    fn recovery_clears_stall() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(t0);
        hb.ping_sent(t0);
        hb.stalled(t0 + secs(30));
        hb.recovered();
        assert_eq!(hb.evaluate(SessionState::Stalled, t0 + secs(60), &cfg()), HeartbeatAction::Idle);
        // The unanswered ping is forgotten; the next one is simply due.
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(60), &cfg()), HeartbeatAction::SendPing);
    }

    #[test]
    fn startup_window() {
        let t0 = Instant::now();
        let hb = Heartbeat::new(t0);
        assert_eq!(hb.evaluate(SessionState::AwaitingConfig, t0 + secs(59), &cfg()), HeartbeatAction::Idle);
        assert_eq!(
            hb.evaluate(SessionState::AwaitingConfig, t0 + secs(60), &cfg()),
            HeartbeatAction::StartupTimeout
        );
    }

    #[test]
    fn suspend_restarts_the_cycle() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(t0);
        hb.ping_sent(t0);
        hb.suspend(t0 + secs(25));
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(40), &cfg()), HeartbeatAction::Idle);
        assert_eq!(hb.evaluate(SessionState::Running, t0 + secs(55), &cfg()), HeartbeatAction::SendPing);
    }

    #[test]
    fn inactive_states_are_idle() {
        let t0 = Instant::now();
        let hb = Heartbeat::new(t0);
        for state in [SessionState::Created, SessionState::Crashed, SessionState::Stopped] {
            assert_eq!(hb.evaluate(state, t0 + secs(3600), &cfg()), HeartbeatAction::Idle);
        }
    }
}
