//! Per-worker session state.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use pg_domain::config::{InterfaceKind, WorkerDefinition};
use pg_protocol::Args;

use crate::controller::Forward;
use crate::heartbeat::Heartbeat;
use crate::transport::WorkerTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of a worker session.
///
/// ```text
/// Created ──start──▶ AwaitingConfig ──first frame──▶ Running ◀──frame── Stalled
///    ▲                    │                          │  │                  │
///    │                    └───────closure────────┐   │  └──no pong──▶──────┘
///    │                                           ▼   ▼                     │
///    └──────restart────── Crashed / Stopped ◀── exit / operator stop ─── kill
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    AwaitingConfig,
    Running,
    Stalled,
    Crashed,
    Stopped,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, AwaitingConfig)
                | (AwaitingConfig, Running)
                | (Running, Stalled)
                | (Stalled, Running)
                | (AwaitingConfig | Running | Stalled, Crashed)
                | (AwaitingConfig | Running | Stalled, Stopped)
                | (Crashed | Stopped, Created)
        )
    }

    /// A transport is attached and the worker counts as up.
    pub fn is_active(self) -> bool {
        matches!(self, Self::AwaitingConfig | Self::Running | Self::Stalled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::AwaitingConfig => "awaiting_config",
            Self::Running => "running",
            Self::Stalled => "stalled",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Why a session ended up `Crashed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum CrashReason {
    /// The process or connection went away on its own.
    TransportClosed(String),
    /// The worker's MQTT last-will fired.
    WorkerDisconnected,
    /// No pong, then silence through the kill grace period.
    HeartbeatTimeout,
    /// Never spoke after being started.
    StartupTimeout,
    /// The startup frames could not be delivered.
    Bootstrap(String),
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportClosed(reason) => write!(f, "transport closed: {reason}"),
            Self::WorkerDisconnected => f.write_str("worker disconnected from broker"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::StartupTimeout => f.write_str("no frame after startup"),
            Self::Bootstrap(reason) => write!(f, "bootstrap failed: {reason}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request correlation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a controller request carrying a `request_id` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Succeeded,
    Failed,
    /// The session ended before the worker answered.
    Abandoned,
}

/// Handed back for every routed controller request. Resolves once the
/// worker answers with a matching `request` frame.
#[derive(Debug)]
pub struct RequestTicket {
    request_id: Option<String>,
    receiver: Option<oneshot::Receiver<RequestOutcome>>,
}

impl RequestTicket {
    pub(crate) fn untracked() -> Self {
        Self {
            request_id: None,
            receiver: None,
        }
    }

    pub(crate) fn tracked(request_id: String, receiver: oneshot::Receiver<RequestOutcome>) -> Self {
        Self {
            request_id: Some(request_id),
            receiver: Some(receiver),
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Wait for the worker's answer. `None` for requests without an id.
    pub async fn outcome(self) -> Option<RequestOutcome> {
        let receiver = self.receiver?;
        Some(receiver.await.unwrap_or(RequestOutcome::Abandoned))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Restart bookkeeping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
pub(crate) struct RestartTracker {
    /// Consecutive crashes without a stable run in between.
    pub attempt: u32,
    /// Total automatic restarts over the session's life.
    pub count: u32,
    pub due: Option<Instant>,
    pub running_since: Option<Instant>,
}

impl RestartTracker {
    /// Called on a crash. Resets the attempt counter when the last run
    /// stayed up for at least `stable_after`.
    pub fn crashed(&mut self, now: Instant, stable_after: Duration) {
        if let Some(since) = self.running_since.take() {
            if now.saturating_duration_since(since) >= stable_after {
                self.attempt = 0;
            }
        }
    }

    pub fn schedule(&mut self, now: Instant, delay: Duration) {
        self.due = Some(now + delay);
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due.is_some_and(|due| now >= due)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the manager tracks for one worker.
pub struct WorkerSession {
    pub(crate) definition: WorkerDefinition,
    pub(crate) sandbox: PathBuf,
    state: SessionState,
    /// Bumped on every launch; inbound events from older transports are dropped.
    pub(crate) generation: u64,
    pub(crate) transport: Option<Arc<dyn WorkerTransport>>,
    pub(crate) profile_number: Option<u32>,
    /// Latest config blob from the worker, sent back on every start.
    pub(crate) config: Args,
    /// What is known to be on disk, to skip redundant writes.
    pub(crate) persisted_config: Option<Args>,
    pub(crate) heartbeat: Heartbeat,
    /// `config`/`params` still owed to the worker because the broker was
    /// down at launch.
    pub(crate) bootstrap_pending: bool,
    pub(crate) restart: RestartTracker,
    pending: HashMap<String, oneshot::Sender<RequestOutcome>>,
    upstream: Option<(mpsc::Sender<Forward>, JoinHandle<()>)>,
    pub(crate) run_id: Option<Uuid>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) last_frame_at: Option<DateTime<Utc>>,
    pub(crate) last_pong_at: Option<DateTime<Utc>>,
    pub(crate) last_crash: Option<CrashReason>,
    pub(crate) protocol_violations: u64,
}

impl WorkerSession {
    pub(crate) fn new(definition: WorkerDefinition, sandbox: PathBuf, config: Option<Args>) -> Self {
        Self {
            profile_number: definition.profile_number,
            definition,
            sandbox,
            state: SessionState::Created,
            generation: 0,
            transport: None,
            persisted_config: config.clone(),
            config: config.unwrap_or_default(),
            heartbeat: Heartbeat::new(Instant::now()),
            bootstrap_pending: false,
            restart: RestartTracker::default(),
            pending: HashMap::new(),
            upstream: None,
            run_id: None,
            started_at: None,
            last_frame_at: None,
            last_pong_at: None,
            last_crash: None,
            protocol_violations: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a transition, refusing (and logging) illegal ones.
    pub(crate) fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                worker_id = %self.definition.id,
                from = %self.state,
                to = %next,
                "illegal session transition refused"
            );
            return false;
        }
        tracing::info!(
            worker_id = %self.definition.id,
            from = %self.state,
            to = %next,
            "session state changed"
        );
        self.state = next;
        true
    }

    /// Register a waiter for `request_id`. A waiter already registered
    /// under the same id is abandoned.
    pub(crate) fn track_request(&mut self, request_id: String) -> RequestTicket {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.insert(request_id.clone(), tx) {
            let _ = previous.send(RequestOutcome::Abandoned);
        }
        RequestTicket::tracked(request_id, rx)
    }

    pub(crate) fn resolve_request(&mut self, request_id: &str, success: bool) -> bool {
        let Some(waiter) = self.pending.remove(request_id) else {
            return false;
        };
        let outcome = if success {
            RequestOutcome::Succeeded
        } else {
            RequestOutcome::Failed
        };
        let _ = waiter.send(outcome);
        true
    }

    /// Abandon every outstanding request; returns how many there were.
    pub(crate) fn abandon_requests(&mut self) -> usize {
        let count = self.pending.len();
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(RequestOutcome::Abandoned);
        }
        count
    }

    pub(crate) fn attach_forwarder(&mut self, sender: mpsc::Sender<Forward>, task: JoinHandle<()>) {
        self.upstream = Some((sender, task));
    }

    /// Queue a report for the controller without waiting on it.
    pub(crate) fn forward(&self, report: pg_protocol::UpstreamReport) {
        let Some((sender, _)) = &self.upstream else {
            return;
        };
        let command = report.command();
        let reply_to = report.seq().and(self.transport.clone());
        let forward = Forward {
            profile_number: self.profile_number,
            report,
            reply_to,
        };
        if let Err(e) = sender.try_send(forward) {
            tracing::error!(
                worker_id = %self.definition.id,
                command,
                error = %e,
                "upstream queue unavailable, report dropped"
            );
        }
    }

    /// Close the upstream queue and hand back the forwarder so the caller
    /// can wait for it to drain.
    pub(crate) fn detach_forwarder(&mut self) -> Option<JoinHandle<()>> {
        self.upstream.take().map(|(_, task)| task)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.definition.id.clone(),
            name: self.definition.display_name().to_string(),
            interface: self.definition.interface,
            state: self.state,
            profile_number: self.profile_number,
            pid: self.transport.as_ref().and_then(|t| t.pid()),
            generation: self.generation,
            run_id: self.run_id,
            started_at: self.started_at,
            last_frame_at: self.last_frame_at,
            last_pong_at: self.last_pong_at,
            restarts: self.restart.count,
            pending_requests: self.pending.len(),
            protocol_violations: self.protocol_violations,
            last_crash: self.last_crash.clone(),
            sandbox: self.sandbox.clone(),
        }
    }
}

/// Read-only snapshot of a session for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub interface: InterfaceKind,
    pub state: SessionState,
    pub profile_number: Option<u32>,
    pub pid: Option<u32>,
    pub generation: u64,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub restarts: u32,
    pub pending_requests: usize,
    pub protocol_violations: u64,
    pub last_crash: Option<CrashReason>,
    pub sandbox: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn legal_transitions() {
        assert!(Created.can_transition_to(AwaitingConfig));
        assert!(AwaitingConfig.can_transition_to(Running));
        assert!(Running.can_transition_to(Stalled));
        assert!(Stalled.can_transition_to(Running));
        assert!(Stalled.can_transition_to(Crashed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Crashed.can_transition_to(Created));
        assert!(Stopped.can_transition_to(Created));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!Created.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Crashed.can_transition_to(Stopped));
        assert!(!Created.can_transition_to(Crashed));
        assert!(!Running.can_transition_to(Created));
    }

    #[test]
    fn refused_transition_keeps_state() {
        let mut s = WorkerSession::new(WorkerDefinition::stdio("hue", "/bin/true"), "/tmp/hue".into(), None);
        assert!(!s.transition(Running));
        assert_eq!(s.state(), Created);
        assert!(s.transition(AwaitingConfig));
        assert_eq!(s.state(), AwaitingConfig);
    }

    #[tokio::test]
    async fn requests_resolve_once() {
        let mut s = WorkerSession::new(WorkerDefinition::stdio("hue", "/bin/true"), "/tmp/hue".into(), None);
        let ticket = s.track_request("7".into());
        assert!(s.resolve_request("7", true));
        assert!(!s.resolve_request("7", false));
        assert_eq!(ticket.outcome().await, Some(RequestOutcome::Succeeded));
    }

    #[tokio::test]
    async fn abandoned_requests() {
        let mut s = WorkerSession::new(WorkerDefinition::stdio("hue", "/bin/true"), "/tmp/hue".into(), None);
        let first = s.track_request("1".into());
        let replaced = s.track_request("1".into());
        assert_eq!(first.outcome().await, Some(RequestOutcome::Abandoned));
        assert_eq!(s.abandon_requests(), 1);
        assert_eq!(replaced.outcome().await, Some(RequestOutcome::Abandoned));
        assert_eq!(RequestTicket::untracked().outcome().await, None);
    }

    #[test]
    fn restart_attempts_reset_after_stable_run() {
        let t0 = Instant::now();
        let stable = Duration::from_secs(60);
        let mut r = RestartTracker::default();
        r.schedule(t0, Duration::from_secs(1));
        r.schedule(t0, Duration::from_secs(2));
        assert_eq!(r.attempt, 2);

        r.running_since = Some(t0);
        r.crashed(t0 + Duration::from_secs(10), stable);
        assert_eq!(r.attempt, 2);

        r.running_since = Some(t0);
        r.crashed(t0 + Duration::from_secs(61), stable);
        assert_eq!(r.attempt, 0);
        assert!(!r.is_due(t0));
    }

    #[test]
    fn snapshot_serializes() {
        let s = WorkerSession::new(WorkerDefinition::stdio("hue", "/bin/true"), "/tmp/hue".into(), None);
        let json = serde_json::to_value(s.info()).unwrap();
        assert_eq!(json["state"], "created");
        assert_eq!(json["interface"], "stdio");
        assert_eq!(json["restarts"], 0);
    }
}
