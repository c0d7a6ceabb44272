//! The manager loop.
//!
//! One task owns every [`WorkerSession`] and processes, one at a time:
//! operator commands from [`ManagerHandle`]s, inbound events from all
//! transports, and a periodic tick that drives heartbeats and restarts.
//! Nothing else touches session state, so no locks are needed around it.
//! Slow work (stopping processes, talking to the controller) runs on
//! spawned tasks and never blocks the loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use pg_domain::config::{InterfaceKind, ManagerConfig, MqttConfig, WorkerDefinition};
use pg_protocol::{
    config_frame, AddressError, Args, ControllerRequest, Frame, FrameError, Params, UpstreamReport, WorkerMessage,
    API_VERSION,
};

use crate::backoff::Backoff;
use crate::controller::{spawn_forwarder, Controller};
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::session::{CrashReason, RequestTicket, SessionInfo, SessionState, WorkerSession};
use crate::store::{ConfigStore, StoreError};
use crate::transport::{EventSink, InboundEvent, InboundKind, LaunchSpec, Launcher, TransportError, WorkerTransport};

const COMMAND_QUEUE: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker `{id}` is unavailable (state: {state})")]
    WorkerUnavailable { id: String, state: SessionState },

    #[error("worker `{id}` is already active (state: {state})")]
    AlreadyActive { id: String, state: SessionState },

    #[error("invalid worker definition: {0}")]
    InvalidDefinition(String),

    #[error("worker `{id}` is bound to profile {current}")]
    ProfileLocked { id: String, current: u32 },

    #[error("failed to start worker `{id}`: {source}")]
    Spawn {
        id: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("manager has shut down")]
    Closed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

enum Command {
    Add { definition: WorkerDefinition, reply: Reply<()> },
    Remove { id: String, reply: Reply<()> },
    Start { id: String, reply: Reply<()> },
    Stop { id: String, reply: Reply<()> },
    Restart { id: String, reply: Reply<()> },
    /// Second half of a restart, sent by the task that stopped the old process.
    Relaunch { id: String, reply: Reply<()> },
    Request { id: String, request: ControllerRequest, reply: Reply<RequestTicket> },
    Snapshot { reply: oneshot::Sender<Vec<SessionInfo>> },
    Session { id: String, reply: oneshot::Sender<Option<SessionInfo>> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable front door to a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| ManagerError::Closed)?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    /// Register a worker and, if its definition says so, start it.
    pub async fn add_worker(&self, definition: WorkerDefinition) -> Result<(), ManagerError> {
        self.call(|reply| Command::Add { definition, reply }).await?
    }

    /// Stop a worker and forget it. Its persisted config stays on disk.
    pub async fn remove_worker(&self, id: &str) -> Result<(), ManagerError> {
        let id = id.to_string();
        self.call(|reply| Command::Remove { id, reply }).await?
    }

    pub async fn start(&self, id: &str) -> Result<(), ManagerError> {
        let id = id.to_string();
        self.call(|reply| Command::Start { id, reply }).await?
    }

    /// Resolves once the worker's process is gone.
    pub async fn stop(&self, id: &str) -> Result<(), ManagerError> {
        let id = id.to_string();
        self.call(|reply| Command::Stop { id, reply }).await?
    }

    pub async fn restart(&self, id: &str) -> Result<(), ManagerError> {
        let id = id.to_string();
        self.call(|reply| Command::Restart { id, reply }).await?
    }

    /// Route a controller request (global addresses) to a worker.
    pub async fn request(&self, id: &str, request: ControllerRequest) -> Result<RequestTicket, ManagerError> {
        let id = id.to_string();
        self.call(|reply| Command::Request { id, request, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Vec<SessionInfo>, ManagerError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn session(&self, id: &str) -> Result<Option<SessionInfo>, ManagerError> {
        let id = id.to_string();
        self.call(|reply| Command::Session { id, reply }).await
    }

    /// Stop every worker, close shared connections, and end the loop.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Facts about the supervisor's surroundings that workers receive in
/// their `params` frame.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub controller_version: String,
    pub supervisor_version: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
}

impl RuntimeInfo {
    pub fn new(controller_version: impl Into<String>, mqtt: &MqttConfig) -> Self {
        Self {
            controller_version: controller_version.into(),
            supervisor_version: env!("CARGO_PKG_VERSION").to_string(),
            mqtt_host: mqtt.host.clone(),
            mqtt_port: mqtt.port,
        }
    }
}

pub struct ManagerBuilder {
    config: ManagerConfig,
    runtime: RuntimeInfo,
    sandbox_root: PathBuf,
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn ConfigStore>,
    controller: Arc<dyn Controller>,
}

impl ManagerBuilder {
    pub fn runtime(mut self, runtime: RuntimeInfo) -> Self {
        self.runtime = runtime;
        self
    }

    /// Parent of the per-worker sandboxes (`<root>/<id>`).
    pub fn sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sandbox_root = root.into();
        self
    }

    /// Spawn the loop. The returned join handle finishes after shutdown.
    pub fn spawn(self) -> (ManagerHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(self.config.inbound_queue.max(1));
        let manager = Manager {
            restart_backoff: Backoff::restart(&self.config.restart),
            config: self.config,
            runtime: self.runtime,
            sandbox_root: self.sandbox_root,
            launcher: self.launcher,
            store: self.store,
            controller: self.controller,
            sessions: BTreeMap::new(),
            commands,
            loopback: tx.downgrade(),
            events_tx,
            events_rx,
            background: JoinSet::new(),
        };
        let task = tokio::spawn(manager.run());
        (ManagerHandle { tx }, task)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Manager {
    config: ManagerConfig,
    runtime: RuntimeInfo,
    sandbox_root: PathBuf,
    launcher: Arc<dyn Launcher>,
    store: Arc<dyn ConfigStore>,
    controller: Arc<dyn Controller>,
    restart_backoff: Backoff,
    sessions: BTreeMap<String, WorkerSession>,
    commands: mpsc::Receiver<Command>,
    /// Weak so that dropping every handle still ends the loop.
    loopback: mpsc::WeakSender<Command>,
    events_tx: EventSink,
    events_rx: mpsc::Receiver<InboundEvent>,
    background: JoinSet<()>,
}

impl Manager {
    pub fn builder(
        config: ManagerConfig,
        launcher: Arc<dyn Launcher>,
        store: Arc<dyn ConfigStore>,
        controller: Arc<dyn Controller>,
    ) -> ManagerBuilder {
        let sandbox_root = config
            .config_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nodeservers");
        ManagerBuilder {
            config,
            runtime: RuntimeInfo::new("0.0.0", &MqttConfig::default()),
            sandbox_root,
            launcher,
            store,
            controller,
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.heartbeat.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!("all manager handles dropped");
                        self.shutdown().await;
                        return;
                    };
                    if let Some(reply) = self.handle_command(command).await {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = tick.tick() => self.on_tick(Instant::now()).await,
            }
        }
    }

    /// Returns the reply channel when the command asks for shutdown.
    async fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Add { definition, reply } => {
                let _ = reply.send(self.add_worker(definition).await);
            }
            Command::Remove { id, reply } => self.remove_worker(&id, reply),
            Command::Start { id, reply } => {
                let _ = reply.send(self.launch(&id).await);
            }
            Command::Stop { id, reply } => self.stop_worker(&id, reply),
            Command::Restart { id, reply } => self.restart_worker(&id, reply).await,
            Command::Relaunch { id, reply } => {
                let _ = reply.send(self.launch(&id).await);
            }
            Command::Request { id, request, reply } => {
                let _ = reply.send(self.route_request(&id, request).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.sessions.values().map(WorkerSession::info).collect());
            }
            Command::Session { id, reply } => {
                let _ = reply.send(self.sessions.get(&id).map(WorkerSession::info));
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    // ── registration ────────────────────────────────────────────────

    async fn add_worker(&mut self, definition: WorkerDefinition) -> Result<(), ManagerError> {
        self.validate_definition(&definition)?;

        let config = self.store.load(&definition.id).await?;
        let sandbox = definition
            .sandbox
            .clone()
            .unwrap_or_else(|| self.sandbox_root.join(&definition.id));
        let id = definition.id.clone();
        let auto_start = definition.auto_start;

        let mut session = WorkerSession::new(definition, sandbox, config);
        let (upstream, forwarder) = spawn_forwarder(id.clone(), self.controller.clone(), self.config.upstream_queue);
        session.attach_forwarder(upstream, forwarder);
        tracing::info!(
            worker_id = %id,
            interface = %session.definition.interface,
            sandbox = %session.sandbox.display(),
            "worker registered"
        );
        self.sessions.insert(id.clone(), session);

        if auto_start {
            self.launch(&id).await?;
        }
        Ok(())
    }

    fn validate_definition(&self, def: &WorkerDefinition) -> Result<(), ManagerError> {
        pg_protocol::validate_worker_id(&def.id).map_err(|e| ManagerError::InvalidDefinition(e.to_string()))?;
        if self.sessions.contains_key(&def.id) {
            return Err(ManagerError::InvalidDefinition(format!("worker `{}` already exists", def.id)));
        }
        if let Some(profile) = def.profile_number {
            if let Some(owner) = self.profile_owner(profile, &def.id) {
                return Err(ManagerError::InvalidDefinition(format!(
                    "profile {profile} already belongs to `{owner}`"
                )));
            }
        }
        if def.interface == InterfaceKind::Stdio && def.executable.is_none() {
            return Err(ManagerError::InvalidDefinition(format!(
                "stdio worker `{}` needs an executable",
                def.id
            )));
        }
        Ok(())
    }

    fn profile_owner(&self, profile: u32, except: &str) -> Option<String> {
        self.sessions
            .values()
            .find(|s| s.id() != except && s.profile_number == Some(profile))
            .map(|s| s.id().to_string())
    }

    fn remove_worker(&mut self, id: &str, reply: Reply<()>) {
        let Some(mut session) = self.sessions.remove(id) else {
            let _ = reply.send(Err(ManagerError::WorkerNotFound(id.to_string())));
            return;
        };
        tracing::info!(worker_id = %id, "removing worker");
        session.restart.cancel();
        let transport = deactivate(&mut session);
        let forwarder = session.detach_forwarder();
        drop(session);

        let launcher = self.launcher.clone();
        let timeout = self.config.stop_timeout();
        let id = id.to_string();
        self.background.spawn(async move {
            let result = match transport {
                Some(transport) => transport.stop(timeout).await.map_err(ManagerError::from),
                None => Ok(()),
            };
            launcher.release(&id).await;
            if let Some(forwarder) = forwarder {
                let _ = forwarder.await;
            }
            let _ = reply.send(result);
        });
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Start a session that is `Created`, `Crashed` or `Stopped`: launch the
    /// transport, then send `config` followed by `params`.
    async fn launch(&mut self, id: &str) -> Result<(), ManagerError> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| ManagerError::WorkerNotFound(id.to_string()))?;
        match session.state() {
            SessionState::Created => {}
            SessionState::Crashed | SessionState::Stopped => {
                session.transition(SessionState::Created);
            }
            state => {
                return Err(ManagerError::AlreadyActive {
                    id: id.to_string(),
                    state,
                })
            }
        }
        session.restart.cancel();
        session.generation += 1;

        let frames = bootstrap_frames(&self.runtime, session)?;
        let spec = LaunchSpec {
            definition: session.definition.clone(),
            sandbox: session.sandbox.clone(),
            generation: session.generation,
        };
        let transport = match self.launcher.launch(spec, self.events_tx.clone()).await {
            Ok(transport) => transport,
            Err(source) => {
                tracing::error!(worker_id = %id, error = %source, "failed to start worker");
                return Err(ManagerError::Spawn {
                    id: id.to_string(),
                    source,
                });
            }
        };

        session.transport = Some(transport.clone());
        session.transition(SessionState::AwaitingConfig);
        session.heartbeat = Heartbeat::new(Instant::now());
        session.bootstrap_pending = false;
        session.run_id = Some(Uuid::new_v4());
        session.started_at = Some(Utc::now());
        session.last_pong_at = None;

        if let Err(e) = transport.bootstrap(&frames).await {
            if e.is_closed() && transport.closure_is_transient() {
                tracing::warn!(worker_id = %id, error = %e, "broker unavailable, startup frames deferred");
                session.bootstrap_pending = true;
                return Ok(());
            }
            tracing::error!(worker_id = %id, error = %e, "failed to deliver startup frames");
            self.crash(id, CrashReason::Bootstrap(e.to_string()));
            return Err(ManagerError::Transport(e));
        }
        tracing::debug!(worker_id = %id, "config and params delivered");
        Ok(())
    }

    fn stop_worker(&mut self, id: &str, reply: Reply<()>) {
        let Some(session) = self.sessions.get_mut(id) else {
            let _ = reply.send(Err(ManagerError::WorkerNotFound(id.to_string())));
            return;
        };
        session.restart.cancel();
        let Some(transport) = deactivate(session) else {
            let _ = reply.send(Ok(()));
            return;
        };
        let timeout = self.config.stop_timeout();
        self.background.spawn(async move {
            let _ = reply.send(transport.stop(timeout).await.map_err(ManagerError::from));
        });
    }

    async fn restart_worker(&mut self, id: &str, reply: Reply<()>) {
        let Some(session) = self.sessions.get_mut(id) else {
            let _ = reply.send(Err(ManagerError::WorkerNotFound(id.to_string())));
            return;
        };
        session.restart.cancel();
        let Some(transport) = deactivate(session) else {
            let _ = reply.send(self.launch(id).await);
            return;
        };

        let timeout = self.config.stop_timeout();
        let loopback = self.loopback.clone();
        let id = id.to_string();
        self.background.spawn(async move {
            if let Err(e) = transport.stop(timeout).await {
                tracing::warn!(worker_id = %id, error = %e, "error stopping worker for restart");
            }
            match loopback.upgrade() {
                Some(tx) => {
                    let _ = tx.send(Command::Relaunch { id, reply }).await;
                }
                None => {
                    let _ = reply.send(Err(ManagerError::Closed));
                }
            }
        });
    }

    /// Mark a session crashed, release its transport, and schedule an
    /// automatic restart when enabled.
    fn crash(&mut self, id: &str, reason: CrashReason) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if !session.transition(SessionState::Crashed) {
            return;
        }
        tracing::error!(worker_id = %id, reason = %reason, "worker crashed");
        let abandoned = session.abandon_requests();
        if abandoned > 0 {
            tracing::warn!(worker_id = %id, abandoned, "pending controller requests abandoned");
        }
        session.last_crash = Some(reason);
        if let Some(transport) = session.transport.take() {
            self.background.spawn(async move { transport.kill().await });
        }

        let now = Instant::now();
        session.restart.crashed(now, self.config.restart.stable_after());
        if self.config.restart.enabled {
            schedule_restart(session, &self.restart_backoff, now);
        }
    }

    fn worker_exited(&mut self, id: &str) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        tracing::info!(worker_id = %id, "worker requested exit");
        session.restart.cancel();
        let Some(transport) = deactivate(session) else {
            return;
        };
        let timeout = self.config.stop_timeout();
        let id = id.to_string();
        self.background.spawn(async move {
            if let Err(e) = transport.stop(timeout).await {
                tracing::warn!(worker_id = %id, error = %e, "error reaping exited worker");
            }
        });
    }

    // ── inbound ─────────────────────────────────────────────────────

    async fn handle_event(&mut self, event: InboundEvent) {
        let InboundEvent {
            worker_id,
            generation,
            kind,
        } = event;
        let Some(session) = self.sessions.get_mut(&worker_id) else {
            tracing::debug!(worker_id = %worker_id, "event for unknown worker dropped");
            return;
        };
        if generation != session.generation {
            tracing::debug!(
                worker_id = %worker_id,
                generation,
                current = session.generation,
                "event from a replaced transport dropped"
            );
            return;
        }

        match kind {
            InboundKind::Frame(frame) => self.handle_frame(&worker_id, frame).await,
            InboundKind::Malformed { raw, error } => {
                session.protocol_violations += 1;
                tracing::warn!(worker_id = %worker_id, %error, raw = %raw, "protocol violation: malformed frame dropped");
            }
            InboundKind::Closed { reason } => {
                if session.state().is_active() {
                    self.crash(&worker_id, CrashReason::TransportClosed(reason));
                } else {
                    tracing::debug!(worker_id = %worker_id, %reason, "transport closed");
                }
            }
        }
    }

    async fn handle_frame(&mut self, id: &str, frame: Frame) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if !session.state().is_active() {
            tracing::debug!(
                worker_id = %id,
                command = %frame.command,
                state = %session.state(),
                "frame from inactive session ignored"
            );
            return;
        }

        let message = match WorkerMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                session.protocol_violations += 1;
                tracing::warn!(worker_id = %id, error = %e, "protocol violation: frame dropped");
                return;
            }
        };

        if matches!(message, WorkerMessage::Disconnected) {
            self.crash(id, CrashReason::WorkerDisconnected);
            return;
        }

        session.last_frame_at = Some(Utc::now());
        match session.state() {
            SessionState::AwaitingConfig => {
                session.transition(SessionState::Running);
                session.restart.running_since = Some(Instant::now());
            }
            SessionState::Stalled => {
                session.heartbeat.recovered();
                session.transition(SessionState::Running);
                tracing::info!(worker_id = %id, "stalled worker recovered");
            }
            _ => {}
        }

        match message {
            WorkerMessage::Config(config) => self.save_config(id, config).await,
            WorkerMessage::Report(report) => {
                let report = report.globalize(id);
                if let UpstreamReport::Request(answer) = &report {
                    if !session.resolve_request(&answer.request_id, answer.result) {
                        tracing::debug!(worker_id = %id, request_id = %answer.request_id, "answer for untracked request");
                    }
                }
                session.forward(report);
            }
            WorkerMessage::Pong => {
                session.heartbeat.pong_received();
                session.last_pong_at = Some(Utc::now());
            }
            WorkerMessage::Exit => self.worker_exited(id),
            WorkerMessage::Connected => {
                tracing::info!(worker_id = %id, "worker connected to broker");
            }
            // Handled before the liveness update.
            WorkerMessage::Disconnected => {}
            WorkerMessage::Unsupported(command) => {
                tracing::warn!(worker_id = %id, %command, "unsupported command dropped");
            }
        }
    }

    async fn save_config(&mut self, id: &str, config: Args) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.config = config;
        if session.persisted_config.as_ref() == Some(&session.config) {
            tracing::debug!(worker_id = %id, "config unchanged, write skipped");
            return;
        }
        match self.store.save(id, &session.config).await {
            Ok(()) => {
                session.persisted_config = Some(session.config.clone());
                tracing::debug!(worker_id = %id, "config persisted");
            }
            // Stays dirty; the next config frame retries.
            Err(e) => tracing::error!(worker_id = %id, error = %e, "failed to persist worker config"),
        }
    }

    // ── controller → worker ─────────────────────────────────────────

    async fn route_request(&mut self, id: &str, request: ControllerRequest) -> Result<RequestTicket, ManagerError> {
        let profile_clash = match &request {
            ControllerRequest::Install { profile_number } => self.profile_owner(*profile_number, id),
            _ => None,
        };
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| ManagerError::WorkerNotFound(id.to_string()))?;

        let state = session.state();
        let transport = match (&session.transport, state) {
            (Some(transport), SessionState::Running) => transport.clone(),
            _ => {
                tracing::warn!(worker_id = %id, command = request.command(), %state, "worker unavailable, request dropped");
                return Err(ManagerError::WorkerUnavailable {
                    id: id.to_string(),
                    state,
                });
            }
        };

        if let ControllerRequest::Install { profile_number } = &request {
            if let Some(owner) = profile_clash {
                return Err(ManagerError::InvalidDefinition(format!(
                    "profile {profile_number} already belongs to `{owner}`"
                )));
            }
            match session.profile_number {
                Some(current) if current != *profile_number => {
                    return Err(ManagerError::ProfileLocked {
                        id: id.to_string(),
                        current,
                    })
                }
                _ => session.profile_number = Some(*profile_number),
            }
        }

        let command = request.command();
        let request_id = request.request_id().map(str::to_string);
        let frame = match request.localize(id) {
            Ok(local) => local.to_frame()?,
            Err(e) => {
                tracing::warn!(worker_id = %id, command, error = %e, "address mismatch, request dropped");
                return Err(e.into());
            }
        };

        if let Err(e) = transport.send(&frame).await {
            tracing::warn!(worker_id = %id, command, error = %e, "failed to deliver request");
            if e.is_closed() && !transport.closure_is_transient() {
                self.crash(id, CrashReason::TransportClosed(e.to_string()));
            }
            return Err(e.into());
        }
        tracing::debug!(worker_id = %id, command, "request delivered");

        Ok(match request_id {
            Some(request_id) => session.track_request(request_id),
            None => RequestTicket::untracked(),
        })
    }

    // ── timers ──────────────────────────────────────────────────────

    async fn on_tick(&mut self, now: Instant) {
        while self.background.try_join_next().is_some() {}
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.tick_session(&id, now).await;
        }
    }

    async fn tick_session(&mut self, id: &str, now: Instant) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };

        if session.restart.is_due(now) {
            session.restart.cancel();
            session.restart.count += 1;
            tracing::info!(worker_id = %id, attempt = session.restart.attempt, "restarting worker");
            if let Err(e) = self.launch(id).await {
                tracing::error!(worker_id = %id, error = %e, "automatic restart failed");
                if let Some(session) = self.sessions.get_mut(id) {
                    if session.state() == SessionState::Created && self.config.restart.enabled {
                        schedule_restart(session, &self.restart_backoff, now);
                    }
                }
            }
            return;
        }

        let Some(transport) = session.transport.clone() else {
            return;
        };
        if !transport.is_alive() {
            self.crash(id, CrashReason::TransportClosed("worker process is gone".into()));
            return;
        }
        if !transport.is_reachable() {
            session.heartbeat.suspend(now);
            return;
        }
        if session.bootstrap_pending {
            self.deliver_deferred_bootstrap(id, transport, now).await;
            return;
        }

        match session.heartbeat.evaluate(session.state(), now, &self.config.heartbeat) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendPing => match transport.send(&Frame::bare("ping")).await {
                Ok(()) => session.heartbeat.ping_sent(now),
                Err(e) if e.is_closed() && transport.closure_is_transient() => {
                    tracing::debug!(worker_id = %id, error = %e, "ping skipped");
                    session.heartbeat.suspend(now);
                }
                Err(e) => {
                    tracing::warn!(worker_id = %id, error = %e, "ping failed");
                    self.crash(id, CrashReason::TransportClosed(e.to_string()));
                }
            },
            HeartbeatAction::MarkStalled => {
                tracing::warn!(
                    worker_id = %id,
                    timeout = ?self.config.heartbeat.pong_timeout(),
                    "no pong received, worker stalled"
                );
                session.heartbeat.stalled(now);
                session.transition(SessionState::Stalled);
            }
            HeartbeatAction::Kill => {
                tracing::error!(worker_id = %id, "stalled worker still silent, killing");
                self.crash(id, CrashReason::HeartbeatTimeout);
            }
            HeartbeatAction::StartupTimeout => {
                tracing::error!(
                    worker_id = %id,
                    timeout = ?self.config.heartbeat.startup_timeout(),
                    "worker never spoke after start, killing"
                );
                self.crash(id, CrashReason::StartupTimeout);
            }
        }
    }

    /// Retry the startup frames of an MQTT session launched while the
    /// broker was down. The startup window starts over once they are out.
    async fn deliver_deferred_bootstrap(&mut self, id: &str, transport: Arc<dyn WorkerTransport>, now: Instant) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let frames = match bootstrap_frames(&self.runtime, session) {
            Ok(frames) => frames,
            Err(e) => {
                self.crash(id, CrashReason::Bootstrap(e.to_string()));
                return;
            }
        };
        match transport.bootstrap(&frames).await {
            Ok(()) => {
                session.bootstrap_pending = false;
                session.heartbeat = Heartbeat::new(now);
                tracing::info!(worker_id = %id, "deferred config and params delivered");
            }
            Err(e) if e.is_closed() && transport.closure_is_transient() => {
                tracing::debug!(worker_id = %id, error = %e, "startup frames still deferred");
            }
            Err(e) => {
                tracing::error!(worker_id = %id, error = %e, "failed to deliver startup frames");
                self.crash(id, CrashReason::Bootstrap(e.to_string()));
            }
        }
    }

    // ── shutdown ────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        tracing::info!(workers = self.sessions.len(), "shutting down node server manager");
        let timeout = self.config.stop_timeout();

        let mut stops = Vec::new();
        for session in self.sessions.values_mut() {
            session.restart.cancel();
            if let Some(transport) = deactivate(session) {
                let id = session.id().to_string();
                stops.push(async move {
                    if let Err(e) = transport.stop(timeout).await {
                        tracing::warn!(worker_id = %id, error = %e, "error stopping worker");
                    }
                });
            }
        }
        futures_util::future::join_all(stops).await;

        let background = &mut self.background;
        let drained = tokio::time::timeout(timeout, async {
            while background.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            self.background.abort_all();
        }
        self.launcher.shutdown().await;

        // Frames still queued were sent before the workers went away; keep
        // their data rather than dropping it.
        while let Ok(event) = self.events_rx.try_recv() {
            self.drain_event(event).await;
        }

        let forwarders: Vec<_> = self
            .sessions
            .values_mut()
            .filter_map(WorkerSession::detach_forwarder)
            .collect();
        if tokio::time::timeout(timeout, futures_util::future::join_all(forwarders))
            .await
            .is_err()
        {
            tracing::warn!("upstream forwarders did not drain in time");
        }
        tracing::info!("node server manager stopped");
    }

    async fn drain_event(&mut self, event: InboundEvent) {
        let InboundEvent { worker_id, kind, .. } = event;
        let InboundKind::Frame(frame) = kind else {
            return;
        };
        match WorkerMessage::parse(frame) {
            Ok(WorkerMessage::Config(config)) => self.save_config(&worker_id, config).await,
            Ok(WorkerMessage::Report(report)) => {
                if let Some(session) = self.sessions.get(&worker_id) {
                    session.forward(report.globalize(&worker_id));
                }
            }
            Ok(other) => tracing::debug!(worker_id = %worker_id, message = ?other, "discarded during shutdown"),
            Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "protocol violation during shutdown"),
        }
    }
}

/// Move an active session to `Stopped`, abandoning its pending requests,
/// and hand back its transport for the caller to stop.
fn deactivate(session: &mut WorkerSession) -> Option<Arc<dyn WorkerTransport>> {
    if session.state().is_active() {
        session.transition(SessionState::Stopped);
        let abandoned = session.abandon_requests();
        if abandoned > 0 {
            tracing::debug!(worker_id = %session.id(), abandoned, "pending controller requests abandoned");
        }
    }
    session.transport.take()
}

fn schedule_restart(session: &mut WorkerSession, backoff: &Backoff, now: Instant) {
    let delay = backoff.delay(session.restart.attempt);
    session.restart.schedule(now, delay);
    tracing::info!(worker_id = %session.id(), ?delay, "restart scheduled");
}

fn bootstrap_frames(runtime: &RuntimeInfo, session: &WorkerSession) -> Result<Vec<Frame>, FrameError> {
    let def = &session.definition;
    let sandbox = session.sandbox.display().to_string();
    let is_mqtt = def.interface == InterfaceKind::Mqtt;
    let params = Params {
        name: def.display_name().to_string(),
        profile: session.profile_number,
        path: def
            .install_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| sandbox.clone()),
        sandbox,
        configfile: def.configfile.clone(),
        interface: def.interface.params_name().to_string(),
        isyver: runtime.controller_version.clone(),
        pgver: runtime.supervisor_version.clone(),
        pgapiver: API_VERSION.to_string(),
        mqtt_server: is_mqtt.then(|| runtime.mqtt_host.clone()),
        mqtt_port: is_mqtt.then_some(runtime.mqtt_port),
    };
    Ok(vec![config_frame(&session.config), params.to_frame()?])
}
