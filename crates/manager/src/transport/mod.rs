//! Worker transports.
//!
//! Each worker talks to the manager over one of two transports, picked once
//! from its definition:
//! - **Stdio**: the worker is a child process; frames are lines on its
//!   stdin/stdout, stderr is logged.
//! - **Mqtt**: frames are published on a per-worker topic pair of a broker
//!   connection shared by all MQTT workers.
//!
//! Transports only move frames. Address rewriting, state and dispatch live
//! in the manager. Inbound traffic from every transport lands in one queue
//! of [`InboundEvent`]s tagged with the worker id and the transport
//! generation, so events from a transport that has since been replaced can
//! be recognised and dropped.

pub mod mqtt;
pub mod process;
pub mod stdio;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use pg_domain::config::{InterfaceKind, MqttConfig, WorkerDefinition};
use pg_protocol::{Frame, FrameError};

pub use mqtt::{MqttBroker, MqttTransport};
pub use process::{ChildProcess, ProcessCommand};
pub use stdio::StdioTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Something a transport observed for one worker.
#[derive(Debug)]
pub enum InboundKind {
    /// A decoded frame.
    Frame(Frame),
    /// A line or payload that is not a valid frame.
    Malformed { raw: String, error: String },
    /// The transport closed underneath the worker.
    Closed { reason: String },
}

#[derive(Debug)]
pub struct InboundEvent {
    pub worker_id: String,
    pub generation: u64,
    pub kind: InboundKind,
}

impl InboundEvent {
    /// Decode raw bytes into a frame event, keeping the text on failure.
    pub fn decode(source: &EventSource, payload: &[u8]) -> Self {
        let kind = match Frame::decode_bytes(payload) {
            Ok(frame) => InboundKind::Frame(frame),
            Err(e) => InboundKind::Malformed {
                raw: truncate_for_log(&String::from_utf8_lossy(payload)),
                error: e.to_string(),
            },
        };
        source.event(kind)
    }
}

/// Sender side of the manager's inbound queue.
pub type EventSink = mpsc::Sender<InboundEvent>;

/// Identifies which worker, and which incarnation of its transport, an
/// event belongs to.
#[derive(Debug, Clone)]
pub struct EventSource {
    pub worker_id: String,
    pub generation: u64,
}

impl EventSource {
    pub fn event(&self, kind: InboundKind) -> InboundEvent {
        InboundEvent {
            worker_id: self.worker_id.clone(),
            generation: self.generation,
            kind,
        }
    }
}

pub(crate) fn truncate_for_log(raw: &str) -> String {
    const MAX: usize = 120;
    if raw.len() <= MAX {
        return raw.to_string();
    }
    let mut end = MAX;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &raw[..end])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport closed: {0}")]
    Closed(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame encoding error: {0}")]
    Frame(#[from] FrameError),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("cannot launch worker: {0}")]
    Misconfigured(String),
}

impl TransportError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// One worker's frame channel.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Deliver the startup frames (`config`, `params`).
    async fn bootstrap(&self, frames: &[Frame]) -> Result<(), TransportError> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    /// Send one frame. A write that cannot complete within the transport's
    /// send timeout fails with [`TransportError::Closed`].
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    /// False once the worker's process is known to be gone.
    fn is_alive(&self) -> bool;

    /// OS process id, when the transport owns a process.
    fn pid(&self) -> Option<u32>;

    /// Whether a closed send may succeed later without a restart
    /// (broker reconnect), as opposed to a dead process.
    fn closure_is_transient(&self) -> bool;

    /// Whether frames can currently reach the worker at all. Liveness
    /// deadlines are suspended while this is false.
    fn is_reachable(&self) -> bool {
        true
    }

    /// Ask the worker to exit, wait up to `timeout`, then force it.
    /// Stopping something that is already gone succeeds.
    async fn stop(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Release the worker immediately, without asking.
    async fn kill(&self);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Launcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything needed to bring one worker's transport up.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub definition: WorkerDefinition,
    pub sandbox: PathBuf,
    pub generation: u64,
}

impl LaunchSpec {
    pub fn source(&self) -> EventSource {
        EventSource {
            worker_id: self.definition.id.clone(),
            generation: self.generation,
        }
    }
}

/// Creates transports for sessions and owns resources shared between them.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        spec: LaunchSpec,
        events: EventSink,
    ) -> Result<Arc<dyn WorkerTransport>, TransportError>;

    /// The worker was removed for good; drop anything held on its behalf.
    async fn release(&self, worker_id: &str);

    /// Tear down shared resources. Called after every session is stopped.
    async fn shutdown(&self);
}

/// Launches real processes and the shared MQTT broker connection.
pub struct SystemLauncher {
    mqtt: MqttConfig,
    send_timeout: Duration,
    broker: tokio::sync::Mutex<Option<Arc<MqttBroker>>>,
}

impl SystemLauncher {
    pub fn new(mqtt: MqttConfig, send_timeout: Duration) -> Self {
        Self {
            mqtt,
            send_timeout,
            broker: tokio::sync::Mutex::new(None),
        }
    }

    /// Open the broker connection on first use. The first worker's `node`
    /// topic carries the connection's last-will.
    async fn broker_for(&self, worker_id: &str) -> Arc<MqttBroker> {
        let mut slot = self.broker.lock().await;
        if let Some(broker) = slot.as_ref() {
            return broker.clone();
        }
        let broker = Arc::new(MqttBroker::open(&self.mqtt, worker_id, self.send_timeout));
        *slot = Some(broker.clone());
        broker
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn launch(
        &self,
        spec: LaunchSpec,
        events: EventSink,
    ) -> Result<Arc<dyn WorkerTransport>, TransportError> {
        match spec.definition.interface {
            InterfaceKind::Stdio => {
                let transport = StdioTransport::start(&spec, events, self.send_timeout)?;
                Ok(Arc::new(transport))
            }
            InterfaceKind::Mqtt => {
                let broker = self.broker_for(&spec.definition.id).await;
                let transport = MqttTransport::start(broker, &spec, events, self.send_timeout).await?;
                Ok(Arc::new(transport))
            }
        }
    }

    async fn release(&self, worker_id: &str) {
        let mut slot = self.broker.lock().await;
        let Some(broker) = slot.as_ref() else {
            return;
        };
        if !broker.is_registered(worker_id) {
            return;
        }
        if broker.unregister(worker_id).await == 0 {
            broker.close().await;
            *slot = None;
        }
    }

    async fn shutdown(&self) {
        if let Some(broker) = self.broker.lock().await.take() {
            broker.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_tags_event_with_source() {
        let source = EventSource {
            worker_id: "hue".into(),
            generation: 3,
        };
        let event = InboundEvent::decode(&source, br#"{"pong": {}}"#);
        assert_eq!(event.worker_id, "hue");
        assert_eq!(event.generation, 3);
        assert!(matches!(event.kind, InboundKind::Frame(f) if f.command == "pong"));

        let event = InboundEvent::decode(&source, b"Traceback (most recent call last):");
        assert!(matches!(event.kind, InboundKind::Malformed { .. }));
    }

    #[test]
    fn long_lines_are_truncated_for_logs() {
        let raw = "é".repeat(100);
        let short = truncate_for_log(&raw);
        assert!(short.ends_with("..."));
        assert!(short.len() <= 124);
    }
}
