//! Upstream delivery to the home-automation controller.
//!
//! Reports are already in global address form when they get here. Each
//! session has its own forwarder task draining a bounded queue, so a slow
//! controller delays only that worker's reports and never the manager loop.
//! When a report carries a `seq`, the forwarder answers the worker with a
//! `result` frame once the call is done.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use pg_protocol::{CallResult, UpstreamReport};

use crate::transport::WorkerTransport;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller unreachable after {retries} retries: {reason}")]
    Unreachable { reason: String, retries: u32 },

    #[error("controller did not answer in time: {0}")]
    Timeout(String),

    #[error("controller rejected `{command}` with HTTP {status}")]
    Rejected { command: String, status: u16, retries: u32 },

    #[error("controller client error: {0}")]
    Client(String),
}

impl ControllerError {
    /// Status handed back to workers. Failures without an HTTP response
    /// use codes below 100.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout(_) => 1,
            Self::Client(_) => 3,
            Self::Unreachable { .. } => 4,
            Self::Rejected { status, .. } => *status,
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            Self::Unreachable { retries, .. } | Self::Rejected { retries, .. } => *retries,
            Self::Timeout(_) | Self::Client(_) => 0,
        }
    }
}

/// A call the controller accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub status_code: u16,
    /// Response body, only read for `restcall`.
    pub text: Option<String>,
    pub retries: u32,
}

impl Delivery {
    pub fn ok() -> Self {
        Self {
            status_code: 200,
            text: None,
            retries: 0,
        }
    }
}

/// Where worker reports end up.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn send(&self, profile_number: u32, report: &UpstreamReport) -> Result<Delivery, ControllerError>;
}

/// Queued on a session's forwarder.
pub(crate) struct Forward {
    pub profile_number: Option<u32>,
    pub report: UpstreamReport,
    /// The transport that sent the report, kept when a `result` is owed.
    pub reply_to: Option<Arc<dyn WorkerTransport>>,
}

pub(crate) fn spawn_forwarder(
    worker_id: String,
    controller: Arc<dyn Controller>,
    capacity: usize,
) -> (mpsc::Sender<Forward>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Forward>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(forward) = rx.recv().await {
            deliver(&worker_id, controller.as_ref(), forward).await;
        }
        tracing::debug!(worker_id = %worker_id, "upstream forwarder finished");
    });
    (tx, handle)
}

async fn deliver(worker_id: &str, controller: &dyn Controller, forward: Forward) {
    let Forward {
        profile_number,
        report,
        reply_to,
    } = forward;
    let profile = match profile_number {
        Some(profile) => profile,
        // Raw REST calls are not scoped to a profile.
        None if matches!(report, UpstreamReport::RestCall(_)) => 0,
        None => {
            tracing::warn!(
                worker_id,
                command = report.command(),
                "worker has no profile number yet, report dropped"
            );
            return;
        }
    };

    let started = Instant::now();
    let (status_code, text, retries) = match controller.send(profile, &report).await {
        Ok(delivery) => (delivery.status_code, delivery.text, delivery.retries),
        Err(e) => {
            tracing::error!(
                worker_id,
                command = report.command(),
                error = %e,
                "failed to deliver report to controller"
            );
            (e.status_code(), Some(e.to_string()), e.retries())
        }
    };

    let (Some(seq), Some(transport)) = (report.seq(), reply_to) else {
        return;
    };
    let result = CallResult {
        seq: seq.clone(),
        status_code,
        elapsed: started.elapsed().as_secs_f64(),
        text,
        retries,
    };
    let sent = match result.to_frame() {
        Ok(frame) => transport.send(&frame).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
        tracing::debug!(worker_id, seq = %result.seq, error = %e, "result not delivered to worker");
    }
}
