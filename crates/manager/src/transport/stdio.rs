use std::time::Duration;

use async_trait::async_trait;

use pg_protocol::Frame;

use super::process::{resolve_program, ChildProcess, ProcessCommand};
use super::{EventSink, LaunchSpec, TransportError, WorkerTransport};

/// Frames as newline-delimited JSON on a child's stdin/stdout.
pub struct StdioTransport {
    process: ChildProcess,
}

impl StdioTransport {
    pub fn start(spec: &LaunchSpec, events: EventSink, send_timeout: Duration) -> Result<Self, TransportError> {
        let def = &spec.definition;
        let program = def.executable.as_deref().ok_or_else(|| {
            TransportError::Misconfigured(format!("stdio worker `{}` has no executable", def.id))
        })?;
        let command = ProcessCommand {
            program: resolve_program(program, &spec.sandbox),
            args: def.args.clone(),
            env: def.env.clone(),
            cwd: spec.sandbox.clone(),
        };
        let process = ChildProcess::spawn(&command, spec.source(), events, send_timeout)?;
        Ok(Self { process })
    }
}

#[async_trait]
impl WorkerTransport for StdioTransport {
    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.process.write_line(&frame.encode()).await
    }

    fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    fn closure_is_transient(&self) -> bool {
        false
    }

    async fn stop(&self, timeout: Duration) -> Result<(), TransportError> {
        if let Err(e) = self.send(&Frame::bare("exit")).await {
            tracing::debug!(error = %e, "could not deliver exit frame");
        }
        self.process.terminate(timeout).await
    }

    async fn kill(&self) {
        if let Err(e) = self.process.terminate(Duration::ZERO).await {
            tracing::warn!(error = %e, "failed to kill worker process");
        }
    }
}
