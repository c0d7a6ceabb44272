//! Child process plumbing shared by both transports.
//!
//! A stdio worker speaks its protocol over these pipes. An MQTT worker that
//! the supervisor launches still gets its startup frames over stdin, and
//! anything it prints on stdout is treated as frames too.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;

use pg_protocol::MAX_FRAME_BYTES;

use super::{truncate_for_log, EventSink, EventSource, InboundEvent, InboundKind, TransportError};

/// What to run, and where.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

/// A spawned worker process with its stdio pipes wired up.
///
/// Stdout lines become [`InboundEvent`]s; stderr lines are logged. The
/// process is killed if this value is dropped while it is still running.
pub struct ChildProcess {
    worker_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    send_timeout: Duration,
}

impl ChildProcess {
    pub fn spawn(
        command: &ProcessCommand,
        source: EventSource,
        events: EventSink,
        send_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let program = command.program.display().to_string();
        std::fs::create_dir_all(&command.cwd).map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .current_dir(&command.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let pid = child.id();

        tracing::info!(
            worker_id = %source.worker_id,
            pid = ?pid,
            program = %program,
            cwd = %command.cwd.display(),
            "worker process started"
        );

        let alive = Arc::new(AtomicBool::new(true));
        tokio::spawn(pump_stdout(
            BufReader::new(stdout),
            source.clone(),
            events,
            alive.clone(),
        ));
        tokio::spawn(pump_stderr(BufReader::new(stderr), source.worker_id.clone()));

        Ok(Self {
            worker_id: source.worker_id,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
            pid,
            alive,
            send_timeout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Write one line to stdin. A broken pipe or a write stuck longer than
    /// the send timeout is reported as [`TransportError::Closed`].
    pub async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed("process has exited".into()));
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed("stdin already closed".into()))?;

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(TransportError::Closed(format!("write failed: {e}")))
            }
            Err(_) => Err(TransportError::Closed(format!(
                "write did not complete within {:?}",
                self.send_timeout
            ))),
        }
    }

    /// Close stdin, wait up to `timeout` for the process to exit, then kill
    /// it. A process that is already gone counts as stopped.
    pub async fn terminate(&self, timeout: Duration) -> Result<(), TransportError> {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(worker_id = %self.worker_id, error = %e, "error closing worker stdin");
            }
        }

        let mut child = self.child.lock().await;
        let result = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(worker_id = %self.worker_id, %status, "worker process exited");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "error waiting for worker process");
                kill_child(&mut child, &self.worker_id).await
            }
            Err(_) => {
                if !timeout.is_zero() {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        ?timeout,
                        "worker did not exit in time, killing"
                    );
                }
                kill_child(&mut child, &self.worker_id).await
            }
        };
        self.alive.store(false, Ordering::SeqCst);
        result
    }
}

async fn kill_child(child: &mut Child, worker_id: &str) -> Result<(), TransportError> {
    match child.kill().await {
        Ok(()) => {
            tracing::info!(worker_id = %worker_id, "worker process killed");
            Ok(())
        }
        // Already reaped.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(TransportError::Io(e)),
    }
}

fn missing_pipe(name: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to capture child {name}"),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Readers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, PartialEq)]
enum Line {
    Text(String),
    /// Longer than a frame may be; the rest of it was discarded.
    Oversized,
    Eof,
}

/// Read one newline-terminated line without buffering more than
/// `MAX_FRAME_BYTES + 1` bytes of it.
async fn read_bounded_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_FRAME_BYTES as u64 + 1;
    buf.clear();
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() != Some(&b'\n') && n as u64 >= limit {
        loop {
            buf.clear();
            let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
            if n == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(Line::Oversized);
    }
    Ok(Line::Text(String::from_utf8_lossy(buf).trim_end().to_string()))
}

async fn pump_stdout<R>(mut reader: R, source: EventSource, events: EventSink, alive: Arc<AtomicBool>)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let reason = loop {
        let kind = match read_bounded_line(&mut reader, &mut buf).await {
            Ok(Line::Text(text)) if text.is_empty() => continue,
            Ok(Line::Text(text)) => match pg_protocol::Frame::decode(&text) {
                Ok(frame) => InboundKind::Frame(frame),
                Err(e) => InboundKind::Malformed {
                    raw: truncate_for_log(&text),
                    error: e.to_string(),
                },
            },
            Ok(Line::Oversized) => InboundKind::Malformed {
                raw: String::new(),
                error: pg_protocol::FrameError::TooLarge.to_string(),
            },
            Ok(Line::Eof) => break "stdout closed".to_string(),
            Err(e) => break format!("stdout read failed: {e}"),
        };
        if events.send(source.event(kind)).await.is_err() {
            // Manager is gone.
            return;
        }
    };

    alive.store(false, Ordering::SeqCst);
    tracing::debug!(worker_id = %source.worker_id, generation = source.generation, %reason, "worker stdout reader finished");
    let _ = events.send(source.event(InboundKind::Closed { reason })).await;
}

async fn pump_stderr<R>(mut reader: R, worker_id: String)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        match read_bounded_line(&mut reader, &mut buf).await {
            Ok(Line::Text(text)) if text.is_empty() => {}
            Ok(Line::Text(text)) => {
                tracing::error!(target: "worker_stderr", worker_id = %worker_id, "{text}");
            }
            Ok(Line::Oversized) => {
                tracing::error!(target: "worker_stderr", worker_id = %worker_id, "<oversized stderr line dropped>");
            }
            Ok(Line::Eof) | Err(_) => break,
        }
    }
}

/// Resolve a worker's executable against its sandbox when it is relative.
pub(crate) fn resolve_program(program: &Path, sandbox: &Path) -> PathBuf {
    if program.is_absolute() || program.components().count() == 1 {
        program.to_path_buf()
    } else {
        sandbox.join(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_reader_splits_lines() {
        let mut reader = BufReader::new(&b"{\"pong\":{}}\r\nsecond\nlast"[..]);
        let mut buf = Vec::new();
        assert_eq!(
            read_bounded_line(&mut reader, &mut buf).await.unwrap(),
            Line::Text("{\"pong\":{}}".into())
        );
        assert_eq!(
            read_bounded_line(&mut reader, &mut buf).await.unwrap(),
            Line::Text("second".into())
        );
        assert_eq!(
            read_bounded_line(&mut reader, &mut buf).await.unwrap(),
            Line::Text("last".into())
        );
        assert_eq!(read_bounded_line(&mut reader, &mut buf).await.unwrap(), Line::Eof);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_whole() {
        let mut input = vec![b'x'; MAX_FRAME_BYTES + 10];
        input.extend_from_slice(b"\n{\"pong\":{}}\n");
        let mut reader = BufReader::new(&input[..]);
        let mut buf = Vec::new();
        assert_eq!(read_bounded_line(&mut reader, &mut buf).await.unwrap(), Line::Oversized);
        assert_eq!(
            read_bounded_line(&mut reader, &mut buf).await.unwrap(),
            Line::Text("{\"pong\":{}}".into())
        );
    }

    #[tokio::test]
    async fn stdout_pump_reports_frames_then_closure() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let source = EventSource {
            worker_id: "hue".into(),
            generation: 1,
        };
        let alive = Arc::new(AtomicBool::new(true));
        let input = &b"{\"pong\":{}}\n\nnot json\n"[..];
        pump_stdout(BufReader::new(input), source, tx, alive.clone()).await;

        assert!(matches!(rx.recv().await.unwrap().kind, InboundKind::Frame(f) if f.command == "pong"));
        assert!(matches!(rx.recv().await.unwrap().kind, InboundKind::Malformed { .. }));
        assert!(matches!(rx.recv().await.unwrap().kind, InboundKind::Closed { .. }));
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[test]
    fn relative_programs_resolve_against_sandbox() {
        let sandbox = Path::new("/var/polyglot/hue");
        assert_eq!(resolve_program(Path::new("/usr/bin/python3"), sandbox), PathBuf::from("/usr/bin/python3"));
        assert_eq!(resolve_program(Path::new("python3"), sandbox), PathBuf::from("python3"));
        assert_eq!(resolve_program(Path::new("./hue.py"), sandbox), PathBuf::from("/var/polyglot/hue/./hue.py"));
    }
}
