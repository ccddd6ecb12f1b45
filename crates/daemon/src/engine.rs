// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine process supervision (§4.D): spawn, monitor-port readiness probing,
//! and graceful-then-forceful termination.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use rwp_core::{Context, ProxyError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

use crate::env;

/// How many trailing lines of a captured stream are retained (§3
/// `EngineHandle`'s "stdout/stderr capture streams").
const CAPTURE_LINE_LIMIT: usize = 200;

/// A bounded ring of the most recent lines an engine process wrote to one
/// of its captured output streams.
#[derive(Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<String>>>);

impl CaptureBuffer {
    fn push(&self, line: String) {
        let mut lines = self.0.lock();
        lines.push(line);
        if lines.len() > CAPTURE_LINE_LIMIT {
            let overflow = lines.len() - CAPTURE_LINE_LIMIT;
            lines.drain(0..overflow);
        }
    }

    /// The last `n` captured lines, newline-joined (used for the
    /// "spawn-failed with tail of stderr" diagnostic, §4.D).
    pub fn tail(&self, n: usize) -> String {
        let lines = self.0.lock();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

impl std::fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CaptureBuffer({} lines)", self.0.lock().len())
    }
}

fn spawn_capture_task<R>(reader: R, buffer: CaptureBuffer)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer.push(line);
        }
    });
}

/// How the engine process ended.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ExitOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        ExitOutcome { exit_code: status.code(), signal: status.signal().map(signal_name) }
    }
}

fn signal_name(raw: i32) -> String {
    Signal::try_from(raw).map(|s| format!("{s:?}")).unwrap_or_else(|_| format!("signal-{raw}"))
}

/// Identity of a running engine instance, independent of its process handle.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub name: String,
    pub pid: i32,
    pub monitor_port: u16,
    pub gdb_port: Option<u16>,
    pub analyzer_port: Option<u16>,
    pub stdout: CaptureBuffer,
    pub stderr: CaptureBuffer,
}

pub struct SpawnedEngine {
    pub handle: EngineHandle,
    pub exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

/// Spawns and supervises the single engine process behind a session.
pub struct Supervisor {
    engine_binary: PathBuf,
    working_dir: PathBuf,
    gdb_binary: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(engine_binary: PathBuf, working_dir: PathBuf, gdb_binary: Option<PathBuf>) -> Self {
        Self { engine_binary, working_dir, gdb_binary }
    }

    /// Start the engine under `name`, probing its monitor port until it
    /// accepts connections or the spawn timeout elapses (§4.D).
    pub async fn spawn(
        &self,
        name: &str,
        cwd: Option<&str>,
        gui: bool,
    ) -> Result<SpawnedEngine, ProxyError> {
        let monitor_port = free_tcp_port().await?;
        let analyzer_port = free_tcp_port().await?;
        let gdb_port = match &self.gdb_binary {
            Some(_) => Some(free_tcp_port().await?),
            None => None,
        };
        let headless = env::gui_disabled_by_env() || (!gui && !env::hypervisor_gui_enabled());

        let mut cmd = tokio::process::Command::new(&self.engine_binary);
        cmd.current_dir(cwd.map(PathBuf::from).unwrap_or_else(|| self.working_dir.clone()))
            .arg("--monitor-port")
            .arg(monitor_port.to_string())
            .arg("--analyzer-port")
            .arg(analyzer_port.to_string())
            .arg("--name")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if headless {
            cmd.arg("--disable-gui");
        }
        if let Some(port) = gdb_port {
            cmd.arg("--gdb-port").arg(port.to_string());
        }
        if let Some(gdb) = &self.gdb_binary {
            cmd.env("RENODE_GDB_BINARY", gdb);
        }

        let mut child = cmd.spawn().map_err(|_| ProxyError::SpawnFailed)?;
        let pid = child.id().ok_or(ProxyError::SpawnFailed)? as i32;

        let stdout_buf = CaptureBuffer::default();
        let stderr_buf = CaptureBuffer::default();
        if let Some(stdout) = child.stdout.take() {
            spawn_capture_task(stdout, stdout_buf.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture_task(stderr, stderr_buf.clone());
        }

        let (tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::from(status),
                Err(_) => ExitOutcome { exit_code: None, signal: None },
            };
            let _ = tx.send(Some(outcome));
        });

        if let Err(err) = probe_monitor_port(monitor_port, exit_rx.clone()).await {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            if err == ProxyError::SpawnFailed {
                let ctx = Context::new(ProxyError::SpawnFailed, stderr_buf.tail(20));
                warn!(engine = name, %ctx, "engine exited during startup");
            }
            return Err(err);
        }

        Ok(SpawnedEngine {
            handle: EngineHandle {
                name: name.to_string(),
                pid,
                monitor_port,
                gdb_port,
                analyzer_port: Some(analyzer_port),
                stdout: stdout_buf,
                stderr: stderr_buf,
            },
            exit_rx,
        })
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL (§4.D). Returns
    /// the outcome once the process has actually exited.
    pub async fn kill(
        &self,
        handle: &EngineHandle,
        exit_rx: &mut watch::Receiver<Option<ExitOutcome>>,
    ) -> Result<ExitOutcome, ProxyError> {
        if let Some(outcome) = exit_rx.borrow().clone() {
            return Ok(outcome);
        }

        signal::kill(Pid::from_raw(handle.pid), Signal::SIGTERM).map_err(|_| ProxyError::Io)?;
        if tokio::time::timeout(env::kill_grace_period(), exit_rx.changed()).await.is_err() {
            let _ = signal::kill(Pid::from_raw(handle.pid), Signal::SIGKILL);
            let _ = exit_rx.changed().await;
        }

        exit_rx.borrow().clone().ok_or(ProxyError::Io)
    }
}

async fn probe_monitor_port(
    port: u16,
    mut exit_rx: watch::Receiver<Option<ExitOutcome>>,
) -> Result<(), ProxyError> {
    let deadline = Instant::now() + env::spawn_probe_timeout();
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if exit_rx.borrow().is_some() {
            return Err(ProxyError::SpawnFailed);
        }
        if Instant::now() >= deadline {
            return Err(ProxyError::SpawnTimeout);
        }
        tokio::time::sleep(env::spawn_probe_interval()).await;
    }
}

pub(crate) async fn free_tcp_port() -> Result<u16, ProxyError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.map_err(ProxyError::from)?;
    listener.local_addr().map(|a| a.port()).map_err(ProxyError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_outcome_from_signal_names_it() {
        // SIGKILL raw value is 9 on Linux.
        let outcome = ExitOutcome { exit_code: None, signal: Some(signal_name(9)) };
        assert_eq!(outcome.signal.as_deref(), Some("SIGKILL"));
    }

    #[tokio::test]
    async fn free_tcp_port_returns_distinct_bindable_ports() {
        let a = free_tcp_port().await.unwrap();
        let b = free_tcp_port().await.unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn capture_buffer_keeps_only_the_most_recent_lines() {
        let buf = CaptureBuffer::default();
        for i in 0..(CAPTURE_LINE_LIMIT + 10) {
            buf.push(format!("line-{i}"));
        }
        let tail = buf.tail(5);
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines.last(), Some(&format!("line-{}", CAPTURE_LINE_LIMIT + 9)).map(|s| s.as_str()));
    }
}
