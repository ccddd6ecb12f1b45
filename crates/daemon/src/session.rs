// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection control session and request dispatcher (§4.F).
//!
//! One [`Session`] exists per `/proxy/<workspace>` connection. It owns the
//! sandbox, the (at most one) supervised engine process, and the broadcast
//! channel that fans server-initiated events out to the connection's
//! writer task. `spawn`/`kill`/`exec-monitor`/`exec-renode` are serialized
//! against each other through `engine_lock` since the engine can only run
//! one monitor command, or be starting/stopping, at a time; filesystem and
//! status actions are not and may run fully concurrently with those and
//! with each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rwp_core::{ProtocolVersion, ProxyError, SERVER_VERSION};
use rwp_wire::{Action, Event, EventBody, Request, Response};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared registry mapping a discovered UART's `(machine, name)` to the
/// local TCP port the supervisor allocated for it, consulted by the
/// `/uart/<machine>/<name>` route (§4.G).
pub type UartRegistry = Arc<tokio::sync::Mutex<HashMap<(String, String), u16>>>;

use crate::engine::{EngineHandle, ExitOutcome, Supervisor};
use crate::fs::FsService;
use crate::monitor::MonitorClient;
use crate::sandbox::Sandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    EngineStarting,
    EngineRunning,
    EngineDown,
    Closed,
}

struct RunningEngine {
    handle: EngineHandle,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    monitor: MonitorClient,
}

pub struct Session {
    sandbox: Sandbox,
    fs: FsService,
    supervisor: Supervisor,
    state: Mutex<SessionState>,
    engine: tokio::sync::Mutex<Option<RunningEngine>>,
    engine_lock: tokio::sync::Mutex<()>,
    events_tx: broadcast::Sender<Event>,
    uart_ports: UartRegistry,
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(
        working_dir: PathBuf,
        engine_binary: PathBuf,
        gdb_binary: Option<PathBuf>,
        uart_ports: UartRegistry,
    ) -> Self {
        let sandbox = Sandbox::new(working_dir.clone());
        let (events_tx, _) = broadcast::channel(64);
        Self {
            fs: FsService::new(sandbox.clone()),
            sandbox,
            supervisor: Supervisor::new(engine_binary, working_dir, gdb_binary),
            state: Mutex::new(SessionState::Connected),
            engine: tokio::sync::Mutex::new(None),
            engine_lock: tokio::sync::Mutex::new(()),
            events_tx,
            uart_ports,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// §4.F version negotiation: major must match exactly, minor must not
    /// be newer than the server's.
    pub fn negotiate(&self, requested: ProtocolVersion) -> Result<(), ProxyError> {
        if requested.compatible_with(SERVER_VERSION) {
            Ok(())
        } else {
            Err(ProxyError::VersionMismatch)
        }
    }

    pub fn sandbox_root(&self) -> &std::path::Path {
        self.sandbox.root()
    }

    pub async fn dispatch(&self, req: Request) -> Response {
        let result = self.handle_action(req.action).await;
        match result {
            Ok(data) => Response::success(SERVER_VERSION, req.id, data),
            Err(err) => Response::failure(SERVER_VERSION, req.id, err),
        }
    }

    async fn handle_action(&self, action: Action) -> Result<serde_json::Value, ProxyError> {
        use serde_json::json;

        match action {
            Action::Spawn(p) => {
                self.spawn_engine(&p.name, p.cwd.as_deref(), p.gui).await?;
                Ok(json!({}))
            }
            Action::Kill(p) => {
                let outcome = self.kill_engine(&p.name).await?;
                Ok(serde_json::to_value(outcome).unwrap_or(json!({})))
            }
            Action::ExecMonitor(p) => {
                let lines = self.exec_monitor(&p.commands).await?;
                Ok(json!({ "output": lines }))
            }
            Action::ExecRenode(p) => {
                let result = self.exec_renode(&p.command, p.args).await?;
                Ok(json!({ "result": result }))
            }
            Action::FsList(p) => {
                let entries = self.fs.list(p.arg(0).unwrap_or("")).await?;
                Ok(serde_json::to_value(entries).unwrap_or(json!([])))
            }
            Action::FsStat(p) => {
                let stat = self.fs.stat(p.arg(0)?).await?;
                Ok(serde_json::to_value(stat).unwrap_or(json!({})))
            }
            Action::FsDwnl(p) => {
                let data = self.fs.download(p.arg(0)?).await?;
                Ok(serde_json::Value::String(data))
            }
            Action::FsUpld(p) => {
                let data = p.data.as_deref().ok_or(ProxyError::BadRequest)?;
                let path = p.arg(0)?;
                self.fs.upload(path, data).await?;
                Ok(json!({ "path": path }))
            }
            Action::FsMkdir(p) => {
                self.fs.mkdir(p.arg(0)?).await?;
                Ok(json!({}))
            }
            Action::FsRemove(p) => {
                let path = p.arg(0)?;
                self.fs.remove(path).await?;
                Ok(json!({ "path": path }))
            }
            Action::FsMove(p) => {
                let (from, to) = (p.arg(0)?, p.arg(1)?);
                self.fs.move_path(from, to).await?;
                Ok(json!({ "from": from, "to": to }))
            }
            Action::FsCopy(p) => {
                let (from, to) = (p.arg(0)?, p.arg(1)?);
                self.fs.copy_path(from, to).await?;
                Ok(json!({ "from": from, "to": to }))
            }
            Action::FsFetch(p) => {
                let path = self.fs.fetch(p.arg(0)?).await?;
                Ok(json!({ "path": path }))
            }
            Action::FsZip(p) => {
                let path = self.fs.fetch_and_extract(p.arg(0)?).await?;
                Ok(json!({ "path": path }))
            }
            Action::TweakSocket(p) => {
                let port = self.tweak_socket(p.args.first().map(String::as_str)).await?;
                Ok(json!({ "port": port }))
            }
            Action::Status => Ok(json!({ "state": format!("{:?}", self.state()) })),
        }
    }

    async fn spawn_engine(
        &self,
        name: &str,
        cwd: Option<&str>,
        gui: bool,
    ) -> Result<EngineHandle, ProxyError> {
        let _serialize = self.engine_lock.lock().await;
        if self.engine.lock().await.is_some() {
            return Err(ProxyError::EngineBusy);
        }
        *self.state.lock() = SessionState::EngineStarting;

        let spawned = match self.supervisor.spawn(name, cwd, gui).await {
            Ok(s) => s,
            Err(err) => {
                *self.state.lock() = SessionState::EngineDown;
                return Err(err);
            }
        };

        let monitor = match MonitorClient::connect(spawned.handle.monitor_port).await {
            Ok(m) => m,
            Err(err) => {
                *self.state.lock() = SessionState::EngineDown;
                return Err(err);
            }
        };

        let handle = spawned.handle.clone();
        if let Err(err) = self.discover_uarts(&monitor, name).await {
            warn!(engine = %handle.name, %err, "uart discovery after spawn failed");
        }

        *self.engine.lock().await = Some(RunningEngine {
            handle: handle.clone(),
            exit_rx: spawned.exit_rx.clone(),
            monitor,
        });
        *self.state.lock() = SessionState::EngineRunning;
        info!(engine = %handle.name, pid = handle.pid, "engine spawned");
        Ok(handle)
    }

    /// Consult `exec-renode uarts` and register a bridge port per discovered
    /// `(machine, name)` pair, emitting `uart-opened` for each one (§4.F).
    /// Expects each entry of the reply's array to carry `{machine?, name,
    /// port}`; `machine` defaults to the spawned engine's own name when the
    /// engine reports a single-machine setup without naming it.
    async fn discover_uarts(
        &self,
        monitor: &MonitorClient,
        default_machine: &str,
    ) -> Result<(), ProxyError> {
        let reply = monitor.exec_renode("uarts", serde_json::json!({})).await?;
        let Some(list) = reply.as_array() else {
            return Ok(());
        };
        for entry in list {
            let Some(name) = entry.get("name").and_then(|v| v.as_str()) else { continue };
            let Some(port) = entry.get("port").and_then(|v| v.as_u64()) else { continue };
            let port = port as u16;
            let machine = entry
                .get("machine")
                .and_then(|v| v.as_str())
                .unwrap_or(default_machine)
                .to_string();

            self.uart_ports.lock().await.insert((machine.clone(), name.to_string()), port);
            let event =
                EventBody::UartOpened { port, name: name.to_string(), machine_name: machine }
                    .into_event(SERVER_VERSION);
            let _ = self.events_tx.send(event);
        }
        Ok(())
    }

    /// `tweak/socket` (§4.F): replace the engine's analyzer socket with a
    /// freshly bound port routed through a `/run/<port>` bridge. Idempotent
    /// once the swap has happened for the running engine.
    async fn tweak_socket(&self, _hint: Option<&str>) -> Result<u16, ProxyError> {
        let _serialize = self.engine_lock.lock().await;
        let mut guard = self.engine.lock().await;
        let running = guard.as_mut().ok_or(ProxyError::EngineNotRunning)?;

        let port = crate::engine::free_tcp_port().await?;
        running
            .monitor
            .exec_renode("tweak-socket", serde_json::json!({ "port": port }))
            .await?;
        running.handle.analyzer_port = Some(port);
        info!(engine = %running.handle.name, port, "analyzer socket swapped onto new bridge port");
        Ok(port)
    }

    async fn kill_engine(&self, name: &str) -> Result<ExitOutcome, ProxyError> {
        let _serialize = self.engine_lock.lock().await;
        let mut guard = self.engine.lock().await;
        let running = guard.take().ok_or(ProxyError::EngineNotRunning)?;
        if running.handle.name != name {
            *guard = Some(running);
            return Err(ProxyError::NotFound);
        }
        let mut exit_rx = running.exit_rx.clone();
        let outcome = self.supervisor.kill(&running.handle, &mut exit_rx).await?;
        *self.state.lock() = SessionState::EngineDown;
        info!(engine = %running.handle.name, ?outcome, "engine killed");
        Ok(outcome)
    }

    async fn exec_monitor(&self, commands: &[String]) -> Result<Vec<String>, ProxyError> {
        let _serialize = self.engine_lock.lock().await;
        let guard = self.engine.lock().await;
        let running = guard.as_ref().ok_or(ProxyError::EngineNotRunning)?;
        running.monitor.exec_monitor(commands).await
    }

    async fn exec_renode(
        &self,
        command: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, ProxyError> {
        let _serialize = self.engine_lock.lock().await;
        let guard = self.engine.lock().await;
        let running = guard.as_ref().ok_or(ProxyError::EngineNotRunning)?;
        running.monitor.exec_renode(command, args).await
    }

    /// Watch for the engine exiting on its own (not via `kill`) and publish
    /// `renode-quitted` once it does (§4.D).
    pub fn watch_for_spontaneous_exit(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let exit_rx = {
                    let guard = session.engine.lock().await;
                    match guard.as_ref() {
                        Some(running) => running.exit_rx.clone(),
                        None => return,
                    }
                };
                let mut exit_rx = exit_rx;
                if exit_rx.changed().await.is_err() {
                    return;
                }
                let Some(outcome) = exit_rx.borrow().clone() else { continue };
                let mut state = session.state.lock();
                if *state == SessionState::EngineRunning {
                    *state = SessionState::EngineDown;
                }
                drop(state);
                session.engine.lock().await.take();
                warn!(?outcome, "engine quit unexpectedly");
                let event = EventBody::RenodeQuitted {
                    exit_code: outcome.exit_code,
                    signal: outcome.signal,
                }
                .into_event(SERVER_VERSION);
                let _ = session.events_tx.send(event);
                return;
            }
        });
    }

    pub fn close(&self) {
        *self.state.lock() = SessionState::Closed;
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (tempfile::TempDir, Arc<Session>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = Arc::new(Session::new(
            dir.path().to_path_buf(),
            PathBuf::from("/bin/true"),
            None,
            Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        ));
        (dir, session)
    }

    #[test]
    fn negotiate_accepts_same_major_lower_minor() {
        let (_dir, session) = session();
        assert!(session.negotiate(ProtocolVersion { major: 1, minor: 0, patch: 0 }).is_ok());
    }

    #[test]
    fn negotiate_rejects_different_major() {
        let (_dir, session) = session();
        assert_eq!(
            session.negotiate(ProtocolVersion { major: 2, minor: 0, patch: 0 }),
            Err(ProxyError::VersionMismatch)
        );
    }

    #[tokio::test]
    async fn status_reports_connected_before_spawn() {
        let (_dir, session) = session();
        let req = Request {
            version: SERVER_VERSION,
            id: 1,
            action: Action::Status,
        };
        let resp = session.dispatch(req).await;
        assert!(matches!(resp.result, rwp_wire::ResponseResult::Success { .. }));
    }

    #[tokio::test]
    async fn exec_monitor_without_engine_is_engine_not_running() {
        let (_dir, session) = session();
        let req = Request {
            version: SERVER_VERSION,
            id: 2,
            action: Action::ExecMonitor(rwp_wire::ExecMonitorPayload { commands: vec!["help".into()] }),
        };
        let resp = session.dispatch(req).await;
        match resp.result {
            rwp_wire::ResponseResult::Failure { error } => assert_eq!(error, "engine-not-running"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_each_get_their_own_id_back() {
        let (_dir, session) = session();
        let mut handles = Vec::new();
        for id in 0..8u64 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                let req = Request { version: SERVER_VERSION, id, action: Action::Status };
                session.dispatch(req).await
            }));
        }
        for (expected_id, handle) in handles.into_iter().enumerate() {
            let resp = handle.await.expect("task completes");
            assert_eq!(resp.id, expected_id as u64);
        }
    }
}
