// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The WebSocket router (§4.G): `/proxy/<workspace>` for control, and the
//! three raw TCP↔WS bridge routes for monitor console, UART, and debug
//! server traffic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use rwp_core::SERVER_VERSION;
use rwp_wire::{encode_event, encode_response, parse_request};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bridge;
use crate::session::{Session, UartRegistry};

pub struct AppState {
    pub engine_binary: PathBuf,
    pub working_dir: PathBuf,
    pub gdb_binary: Option<PathBuf>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    uart_ports: UartRegistry,
}

impl AppState {
    pub fn new(engine_binary: PathBuf, working_dir: PathBuf, gdb_binary: Option<PathBuf>) -> Self {
        Self {
            engine_binary,
            working_dir,
            gdb_binary,
            sessions: Mutex::new(HashMap::new()),
            uart_ports: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/proxy/:workspace", get(proxy_handler))
        .route("/telnet/:port", get(telnet_handler))
        .route("/uart/:machine/:name", get(uart_handler))
        .route("/run/:port", get(run_handler))
        .fallback(fallback_404)
        .with_state(state)
}

async fn fallback_404() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

async fn proxy_handler(
    Path(workspace): Path<String>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    {
        let sessions = state.sessions.lock().await;
        if let Some(existing) = sessions.get(&workspace) {
            if existing.state() != crate::session::SessionState::Closed {
                return (StatusCode::CONFLICT, "busy").into_response();
            }
        }
    }
    ws.on_upgrade(move |socket| handle_control_socket(socket, workspace, state))
}

async fn handle_control_socket(socket: WebSocket, workspace: String, state: Arc<AppState>) {
    let session = Arc::new(Session::new(
        state.working_dir.clone(),
        state.engine_binary.clone(),
        state.gdb_binary.clone(),
        state.uart_ports.clone(),
    ));
    state.sessions.lock().await.insert(workspace.clone(), session.clone());
    session.watch_for_spontaneous_exit();

    run_control_session(socket, session.clone()).await;

    session.close();
    state.sessions.lock().await.remove(&workspace);
    info!(%workspace, "control session closed");
}

async fn run_control_session(socket: WebSocket, session: Arc<Session>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut events = session.subscribe_events();
    let event_out = out_tx.clone();
    let event_forwarder = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event_out.send(encode_event(&event)).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_request(&session, &text, out_tx.clone());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    event_forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
}

fn dispatch_request(
    session: &Arc<Session>,
    text: &str,
    out_tx: tokio::sync::mpsc::UnboundedSender<String>,
) {
    let session = session.clone();
    let text = text.to_string();
    tokio::spawn(async move {
        let resp = match parse_request(&text) {
            Ok(req) => {
                let id = req.id;
                if let Err(err) = session.negotiate(req.version) {
                    rwp_wire::Response::failure(SERVER_VERSION, id, err)
                } else {
                    match tokio::time::timeout(
                        crate::env::default_request_timeout(),
                        session.dispatch(req),
                    )
                    .await
                    {
                        Ok(resp) => resp,
                        Err(_) => {
                            rwp_wire::Response::failure(SERVER_VERSION, id, rwp_core::ProxyError::Timeout)
                        }
                    }
                }
            }
            Err((id, err)) => rwp_wire::Response::failure(SERVER_VERSION, id.unwrap_or(0), err),
        };
        let _ = out_tx.send(encode_response(&resp));
    });
}

async fn telnet_handler(Path(port): Path<u16>, ws: WebSocketUpgrade) -> HttpResponse {
    bridge_to_port(ws, port).await
}

async fn run_handler(Path(port): Path<u16>, ws: WebSocketUpgrade) -> HttpResponse {
    bridge_to_port(ws, port).await
}

/// Bridges to the TCP endpoint the supervisor allocated for this UART
/// (§4.G), looked up by the `(machine, name)` pair a prior `spawn`
/// discovered and published via the `uart-opened` event — never a
/// client-supplied port.
async fn uart_handler(
    Path((machine, name)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    let port = state.uart_ports.lock().await.get(&(machine, name)).copied();
    match port {
        Some(port) => bridge_to_port(ws, port).await,
        None => (StatusCode::NOT_FOUND, "enoent").into_response(),
    }
}

async fn bridge_to_port(ws: WebSocketUpgrade, port: u16) -> HttpResponse {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(tcp) => ws.on_upgrade(move |socket| async move {
            bridge::run(tcp, socket).await;
        }),
        Err(err) => {
            warn!(%err, port, "bridge target refused connection");
            (StatusCode::BAD_GATEWAY, "engine-not-running").into_response()
        }
    }
}
