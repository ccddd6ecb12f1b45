// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client for the engine's monitor TCP port (§4.E).
//!
//! The monitor speaks two dialects over the same connection: a
//! line-oriented console dialect (`exec-monitor`, one command per line,
//! output terminated by a blank line) and a structured single-line JSON
//! dialect (`exec-renode`, one JSON object in, one JSON object out). Only
//! one command may be outstanding at a time, so every call goes through
//! `inner`'s mutex.

use rwp_core::ProxyError;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::env;

pub struct MonitorClient {
    inner: Mutex<BufReader<TcpStream>>,
}

impl MonitorClient {
    pub async fn connect(port: u16) -> Result<Self, ProxyError> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(ProxyError::from)?;
        Ok(Self { inner: Mutex::new(BufReader::new(stream)) })
    }

    /// Run a batch of console commands and return their combined output,
    /// one entry per command (§4.E). Times out after
    /// [`env::exec_monitor_timeout`].
    pub async fn exec_monitor(&self, commands: &[String]) -> Result<Vec<String>, ProxyError> {
        let mut guard = self.inner.lock().await;
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            let output = tokio::time::timeout(
                env::exec_monitor_timeout(),
                run_line_command(&mut guard, command),
            )
            .await
            .map_err(|_| ProxyError::Timeout)??;
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Run one structured command through the JSON dialect (§4.E). Times
    /// out after [`env::default_request_timeout`].
    pub async fn exec_renode(&self, command: &str, args: Value) -> Result<Value, ProxyError> {
        let mut guard = self.inner.lock().await;
        tokio::time::timeout(
            env::default_request_timeout(),
            run_json_command(&mut guard, command, args),
        )
        .await
        .map_err(|_| ProxyError::Timeout)?
    }
}

async fn run_line_command(
    stream: &mut BufReader<TcpStream>,
    command: &str,
) -> Result<String, ProxyError> {
    stream.get_mut().write_all(command.as_bytes()).await.map_err(ProxyError::from)?;
    stream.get_mut().write_all(b"\n").await.map_err(ProxyError::from)?;

    let mut output = String::new();
    loop {
        let mut line = String::new();
        let n = stream.read_line(&mut line).await.map_err(ProxyError::from)?;
        if n == 0 {
            return Err(ProxyError::EngineNotRunning);
        }
        if line.trim().is_empty() {
            break;
        }
        output.push_str(&line);
    }
    Ok(output.trim_end().to_string())
}

async fn run_json_command(
    stream: &mut BufReader<TcpStream>,
    command: &str,
    args: Value,
) -> Result<Value, ProxyError> {
    let request = serde_json::json!({ "command": command, "args": args });
    let mut line = serde_json::to_vec(&request).map_err(|_| ProxyError::BadRequest)?;
    line.push(b'\n');
    stream.get_mut().write_all(&line).await.map_err(ProxyError::from)?;

    let mut response = String::new();
    let n = stream.read_line(&mut response).await.map_err(ProxyError::from)?;
    if n == 0 {
        return Err(ProxyError::EngineNotRunning);
    }
    serde_json::from_str(response.trim_end()).map_err(|_| ProxyError::Io)
}

