// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `renode-ws-proxy`: a session-managing proxy that fronts a simulator
//! engine binary and exposes control, telemetry, and filesystem surfaces
//! over WebSocket.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use rwp_daemon::env;
use rwp_daemon::listener::{router, AppState};

/// Exit codes (§6): `0` clean shutdown, `1` bind failure, `2` bad
/// arguments, `3` engine binary not executable.
const EXIT_BIND_FAILURE: i32 = 1;
const EXIT_BAD_ARGUMENTS: i32 = 2;
const EXIT_ENGINE_NOT_EXECUTABLE: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "renode-ws-proxy", about = "WebSocket proxy in front of the simulator engine")]
struct Cli {
    /// Path to the engine binary to spawn on `spawn` requests.
    engine_binary: PathBuf,

    /// Sandbox root for filesystem operations and the engine's default cwd.
    working_dir: PathBuf,

    /// Path to the debug-server-capable binary (e.g. a gdbserver shim).
    #[arg(short = 'g', long = "gdb-binary")]
    gdb_binary: Option<PathBuf>,

    /// Control listen port; defaults to `RENODE_PROXY_PORT` or 21234.
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Increase log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if !cli.working_dir.is_dir() {
        tracing::error!(path = %cli.working_dir.display(), "working directory is not a usable directory");
        std::process::exit(EXIT_BAD_ARGUMENTS);
    }
    if !is_executable_file(&cli.engine_binary) {
        tracing::error!(path = %cli.engine_binary.display(), "engine binary does not exist or is not executable");
        std::process::exit(EXIT_ENGINE_NOT_EXECUTABLE);
    }

    let port = cli.port.unwrap_or_else(env::default_port);
    let working_dir = match cli.working_dir.canonicalize() {
        Ok(p) => p,
        Err(err) => {
            tracing::error!(%err, "failed to canonicalize working directory");
            std::process::exit(EXIT_BAD_ARGUMENTS);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!(%err, "failed to start async runtime");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };

    runtime.block_on(async move {
        let state = Arc::new(AppState::new(cli.engine_binary, working_dir, cli.gdb_binary));
        let app = router(state);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(err) => {
                tracing::error!(%err, %addr, "failed to bind listen address");
                std::process::exit(EXIT_BIND_FAILURE);
            }
        };

        tracing::info!(%addr, "renode-ws-proxy listening");
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(%err, "server exited with error");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    });
}

/// Exists, is a regular file, and has at least one executable bit set —
/// distinct from merely existing (§6 exit code 3).
fn is_executable_file(path: &std::path::Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else { return false };
    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}
