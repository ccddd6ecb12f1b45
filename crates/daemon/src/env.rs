// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon crate.

use std::time::Duration;

/// Default control-socket port when `-p`/`--port` is not given.
pub fn default_port() -> u16 {
    std::env::var("RENODE_PROXY_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(21234)
}

/// Whether the engine should be spawned with its GUI suppressed.
///
/// `RENODE_PROXY_GUI_DISABLED=1` forces headless mode regardless of the
/// request payload's `gui` flag; `RENODE_HYPERVISOR_GUI_ENABLED=1` is the
/// inverse escape hatch used when the proxy itself runs inside a
/// GUI-capable hypervisor and wants the engine's window forwarded.
pub fn gui_disabled_by_env() -> bool {
    env_flag("RENODE_PROXY_GUI_DISABLED")
}

pub fn hypervisor_gui_enabled() -> bool {
    env_flag("RENODE_HYPERVISOR_GUI_ENABLED")
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true"))
}

/// Default per-request timeout applied by the control session (§4.F, §9.5).
pub fn default_request_timeout() -> Duration {
    std::env::var("RENODE_PROXY_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(60))
}

/// Timeout for `exec-monitor` specifically (§4.E): shorter than the default
/// because monitor commands are expected to be interactive and quick.
pub fn exec_monitor_timeout() -> Duration {
    std::env::var("RENODE_PROXY_EXEC_MONITOR_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(10))
}

/// How long `spawn` waits for the engine's monitor port to accept
/// connections before giving up (§4.D).
pub fn spawn_probe_timeout() -> Duration {
    std::env::var("RENODE_PROXY_SPAWN_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(10_500))
}

/// Interval between monitor-port probe attempts during `spawn`.
pub fn spawn_probe_interval() -> Duration {
    Duration::from_millis(100)
}

/// Grace period between SIGTERM and SIGKILL when killing the engine (§4.D).
pub fn kill_grace_period() -> Duration {
    std::env::var("RENODE_PROXY_KILL_GRACE_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(2))
}

/// TCP bridge high/low water marks for backpressure (§4.C, §6).
pub fn bridge_high_water_mark() -> usize {
    std::env::var("RENODE_PROXY_BRIDGE_HIGH_WATER_BYTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1024 * 1024)
}

pub fn bridge_low_water_mark() -> usize {
    std::env::var("RENODE_PROXY_BRIDGE_LOW_WATER_BYTES")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(256 * 1024)
}

/// WS keepalive ping interval for bridged connections (§4.C).
pub fn bridge_ping_interval() -> Duration {
    Duration::from_secs(30)
}

/// Number of missed pongs before a bridge connection is torn down.
pub fn bridge_missed_pong_limit() -> u32 {
    3
}
