// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! rwp-wire: the JSON envelopes exchanged over the control WebSocket.
//!
//! `rwp-core` owns the error taxonomy and version type; this crate owns the
//! request/response/event shapes built on top of them (§3, §4.F).

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod envelope;

pub use envelope::{
    encode_event, encode_response, parse_request, Action, Event, EventBody, ExecMonitorPayload,
    ExecRenodePayload, FsArgsPayload, KillPayload, Request, Response, ResponseResult,
    SpawnPayload, TweakSocketPayload,
};
pub use rwp_core::{ProtocolVersion, ProxyError, SERVER_VERSION};
