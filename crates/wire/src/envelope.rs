// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request / response / event envelopes (§3 of the spec) and their framing.
//!
//! All three ride as UTF-8 JSON inside WebSocket text frames. Binary frames
//! are reserved for TCP bridge payloads (§6) and never touch this module.

use rwp_core::{ProtocolVersion, ProxyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `spawn` payload: `{name, cwd?, gui?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnPayload {
    pub name: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub gui: bool,
}

/// `kill` payload: `{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KillPayload {
    pub name: String,
}

/// `exec-monitor` payload: a sequence of console command strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecMonitorPayload {
    pub commands: Vec<String>,
}

/// `exec-renode` payload: the structured JSON dialect forwarded verbatim
/// to the engine monitor's command/args framing (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecRenodePayload {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

/// Positional-argument payload shared by all `fs/*` actions (§4.B).
///
/// `args` holds the operation's path operands in order (one path for
/// `list`/`stat`/`dwnl`/`upld`/`mkdir`/`remove`, two for `move`/`copy`, and
/// a single source URL for `zip`/`fetch`). `data` is only present on
/// `fs/upld`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FsArgsPayload {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub data: Option<String>,
}

impl FsArgsPayload {
    /// Fetch positional argument `i`, or `bad-request` if absent.
    pub fn arg(&self, i: usize) -> Result<&str, ProxyError> {
        self.args.get(i).map(String::as_str).ok_or(ProxyError::BadRequest)
    }
}

/// `tweak/socket` payload: `{args: [port_or_path]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TweakSocketPayload {
    #[serde(default)]
    pub args: Vec<String>,
}

/// The `action` + `payload` pair of a request envelope.
///
/// Each variant pins down its own payload schema instead of leaving the
/// payload duck-typed (§9 design note): an unrecognized `action` string
/// fails to deserialize into this enum at all, which the dispatcher turns
/// into `unsupported-action` rather than a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "payload")]
pub enum Action {
    #[serde(rename = "spawn")]
    Spawn(SpawnPayload),
    #[serde(rename = "kill")]
    Kill(KillPayload),
    #[serde(rename = "exec-monitor")]
    ExecMonitor(ExecMonitorPayload),
    #[serde(rename = "exec-renode")]
    ExecRenode(ExecRenodePayload),
    #[serde(rename = "fs/list")]
    FsList(FsArgsPayload),
    #[serde(rename = "fs/stat")]
    FsStat(FsArgsPayload),
    #[serde(rename = "fs/dwnl")]
    FsDwnl(FsArgsPayload),
    #[serde(rename = "fs/upld")]
    FsUpld(FsArgsPayload),
    #[serde(rename = "fs/mkdir")]
    FsMkdir(FsArgsPayload),
    #[serde(rename = "fs/remove")]
    FsRemove(FsArgsPayload),
    #[serde(rename = "fs/move")]
    FsMove(FsArgsPayload),
    #[serde(rename = "fs/copy")]
    FsCopy(FsArgsPayload),
    #[serde(rename = "fs/zip")]
    FsZip(FsArgsPayload),
    #[serde(rename = "fs/fetch")]
    FsFetch(FsArgsPayload),
    #[serde(rename = "tweak/socket")]
    TweakSocket(TweakSocketPayload),
    #[serde(rename = "status")]
    Status,
}

impl Action {
    /// The action name as it appears on the wire — used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Spawn(_) => "spawn",
            Action::Kill(_) => "kill",
            Action::ExecMonitor(_) => "exec-monitor",
            Action::ExecRenode(_) => "exec-renode",
            Action::FsList(_) => "fs/list",
            Action::FsStat(_) => "fs/stat",
            Action::FsDwnl(_) => "fs/dwnl",
            Action::FsUpld(_) => "fs/upld",
            Action::FsMkdir(_) => "fs/mkdir",
            Action::FsRemove(_) => "fs/remove",
            Action::FsMove(_) => "fs/move",
            Action::FsCopy(_) => "fs/copy",
            Action::FsZip(_) => "fs/zip",
            Action::FsFetch(_) => "fs/fetch",
            Action::TweakSocket(_) => "tweak/socket",
            Action::Status => "status",
        }
    }
}

/// Request envelope (wire): `{ version, id, action, payload }` (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub version: ProtocolVersion,
    pub id: u64,
    #[serde(flatten)]
    pub action: Action,
}

/// Response envelope (wire): `{ version, id, status, data?, error? }` (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub version: ProtocolVersion,
    pub id: u64,
    #[serde(flatten)]
    pub result: ResponseResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResponseResult {
    Success {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    Failure {
        error: String,
    },
}

impl Response {
    pub fn success(version: ProtocolVersion, id: u64, data: impl Serialize) -> Self {
        let data = serde_json::to_value(data).unwrap_or(Value::Null);
        Response { version, id, result: ResponseResult::Success { data } }
    }

    pub fn failure(version: ProtocolVersion, id: u64, err: ProxyError) -> Self {
        Response {
            version,
            id,
            result: ResponseResult::Failure { error: err.wire_code().to_string() },
        }
    }
}

/// Event envelope (wire): `{ version, event, data }` (§3). Events never carry an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub version: ProtocolVersion,
    pub event: String,
    pub data: Value,
}

/// Known event bodies the control session emits (§4.F).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum EventBody {
    RenodeQuitted {
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    UartOpened {
        port: u16,
        name: String,
        #[serde(rename = "machineName")]
        machine_name: String,
    },
}

impl EventBody {
    pub fn into_event(self, version: ProtocolVersion) -> Event {
        let value = serde_json::to_value(&self)
            .unwrap_or_else(|_| serde_json::json!({"event": "unknown", "data": {}}));
        let event = value["event"].as_str().unwrap_or("unknown").to_string();
        let data = value["data"].clone();
        Event { version, event, data }
    }
}

/// Parse a client request, extracting the envelope `id` on a best-effort
/// basis even when the typed parse fails, so the caller can still reply
/// with the offending id (§3 invariant: "where possible, the offending id").
pub fn parse_request(text: &str) -> Result<Request, (Option<u64>, ProxyError)> {
    let raw: Value = serde_json::from_str(text).map_err(|_| (None, ProxyError::BadRequest))?;
    let id = raw.get("id").and_then(Value::as_u64);
    serde_json::from_value(raw).map_err(|_| (id, ProxyError::BadRequest))
}

pub fn encode_response(resp: &Response) -> String {
    serde_json::to_string(resp).unwrap_or_else(|_| {
        format!(
            r#"{{"version":"{}","id":{},"status":"failure","error":"io"}}"#,
            resp.version, resp.id
        )
    })
}

pub fn encode_event(event: &Event) -> String {
    serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"version":"1.0.0","event":"io","data":{}}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> ProtocolVersion {
        ProtocolVersion { major: 1, minor: 0, patch: 0 }
    }

    #[test]
    fn parses_spawn_request() {
        let text = r#"{"version":"1.0.0","id":1,"action":"spawn","payload":{"name":"renode"}}"#;
        let req = parse_request(text).expect("parses");
        assert_eq!(req.id, 1);
        match req.action {
            Action::Spawn(p) => assert_eq!(p.name, "renode"),
            other => panic!("wrong action: {other:?}"),
        }
    }

    #[test]
    fn parses_fs_args_payload() {
        let text = r#"{"version":"1.0.0","id":2,"action":"fs/upld","payload":{"args":["a/b.bin"],"data":"aGVsbG8="}}"#;
        let req = parse_request(text).expect("parses");
        match req.action {
            Action::FsUpld(p) => {
                assert_eq!(p.arg(0).unwrap(), "a/b.bin");
                assert_eq!(p.data.as_deref(), Some("aGVsbG8="));
            }
            other => panic!("wrong action: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_fails_to_parse() {
        let text = r#"{"version":"1.0.0","id":3,"action":"nonsense","payload":{}}"#;
        let err = parse_request(text).unwrap_err();
        assert_eq!(err, (Some(3), ProxyError::BadRequest));
    }

    #[test]
    fn missing_id_still_rejected_with_id_none() {
        let text = r#"{"version":"1.0.0","action":"status"}"#;
        let err = parse_request(text).unwrap_err();
        assert_eq!(err.0, None);
    }

    #[test]
    fn tolerates_unknown_optional_payload_fields() {
        let text = r#"{"version":"1.0.0","id":4,"action":"kill","payload":{"name":"renode","future_flag":true}}"#;
        let req = parse_request(text).expect("tolerates unknown fields");
        assert!(matches!(req.action, Action::Kill(KillPayload { name }) if name == "renode"));
    }

    #[test]
    fn response_round_trips() {
        let resp = Response::success(v1(), 1, serde_json::json!({}));
        let text = encode_response(&resp);
        let back: Response = serde_json::from_str(&text).expect("round trips");
        assert_eq!(back, resp);
    }

    #[test]
    fn failure_response_carries_wire_code() {
        let resp = Response::failure(v1(), 1, ProxyError::PathEscape);
        let text = encode_response(&resp);
        assert!(text.contains(r#""error":"path-escape""#));
    }

    #[test]
    fn event_body_serializes_with_event_name_and_data() {
        let ev = EventBody::UartOpened {
            port: 4242,
            name: "sysbus.uart0".to_string(),
            machine_name: "m0".to_string(),
        }
        .into_event(v1());
        assert_eq!(ev.event, "uart-opened");
        assert_eq!(ev.data["port"], 4242);
        assert_eq!(ev.data["machineName"], "m0");
        assert!(ev.data.get("machine_name").is_none());
    }

    #[test]
    fn renode_quitted_uses_camel_case_exit_code() {
        let ev = EventBody::RenodeQuitted { exit_code: Some(0), signal: None }.into_event(v1());
        assert_eq!(ev.data["exitCode"], 0);
        assert!(ev.data.get("exit_code").is_none());
    }
}
