// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The one error taxonomy every component maps into before it reaches the wire.

use std::fmt;

/// Error kinds surfaced to clients as the `error` string on a failure response.
///
/// Every component translates its native errors into one of these variants.
/// The `Display` impl is the wire code (§7); it is never the place to put
/// internal detail — use `tracing` for that.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("path-escape")]
    PathEscape,
    #[error("enoent")]
    NotFound,
    #[error("eexist")]
    AlreadyExists,
    #[error("eisdir")]
    IsADirectory,
    #[error("enotdir")]
    NotADirectory,
    #[error("io")]
    Io,
    #[error("fetch-failed")]
    FetchFailed,
    #[error("archive-malformed")]
    ArchiveMalformed,
    #[error("entry-escape")]
    EntryEscape,
    #[error("engine-not-running")]
    EngineNotRunning,
    #[error("engine-busy")]
    EngineBusy,
    #[error("spawn-failed")]
    SpawnFailed,
    #[error("spawn-timeout")]
    SpawnTimeout,
    #[error("timeout")]
    Timeout,
    #[error("version-mismatch")]
    VersionMismatch,
    #[error("bad-request")]
    BadRequest,
    #[error("unsupported-action")]
    UnsupportedAction,
    #[error("busy")]
    Busy,
}

impl ProxyError {
    /// The string placed on the wire in `Response::Failure.error`.
    ///
    /// Identical to `Display`, named separately so call sites reaching for
    /// "what goes on the wire" don't have to know that's also `Display`.
    pub fn wire_code(&self) -> &'static str {
        match self {
            ProxyError::PathEscape => "path-escape",
            ProxyError::NotFound => "enoent",
            ProxyError::AlreadyExists => "eexist",
            ProxyError::IsADirectory => "eisdir",
            ProxyError::NotADirectory => "enotdir",
            ProxyError::Io => "io",
            ProxyError::FetchFailed => "fetch-failed",
            ProxyError::ArchiveMalformed => "archive-malformed",
            ProxyError::EntryEscape => "entry-escape",
            ProxyError::EngineNotRunning => "engine-not-running",
            ProxyError::EngineBusy => "engine-busy",
            ProxyError::SpawnFailed => "spawn-failed",
            ProxyError::SpawnTimeout => "spawn-timeout",
            ProxyError::Timeout => "timeout",
            ProxyError::VersionMismatch => "version-mismatch",
            ProxyError::BadRequest => "bad-request",
            ProxyError::UnsupportedAction => "unsupported-action",
            ProxyError::Busy => "busy",
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => ProxyError::NotFound,
            ErrorKind::AlreadyExists => ProxyError::AlreadyExists,
            _ => ProxyError::Io,
        }
    }
}

/// A `ProxyError` paired with internal context for logging.
///
/// Keeps the OS/library error message out of the wire response while still
/// letting handlers `tracing::warn!(%err, ..)` the full story.
pub struct Context {
    pub kind: ProxyError,
    pub detail: String,
}

impl Context {
    pub fn new(kind: ProxyError, detail: impl fmt::Display) -> Self {
        Self { kind, detail: detail.to_string() }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_matches_display() {
        assert_eq!(ProxyError::PathEscape.wire_code(), ProxyError::PathEscape.to_string());
        assert_eq!(ProxyError::EngineNotRunning.wire_code(), "engine-not-running");
    }

    #[test]
    fn io_error_not_found_maps_to_enoent() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        assert_eq!(ProxyError::from(e), ProxyError::NotFound);
    }

    #[test]
    fn io_error_other_maps_to_io() {
        let e = std::io::Error::other("boom");
        assert_eq!(ProxyError::from(e), ProxyError::Io);
    }
}
