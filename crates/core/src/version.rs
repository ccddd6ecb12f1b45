// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol version, `MAJOR.MINOR.PATCH`, and the server's compatibility rule.

use std::fmt;
use std::str::FromStr;

/// The version this build of the server advertises.
///
/// Open Question (§9) resolved: we pick the `1.x` line as authoritative, not
/// the legacy `0.0.1`. Clients pinned to `0.0.1` are simply incompatible and
/// get `version-mismatch`, same as any other major-version skew.
pub const SERVER_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0, patch: 0 };

/// A parsed `MAJOR.MINOR.PATCH` version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// §4.F negotiation rule: the server accepts a request iff the major
    /// versions match exactly and the request's minor is no newer than ours.
    /// The server tolerates unknown *optional* payload fields regardless.
    pub fn compatible_with(&self, server: ProtocolVersion) -> bool {
        self.major == server.major && self.minor <= server.minor
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed version string")]
pub struct ParseVersionError;

impl FromStr for ProtocolVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let major = parts.next().ok_or(ParseVersionError)?;
        let minor = parts.next().ok_or(ParseVersionError)?;
        let patch = parts.next().ok_or(ParseVersionError)?;
        Ok(ProtocolVersion {
            major: major.parse().map_err(|_| ParseVersionError)?,
            minor: minor.parse().map_err(|_| ParseVersionError)?,
            patch: patch.parse().map_err(|_| ParseVersionError)?,
        })
    }
}

impl serde::Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_round_trip() {
        let v: ProtocolVersion = "1.2.3".parse().expect("valid version");
        assert_eq!(v, ProtocolVersion { major: 1, minor: 2, patch: 3 });
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn rejects_malformed() {
        assert!("1.2".parse::<ProtocolVersion>().is_err());
        assert!("a.b.c".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn same_major_lower_minor_is_compatible() {
        let req = ProtocolVersion { major: 1, minor: 0, patch: 0 };
        assert!(req.compatible_with(SERVER_VERSION));
    }

    #[test]
    fn newer_minor_is_incompatible() {
        let req = ProtocolVersion { major: 1, minor: 99, patch: 0 };
        assert!(!req.compatible_with(SERVER_VERSION));
    }

    #[test]
    fn different_major_is_incompatible() {
        let req = ProtocolVersion { major: 9, minor: 0, patch: 0 };
        assert!(!req.compatible_with(SERVER_VERSION));
        let legacy = ProtocolVersion { major: 0, minor: 0, patch: 1 };
        assert!(!legacy.compatible_with(SERVER_VERSION));
    }
}
