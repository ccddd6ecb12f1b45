// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Path confinement for the filesystem service (§4.A).
//!
//! Every client-supplied path is relative to the session's working
//! directory and must resolve inside it. We canonicalize the deepest
//! existing ancestor and then rejoin the remaining, not-yet-existing
//! segments so that create operations (`mkdir`, `upld`) can name paths
//! that don't exist yet without losing the traversal check.

use std::path::{Component, Path, PathBuf};

use rwp_core::ProxyError;

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// `root` must already exist and be a directory; the caller (main) is
    /// responsible for that check since it happens once at startup.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied relative path to an absolute path inside
    /// `root`, rejecting any attempt to escape it (§4.A, §8 property:
    /// "path-escape attempts never touch the filesystem outside root").
    ///
    /// An empty path resolves to the root itself.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, ProxyError> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Ok(self.root.clone());
        }

        let relative = Path::new(requested);
        if relative.is_absolute() {
            return Err(ProxyError::PathEscape);
        }

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(ProxyError::PathEscape)
                }
            }
        }

        let candidate = self.root.join(&normalized);
        self.confine(&candidate)
    }

    /// Canonicalize the deepest existing ancestor of `candidate` and verify
    /// it (and therefore `candidate`, once created) stays under `root`.
    fn confine(&self, candidate: &Path) -> Result<PathBuf, ProxyError> {
        let canonical_root = self.root.canonicalize().map_err(ProxyError::from)?;

        let mut existing = candidate;
        let mut tail = Vec::new();
        loop {
            match existing.canonicalize() {
                Ok(canonical) => {
                    if !canonical.starts_with(&canonical_root) {
                        return Err(ProxyError::PathEscape);
                    }
                    let mut resolved = canonical;
                    for part in tail.into_iter().rev() {
                        resolved.push(part);
                    }
                    return Ok(resolved);
                }
                Err(_) => {
                    let name = existing.file_name().ok_or(ProxyError::PathEscape)?;
                    tail.push(name.to_owned());
                    match existing.parent() {
                        Some(parent) => existing = parent,
                        None => return Err(ProxyError::PathEscape),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let dir = tempfile::tempdir().expect("tempdir");
        let sandbox = Sandbox::new(dir.path().to_path_buf());
        (dir, sandbox)
    }

    #[test]
    fn empty_path_resolves_to_root() {
        let (dir, sandbox) = sandbox();
        let resolved = sandbox.resolve("").expect("resolves");
        assert_eq!(resolved, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn rejects_parent_traversal() {
        let (_dir, sandbox) = sandbox();
        assert_eq!(sandbox.resolve("../etc/passwd"), Err(ProxyError::PathEscape));
    }

    #[test]
    fn rejects_absolute_path() {
        let (_dir, sandbox) = sandbox();
        assert_eq!(sandbox.resolve("/etc/passwd"), Err(ProxyError::PathEscape));
    }

    #[test]
    fn allows_nonexistent_leaf_for_create_ops() {
        let (_dir, sandbox) = sandbox();
        let resolved = sandbox.resolve("new-file.bin").expect("resolves");
        assert!(resolved.ends_with("new-file.bin"));
    }

    #[test]
    fn allows_nested_nonexistent_path_under_existing_dir() {
        let (dir, sandbox) = sandbox();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let resolved = sandbox.resolve("sub/nested/file.bin").expect("resolves");
        assert!(resolved.ends_with("sub/nested/file.bin"));
    }

    #[test]
    fn symlink_escape_is_rejected() {
        let (dir, sandbox) = sandbox();
        let outside = tempfile::tempdir().expect("outside tempdir");
        let link = dir.path().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();
        assert_eq!(sandbox.resolve("escape/file.bin"), Err(ProxyError::PathEscape));
    }
}
