// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sandboxed filesystem operations exposed over `fs/*` actions (§4.B).

use std::io::Cursor;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use rwp_core::ProxyError;
use serde::Serialize;

use crate::sandbox::Sandbox;

/// One entry of an `fs/list` response (§4.B: `{name, isfile, islink}`).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub isfile: bool,
    pub islink: bool,
}

/// `fs/stat` response (§4.B: `{size, isfile, ctime, mtime}`, times as POSIX
/// seconds).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Stat {
    pub size: u64,
    pub isfile: bool,
    pub ctime: u64,
    pub mtime: u64,
}

static UPLOAD_TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct FsService {
    sandbox: Sandbox,
    http: reqwest::Client,
}

impl FsService {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox, http: reqwest::Client::new() }
    }

    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>, ProxyError> {
        let resolved = self.sandbox.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(ProxyError::from)?;
        if !metadata.is_dir() {
            return Err(ProxyError::NotADirectory);
        }
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&resolved).await.map_err(ProxyError::from)?;
        while let Some(entry) = reader.next_entry().await.map_err(ProxyError::from)? {
            let file_type = entry.file_type().await.map_err(ProxyError::from)?;
            let islink = file_type.is_symlink();
            let isfile = if islink {
                tokio::fs::metadata(entry.path()).await.map(|m| m.is_file()).unwrap_or(false)
            } else {
                file_type.is_file()
            };
            entries.push(DirEntry { name: entry.file_name().to_string_lossy().into_owned(), isfile, islink });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> Result<Stat, ProxyError> {
        let resolved = self.sandbox.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(ProxyError::from)?;
        Ok(Stat {
            size: metadata.len(),
            isfile: metadata.is_file(),
            ctime: metadata.ctime().max(0) as u64,
            mtime: metadata.mtime().max(0) as u64,
        })
    }

    /// Returns the file contents base64-encoded, ready to drop into a
    /// response's `data` field.
    pub async fn download(&self, path: &str) -> Result<String, ProxyError> {
        let resolved = self.sandbox.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(ProxyError::from)?;
        if metadata.is_dir() {
            return Err(ProxyError::IsADirectory);
        }
        let bytes = tokio::fs::read(&resolved).await.map_err(ProxyError::from)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Writes atomically via write-temp-then-rename under the same
    /// directory (§4.B, §9: "an upgrade over an apparent naive write in the
    /// source"). Parent creation is NOT implicit: `enoent` if missing.
    pub async fn upload(&self, path: &str, data_b64: &str) -> Result<(), ProxyError> {
        let resolved = self.sandbox.resolve(path)?;
        let parent = resolved.parent().ok_or(ProxyError::NotFound)?;
        let parent_meta = tokio::fs::metadata(parent).await.map_err(ProxyError::from)?;
        if !parent_meta.is_dir() {
            return Err(ProxyError::NotADirectory);
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .map_err(|_| ProxyError::BadRequest)?;

        let file_name = resolved.file_name().ok_or(ProxyError::BadRequest)?;
        let counter = UPLOAD_TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = parent.join(format!(
            ".{}.tmp-{}-{counter}",
            file_name.to_string_lossy(),
            std::process::id()
        ));
        tokio::fs::write(&tmp_path, &bytes).await.map_err(ProxyError::from)?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &resolved).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(ProxyError::from(err));
        }
        Ok(())
    }

    /// Idempotent when `path` is already a directory (§8 property: "mkdir
    /// is idempotent"); `eexist` if it already exists as a non-directory
    /// (e.g. after `fs/upld` wrote a file there).
    pub async fn mkdir(&self, path: &str) -> Result<(), ProxyError> {
        let resolved = self.sandbox.resolve(path)?;
        if let Ok(metadata) = tokio::fs::metadata(&resolved).await {
            return if metadata.is_dir() { Ok(()) } else { Err(ProxyError::AlreadyExists) };
        }
        tokio::fs::create_dir_all(&resolved).await.map_err(ProxyError::from)
    }

    pub async fn remove(&self, path: &str) -> Result<(), ProxyError> {
        let resolved = self.sandbox.resolve(path)?;
        let metadata = tokio::fs::metadata(&resolved).await.map_err(ProxyError::from)?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&resolved).await.map_err(ProxyError::from)
        } else {
            tokio::fs::remove_file(&resolved).await.map_err(ProxyError::from)
        }
    }

    pub async fn move_path(&self, from: &str, to: &str) -> Result<(), ProxyError> {
        let from = self.sandbox.resolve(from)?;
        let to = self.sandbox.resolve(to)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ProxyError::from)?;
        }
        tokio::fs::rename(&from, &to).await.map_err(ProxyError::from)
    }

    pub async fn copy_path(&self, from: &str, to: &str) -> Result<(), ProxyError> {
        let from = self.sandbox.resolve(from)?;
        let to = self.sandbox.resolve(to)?;
        let metadata = tokio::fs::metadata(&from).await.map_err(ProxyError::from)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ProxyError::from)?;
        }
        if metadata.is_dir() {
            copy_dir_recursive(&from, &to).await
        } else {
            tokio::fs::copy(&from, &to).await.map_err(ProxyError::from)?;
            Ok(())
        }
    }

    /// Download a single file from `url` into root; the filename comes from
    /// the URL path, with `-1`, `-2`, … suffixed on collision (§4.B
    /// `fs/fetch`). Returns the root-relative path written.
    pub async fn fetch(&self, url: &str) -> Result<String, ProxyError> {
        let bytes = self.http_get(url).await?;
        let filename = filename_from_url(url)?;
        let root = self.sandbox.resolve("")?;
        let dest = unique_path(&root, &filename).await?;
        tokio::fs::write(&dest, bytes).await.map_err(ProxyError::from)?;
        Ok(relative_to(&root, &dest))
    }

    /// Download a zip archive from `url` and extract it under a
    /// URL-derived, collision-suffixed directory in root (§4.B `fs/zip`).
    /// Every archive entry is sandbox-checked individually before
    /// extraction; a path-escaping entry aborts the whole operation (§9
    /// design note: this is stricter than some archivers' default and is a
    /// deliberate deviation, not an oversight). Returns the root-relative
    /// extraction directory.
    pub async fn fetch_and_extract(&self, url: &str) -> Result<String, ProxyError> {
        let bytes = self.http_get(url).await?;
        let filename = filename_from_url(url)?;
        let stem = filename.strip_suffix(".zip").unwrap_or(&filename);
        let root = self.sandbox.resolve("")?;
        let dest_root = unique_path(&root, stem).await?;
        tokio::fs::create_dir_all(&dest_root).await.map_err(ProxyError::from)?;

        let canonical_dest = dest_root.canonicalize().map_err(ProxyError::from)?;
        tokio::task::spawn_blocking(move || extract_zip(&bytes, &canonical_dest))
            .await
            .map_err(|_| ProxyError::Io)??;
        Ok(relative_to(&root, &dest_root))
    }

    async fn http_get(&self, url: &str) -> Result<Vec<u8>, ProxyError> {
        let response = self.http.get(url).send().await.map_err(|_| ProxyError::FetchFailed)?;
        if !response.status().is_success() {
            return Err(ProxyError::FetchFailed);
        }
        response.bytes().await.map(|b| b.to_vec()).map_err(|_| ProxyError::FetchFailed)
    }
}

/// Derive a destination filename from the last non-empty path segment of
/// `url`, falling back to a generic name for URLs with no path (§4.B).
fn filename_from_url(url: &str) -> Result<String, ProxyError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| ProxyError::FetchFailed)?;
    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string();
    Ok(name)
}

/// `root/name`, or `root/name-1`, `root/name-2`, … for the first name with
/// no existing entry (§4.B: "collisions suffixed `-1`, `-2`, …").
async fn unique_path(root: &Path, name: &str) -> Result<PathBuf, ProxyError> {
    let candidate = root.join(name);
    if tokio::fs::symlink_metadata(&candidate).await.is_err() {
        return Ok(candidate);
    }
    for n in 1..10_000u32 {
        let candidate = root.join(format!("{name}-{n}"));
        if tokio::fs::symlink_metadata(&candidate).await.is_err() {
            return Ok(candidate);
        }
    }
    Err(ProxyError::Io)
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).to_string_lossy().into_owned()
}

fn extract_zip(bytes: &[u8], dest_root: &Path) -> Result<(), ProxyError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|_| ProxyError::ArchiveMalformed)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|_| ProxyError::ArchiveMalformed)?;
        let name = entry.enclosed_name().ok_or(ProxyError::EntryEscape)?;
        let out_path = dest_root.join(&name);
        if !out_path.starts_with(dest_root) {
            return Err(ProxyError::EntryEscape);
        }
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(ProxyError::from)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(ProxyError::from)?;
        }
        let mut out_file = std::fs::File::create(&out_path).map_err(ProxyError::from)?;
        std::io::copy(&mut entry, &mut out_file).map_err(ProxyError::from)?;
    }
    Ok(())
}

fn copy_dir_recursive<'a>(
    from: &'a Path,
    to: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ProxyError>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(to).await.map_err(ProxyError::from)?;
        let mut reader = tokio::fs::read_dir(from).await.map_err(ProxyError::from)?;
        while let Some(entry) = reader.next_entry().await.map_err(ProxyError::from)? {
            let meta = entry.metadata().await.map_err(ProxyError::from)?;
            let src = entry.path();
            let dst: PathBuf = to.join(entry.file_name());
            if meta.is_dir() {
                copy_dir_recursive(&src, &dst).await?;
            } else {
                tokio::fs::copy(&src, &dst).await.map_err(ProxyError::from)?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, FsService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = FsService::new(Sandbox::new(dir.path().to_path_buf()));
        (dir, service)
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let (_dir, svc) = service();
        svc.mkdir("nested").await.expect("mkdir parent");
        let data = base64::engine::general_purpose::STANDARD.encode(b"hello world");
        svc.upload("nested/file.bin", &data).await.expect("upload");
        let back = svc.download("nested/file.bin").await.expect("download");
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn upload_without_parent_is_enoent() {
        let (_dir, svc) = service();
        let data = base64::engine::general_purpose::STANDARD.encode(b"hello");
        assert_eq!(
            svc.upload("missing-dir/file.bin", &data).await.unwrap_err(),
            ProxyError::NotFound
        );
    }

    #[tokio::test]
    async fn mkdir_is_idempotent() {
        let (_dir, svc) = service();
        svc.mkdir("a/b/c").await.expect("first mkdir");
        svc.mkdir("a/b/c").await.expect("second mkdir does not fail");
    }

    #[tokio::test]
    async fn mkdir_over_an_existing_file_is_eexist() {
        let (_dir, svc) = service();
        let data = base64::engine::general_purpose::STANDARD.encode(b"x");
        svc.upload("p", &data).await.unwrap();
        assert_eq!(svc.mkdir("p").await.unwrap_err(), ProxyError::AlreadyExists);
    }

    #[tokio::test]
    async fn list_rejects_non_directory() {
        let (dir, svc) = service();
        tokio::fs::write(dir.path().join("f.txt"), b"x").await.unwrap();
        assert_eq!(svc.list("f.txt").await.unwrap_err(), ProxyError::NotADirectory);
    }

    #[tokio::test]
    async fn move_then_back_round_trips() {
        let (_dir, svc) = service();
        let data = base64::engine::general_purpose::STANDARD.encode(b"payload");
        svc.upload("a.bin", &data).await.unwrap();
        svc.move_path("a.bin", "b.bin").await.expect("move");
        assert_eq!(svc.download("b.bin").await.unwrap(), data);
        svc.move_path("b.bin", "a.bin").await.expect("move back");
        assert_eq!(svc.download("a.bin").await.unwrap(), data);
    }

    #[tokio::test]
    async fn remove_nonexistent_is_enoent() {
        let (_dir, svc) = service();
        assert_eq!(svc.remove("missing").await.unwrap_err(), ProxyError::NotFound);
    }

    #[tokio::test]
    async fn stat_reports_size_and_kind() {
        let (_dir, svc) = service();
        let data = base64::engine::general_purpose::STANDARD.encode(b"12345");
        svc.upload("sized.bin", &data).await.unwrap();
        let stat = svc.stat("sized.bin").await.unwrap();
        assert!(stat.isfile);
        assert_eq!(stat.size, 5);
    }

    #[tokio::test]
    async fn list_reports_isfile_and_islink() {
        let (dir, svc) = service();
        tokio::fs::write(dir.path().join("plain.txt"), b"x").await.unwrap();
        let entries = svc.list("").await.unwrap();
        let plain = entries.iter().find(|e| e.name == "plain.txt").expect("entry present");
        assert!(plain.isfile);
        assert!(!plain.islink);
    }

    #[tokio::test]
    async fn fetch_derives_filename_and_suffixes_collisions() {
        let (dir, svc) = service();
        tokio::fs::write(dir.path().join("asset.bin"), b"old").await.unwrap();
        let name = filename_from_url("https://example.com/path/asset.bin").unwrap();
        assert_eq!(name, "asset.bin");
        let unique = unique_path(dir.path(), &name).await.unwrap();
        assert_eq!(unique.file_name().unwrap(), "asset.bin-1");
    }
}
