// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Sandboxed Volume Filesystem
//!
//! Filesystem access rooted at a server volume's host mount point. Every path
//! is resolved through a `cap_std::fs::Dir` handle, which walks components
//! with `openat` semantics and refuses any resolution (`..`, absolute symlink
//! targets, symlinks pointing upwards) that would leave the root.
//!
//! **Architecture Context:**
//! Paths arriving here are already normalized by
//! [`PathSanitizer`](crate::domain::path_sanitizer::PathSanitizer) and cleared
//! by the blueprint's file policy. This module only knows about bytes and
//! directories; it never sees callers or policies.
//!
//! All operations run on the blocking pool.

use cap_std::ambient_authority;
use cap_std::fs::{Dir, OpenOptions};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::domain::path_sanitizer::PathSanitizer;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Invalid move or copy: {0}")]
    InvalidMove(String),

    /// Includes resolutions that would escape the root
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl SandboxError {
    fn from_io(err: io::Error, path: &Path) -> Self {
        let shown = PathSanitizer::display(path);
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(shown),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(shown),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(format!("{}: {}", shown, err)),
            _ => Self::Io(format!("{}: {}", shown, err)),
        }
    }
}

/// A file or directory inside a server volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Root-relative path as shown to callers, e.g. `/world/level.dat`
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Handle to one server volume.
#[derive(Clone)]
pub struct SandboxedRoot {
    dir: Arc<Dir>,
    host_path: PathBuf,
}

impl std::fmt::Debug for SandboxedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedRoot")
            .field("host_path", &self.host_path)
            .finish()
    }
}

/// cap-std addresses the root itself as `.`.
fn at(rel: &Path) -> &Path {
    if rel.as_os_str().is_empty() {
        Path::new(".")
    } else {
        rel
    }
}

fn is_symlink(dir: &Dir, rel: &Path) -> bool {
    dir.symlink_metadata(rel)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

fn entry_for(rel: &Path, meta: &cap_std::fs::Metadata) -> FileEntry {
    let modified = meta
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t.into_std()));
    FileEntry {
        path: PathSanitizer::display(rel),
        name: rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        is_directory: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified,
    }
}

impl SandboxedRoot {
    /// Open the volume mount point as a confined root.
    pub fn open(host_path: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let host_path = host_path.into();
        let dir = Dir::open_ambient_dir(&host_path, ambient_authority())
            .map_err(|e| SandboxError::Io(format!("cannot open volume {}: {}", host_path.display(), e)))?;
        Ok(Self {
            dir: Arc::new(dir),
            host_path,
        })
    }

    pub fn host_path(&self) -> &Path {
        &self.host_path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SandboxError>
    where
        T: Send + 'static,
        F: FnOnce(&Dir) -> Result<T, SandboxError> + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || f(&dir))
            .await
            .map_err(|e| SandboxError::Io(format!("filesystem task failed: {}", e)))?
    }

    /// `rel` with every symlink along its existing prefix resolved inside the
    /// root. Components that do not exist yet are appended unchanged.
    pub async fn resolve_links(&self, rel: PathBuf) -> Result<PathBuf, SandboxError> {
        self.blocking(move |dir| {
            let mut existing = rel.clone();
            let mut missing = Vec::new();
            loop {
                match dir.canonicalize(at(&existing)) {
                    Ok(real) => {
                        let mut resolved: PathBuf = real
                            .components()
                            .filter(|c| matches!(c, Component::Normal(_)))
                            .collect();
                        resolved.extend(missing.iter().rev());
                        return Ok(resolved);
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => match existing.file_name() {
                        Some(_) if is_symlink(dir, &existing) => {
                            return Err(SandboxError::PermissionDenied(format!(
                                "{}: dangling symlink",
                                PathSanitizer::display(&existing)
                            )));
                        }
                        Some(name) => {
                            missing.push(name.to_os_string());
                            existing.pop();
                        }
                        None => return Ok(rel),
                    },
                    Err(e) => return Err(SandboxError::from_io(e, &rel)),
                }
            }
        })
        .await
    }

    pub async fn stat(&self, rel: PathBuf) -> Result<FileEntry, SandboxError> {
        self.blocking(move |dir| {
            let meta = dir.metadata(at(&rel)).map_err(|e| SandboxError::from_io(e, &rel))?;
            Ok(entry_for(&rel, &meta))
        })
        .await
    }

    /// Entries directly under `rel` for which `visible` holds.
    pub async fn list<V>(&self, rel: PathBuf, visible: V) -> Result<Vec<FileEntry>, SandboxError>
    where
        V: Fn(&Path) -> bool + Send + 'static,
    {
        self.blocking(move |dir| {
            let meta = dir.metadata(at(&rel)).map_err(|e| SandboxError::from_io(e, &rel))?;
            if !meta.is_dir() {
                return Err(SandboxError::NotDirectory(PathSanitizer::display(&rel)));
            }
            let mut entries = Vec::new();
            for entry in dir.read_dir(at(&rel)).map_err(|e| SandboxError::from_io(e, &rel))? {
                let entry = entry.map_err(|e| SandboxError::from_io(e, &rel))?;
                let child = rel.join(entry.file_name());
                if !visible(&child) {
                    continue;
                }
                // dangling or escaping symlinks are listed via their own metadata
                let meta = match dir.metadata(&child) {
                    Ok(meta) => meta,
                    Err(_) => dir
                        .symlink_metadata(&child)
                        .map_err(|e| SandboxError::from_io(e, &child))?,
                };
                entries.push(entry_for(&child, &meta));
            }
            entries.sort_by(|a, b| b.is_directory.cmp(&a.is_directory).then(a.name.cmp(&b.name)));
            Ok(entries)
        })
        .await
    }

    pub async fn read(&self, rel: PathBuf) -> Result<Vec<u8>, SandboxError> {
        self.blocking(move |dir| {
            let meta = dir.metadata(at(&rel)).map_err(|e| SandboxError::from_io(e, &rel))?;
            if meta.is_dir() {
                return Err(SandboxError::IsDirectory(PathSanitizer::display(&rel)));
            }
            dir.read(&rel).map_err(|e| SandboxError::from_io(e, &rel))
        })
        .await
    }

    /// Create or truncate; new files get mode 0644.
    pub async fn write(&self, rel: PathBuf, content: Vec<u8>) -> Result<(), SandboxError> {
        self.write_with_mode(rel, content, 0o644).await
    }

    pub async fn write_with_mode(
        &self,
        rel: PathBuf,
        content: Vec<u8>,
        mode: u32,
    ) -> Result<(), SandboxError> {
        self.blocking(move |dir| {
            if rel.as_os_str().is_empty() || dir.is_dir(&rel) {
                return Err(SandboxError::IsDirectory(PathSanitizer::display(&rel)));
            }
            let existed = dir.exists(&rel);
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            let file = dir
                .open_with(&rel, &options)
                .map_err(|e| SandboxError::from_io(e, &rel))?;
            let mut file = file.into_std();
            if !existed {
                file.set_permissions(std::fs::Permissions::from_mode(mode))
                    .map_err(|e| SandboxError::from_io(e, &rel))?;
            }
            io::Write::write_all(&mut file, &content).map_err(|e| SandboxError::from_io(e, &rel))?;
            file.sync_all().map_err(|e| SandboxError::from_io(e, &rel))
        })
        .await
    }

    /// Remove a file, a symlink, or a directory with its contents.
    pub async fn delete(&self, rel: PathBuf) -> Result<(), SandboxError> {
        self.blocking(move |dir| {
            if rel.as_os_str().is_empty() {
                return Err(SandboxError::PermissionDenied("cannot delete the server root".into()));
            }
            let meta = dir
                .symlink_metadata(&rel)
                .map_err(|e| SandboxError::from_io(e, &rel))?;
            if meta.is_dir() {
                dir.remove_dir_all(&rel)
            } else {
                dir.remove_file(&rel)
            }
            .map_err(|e| SandboxError::from_io(e, &rel))
        })
        .await
    }

    /// Create `rel` and any missing parents, one segment at a time.
    pub async fn create_dir_all(&self, rel: PathBuf) -> Result<(), SandboxError> {
        self.blocking(move |dir| create_dir_walk(dir, &rel)).await
    }

    /// Total size in bytes of regular files under `rel`. Symlinks are not
    /// followed.
    pub async fn dir_size(&self, rel: PathBuf) -> Result<u64, SandboxError> {
        self.blocking(move |dir| size_of(dir, &rel)).await
    }

    pub async fn copy(&self, src: PathBuf, dst: PathBuf) -> Result<(), SandboxError> {
        self.blocking(move |dir| {
            check_transfer(&src, &dst)?;
            if src == dst {
                return Ok(());
            }
            copy_recursive(dir, &src, &dst)
        })
        .await
    }

    /// Rename within the volume. Falls back to copy-then-delete when the
    /// rename crosses a device boundary; a crash between the copy and the
    /// delete of that fallback leaves both trees in place.
    pub async fn rename(&self, src: PathBuf, dst: PathBuf) -> Result<(), SandboxError> {
        self.blocking(move |dir| {
            check_transfer(&src, &dst)?;
            if src == dst {
                return Ok(());
            }
            if dir.exists(&dst) {
                return Err(SandboxError::AlreadyExists(PathSanitizer::display(&dst)));
            }
            match dir.rename(&src, dir, &dst) {
                Ok(()) => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                    tracing::debug!(src = %src.display(), dst = %dst.display(), "Rename crosses devices, copying");
                    copy_recursive(dir, &src, &dst)?;
                    let meta = dir
                        .symlink_metadata(&src)
                        .map_err(|e| SandboxError::from_io(e, &src))?;
                    if meta.is_dir() {
                        dir.remove_dir_all(&src)
                    } else {
                        dir.remove_file(&src)
                    }
                    .map_err(|e| SandboxError::from_io(e, &src))
                }
                Err(e) => Err(SandboxError::from_io(e, &src)),
            }
        })
        .await
    }

    /// Permission bits (`0o777` mask).
    pub async fn permissions(&self, rel: PathBuf) -> Result<u32, SandboxError> {
        self.blocking(move |dir| {
            let file = open_any(dir, &rel)?;
            let meta = file.metadata().map_err(|e| SandboxError::from_io(e, &rel))?;
            Ok(meta.permissions().mode() & 0o777)
        })
        .await
    }

    pub async fn set_permissions(&self, rel: PathBuf, mode: u32) -> Result<(), SandboxError> {
        self.blocking(move |dir| {
            let file = open_any(dir, &rel)?;
            file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| SandboxError::from_io(e, &rel))
        })
        .await
    }

    /// Entries under `rel` whose name contains `query` (case-insensitive).
    /// Subtrees for which `visible` fails are skipped entirely.
    pub async fn search<V>(
        &self,
        rel: PathBuf,
        query: String,
        visible: V,
    ) -> Result<Vec<FileEntry>, SandboxError>
    where
        V: Fn(&Path) -> bool + Send + 'static,
    {
        self.blocking(move |dir| {
            let needle = query.to_lowercase();
            let mut found = Vec::new();
            search_walk(dir, &rel, &needle, &visible, &mut found)?;
            Ok(found)
        })
        .await
    }
}

fn check_transfer(src: &Path, dst: &Path) -> Result<(), SandboxError> {
    if src.as_os_str().is_empty() {
        return Err(SandboxError::InvalidMove("the server root cannot be moved or copied".into()));
    }
    if dst.starts_with(src) && dst != src {
        return Err(SandboxError::InvalidMove(format!(
            "{} is inside {}",
            PathSanitizer::display(dst),
            PathSanitizer::display(src)
        )));
    }
    Ok(())
}

/// Open a file or directory for metadata operations on its descriptor.
fn open_any(dir: &Dir, rel: &Path) -> Result<std::fs::File, SandboxError> {
    let meta = dir.metadata(at(rel)).map_err(|e| SandboxError::from_io(e, rel))?;
    if meta.is_dir() {
        let sub = dir.open_dir(at(rel)).map_err(|e| SandboxError::from_io(e, rel))?;
        Ok(sub.into_std_file())
    } else {
        let file = dir.open(rel).map_err(|e| SandboxError::from_io(e, rel))?;
        Ok(file.into_std())
    }
}

fn create_dir_walk(dir: &Dir, rel: &Path) -> Result<(), SandboxError> {
    let mut current = PathBuf::new();
    for segment in rel.components() {
        current.push(segment);
        match dir.create_dir(&current) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !dir.is_dir(&current) {
                    return Err(SandboxError::NotDirectory(PathSanitizer::display(&current)));
                }
            }
            Err(e) => return Err(SandboxError::from_io(e, &current)),
        }
    }
    Ok(())
}

fn size_of(dir: &Dir, rel: &Path) -> Result<u64, SandboxError> {
    let meta = dir
        .symlink_metadata(at(rel))
        .map_err(|e| SandboxError::from_io(e, rel))?;
    if !meta.is_dir() {
        return Ok(if meta.is_file() { meta.len() } else { 0 });
    }
    let mut total = 0u64;
    for entry in dir.read_dir(at(rel)).map_err(|e| SandboxError::from_io(e, rel))? {
        let entry = entry.map_err(|e| SandboxError::from_io(e, rel))?;
        total += size_of(dir, &rel.join(entry.file_name()))?;
    }
    Ok(total)
}

fn copy_file(dir: &Dir, src: &Path, dst: &Path) -> Result<(), SandboxError> {
    let mut from = dir.open(src).map_err(|e| SandboxError::from_io(e, src))?;
    let mut to = dir.create(dst).map_err(|e| SandboxError::from_io(e, dst))?;
    io::copy(&mut from, &mut to).map_err(|e| SandboxError::from_io(e, dst))?;
    to.sync_all().map_err(|e| SandboxError::from_io(e, dst))
}

fn copy_recursive(dir: &Dir, src: &Path, dst: &Path) -> Result<(), SandboxError> {
    let meta = dir
        .symlink_metadata(src)
        .map_err(|e| SandboxError::from_io(e, src))?;
    if meta.is_dir() {
        create_dir_walk(dir, dst)?;
        for entry in dir.read_dir(src).map_err(|e| SandboxError::from_io(e, src))? {
            let entry = entry.map_err(|e| SandboxError::from_io(e, src))?;
            let name = entry.file_name();
            copy_recursive(dir, &src.join(&name), &dst.join(&name))?;
        }
        Ok(())
    } else if meta.is_file() {
        copy_file(dir, src, dst)
    } else {
        tracing::debug!(path = %src.display(), "Skipping non-regular file during copy");
        Ok(())
    }
}

fn search_walk<V>(
    dir: &Dir,
    rel: &Path,
    needle: &str,
    visible: &V,
    found: &mut Vec<FileEntry>,
) -> Result<(), SandboxError>
where
    V: Fn(&Path) -> bool,
{
    for entry in dir.read_dir(at(rel)).map_err(|e| SandboxError::from_io(e, rel))? {
        let entry = entry.map_err(|e| SandboxError::from_io(e, rel))?;
        let child = rel.join(entry.file_name());
        if !visible(&child) {
            continue;
        }
        let meta = dir
            .symlink_metadata(&child)
            .map_err(|e| SandboxError::from_io(e, &child))?;
        if entry.file_name().to_string_lossy().to_lowercase().contains(needle) {
            found.push(entry_for(&child, &meta));
        }
        if meta.is_dir() {
            search_walk(dir, &child, needle, visible, found)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root() -> (TempDir, SandboxedRoot) {
        let tmp = TempDir::new().unwrap();
        let root = SandboxedRoot::open(tmp.path()).unwrap();
        (tmp, root)
    }

    #[tokio::test]
    async fn test_write_read_and_stat() {
        let (tmp, root) = root();
        root.write("eula.txt".into(), b"eula=true".to_vec()).await.unwrap();
        assert_eq!(root.read("eula.txt".into()).await.unwrap(), b"eula=true");
        assert_eq!(std::fs::read(tmp.path().join("eula.txt")).unwrap(), b"eula=true");

        let entry = root.stat("eula.txt".into()).await.unwrap();
        assert_eq!(entry.path, "/eula.txt");
        assert_eq!(entry.size, 9);
        assert!(!entry.is_directory);
        assert_eq!(root.permissions("eula.txt".into()).await.unwrap(), 0o644);
    }

    #[tokio::test]
    async fn test_read_directory_is_rejected() {
        let (_tmp, root) = root();
        root.create_dir_all("world".into()).await.unwrap();
        assert!(matches!(root.read("world".into()).await, Err(SandboxError::IsDirectory(_))));
    }

    #[tokio::test]
    async fn test_create_dir_walk_and_size() {
        let (tmp, root) = root();
        root.create_dir_all("a/b/c".into()).await.unwrap();
        root.create_dir_all("a/b".into()).await.unwrap();
        assert!(tmp.path().join("a/b/c").is_dir());

        root.write("a/one".into(), vec![0; 100]).await.unwrap();
        root.write("a/b/c/two".into(), vec![0; 50]).await.unwrap();
        assert_eq!(root.dir_size("a".into()).await.unwrap(), 150);
        assert_eq!(root.dir_size(PathBuf::new()).await.unwrap(), 150);

        root.write("file".into(), vec![1]).await.unwrap();
        assert!(matches!(
            root.create_dir_all("file/sub".into()).await,
            Err(SandboxError::NotDirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_symlink_escape_is_refused() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"host data").unwrap();
        let (tmp, root) = root();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), tmp.path().join("direct")).unwrap();

        assert!(root.read("link/secret".into()).await.is_err());
        assert!(root.read("direct".into()).await.is_err());
        assert!(root.write("link/planted".into(), b"x".to_vec()).await.is_err());
        assert!(!outside.path().join("planted").exists());
        assert!(root.set_permissions("direct".into(), 0o777).await.is_err());
    }

    #[tokio::test]
    async fn test_relative_symlink_up_is_refused() {
        let (tmp, root) = root();
        std::os::unix::fs::symlink("../../../../etc", tmp.path().join("up")).unwrap();
        assert!(root.read("up/passwd".into()).await.is_err());
        assert!(root.list("up".into(), |_| true).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_links_follows_aliases_inside_root() {
        let (tmp, root) = root();
        root.create_dir_all("config/real".into()).await.unwrap();
        root.write("secret.key".into(), b"k".to_vec()).await.unwrap();
        std::os::unix::fs::symlink("secret.key", tmp.path().join("alias")).unwrap();
        std::os::unix::fs::symlink("config/real", tmp.path().join("short")).unwrap();
        std::os::unix::fs::symlink("gone", tmp.path().join("dangling")).unwrap();

        assert_eq!(root.resolve_links("alias".into()).await.unwrap(), PathBuf::from("secret.key"));
        assert_eq!(
            root.resolve_links("short/new/file.yml".into()).await.unwrap(),
            PathBuf::from("config/real/new/file.yml")
        );
        assert_eq!(root.resolve_links(PathBuf::new()).await.unwrap(), PathBuf::new());
        assert_eq!(root.resolve_links("plain/missing".into()).await.unwrap(), PathBuf::from("plain/missing"));
        assert!(matches!(
            root.resolve_links("dangling".into()).await,
            Err(SandboxError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let (tmp, root) = root();
        root.create_dir_all("plugins/conf".into()).await.unwrap();
        root.write("plugins/a.jar".into(), b"jar".to_vec()).await.unwrap();
        root.write("plugins/conf/a.yml".into(), b"k: v".to_vec()).await.unwrap();

        root.copy("plugins".into(), "backup".into()).await.unwrap();
        assert_eq!(std::fs::read(tmp.path().join("backup/conf/a.yml")).unwrap(), b"k: v");
        assert!(tmp.path().join("plugins/a.jar").exists());

        root.rename("backup".into(), "moved".into()).await.unwrap();
        assert!(!tmp.path().join("backup").exists());
        assert_eq!(std::fs::read(tmp.path().join("moved/a.jar")).unwrap(), b"jar");

        root.rename("moved".into(), "moved".into()).await.unwrap();
        assert!(matches!(
            root.copy("plugins".into(), "plugins/inner".into()).await,
            Err(SandboxError::InvalidMove(_))
        ));
        assert!(matches!(
            root.rename("moved".into(), "plugins".into()).await,
            Err(SandboxError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_list_search_and_delete() {
        let (_tmp, root) = root();
        root.create_dir_all("world/region".into()).await.unwrap();
        root.write("world/region/r.0.0.mca".into(), vec![0]).await.unwrap();
        root.write("server.properties".into(), vec![0]).await.unwrap();
        root.create_dir_all("secrets".into()).await.unwrap();
        root.write("secrets/region.key".into(), vec![0]).await.unwrap();

        let listed = root
            .list(PathBuf::new(), |p| !p.starts_with("secrets"))
            .await
            .unwrap();
        let names: Vec<&str> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["world", "server.properties"]);

        let found = root
            .search(PathBuf::new(), "REGION".into(), |p| !p.starts_with("secrets"))
            .await
            .unwrap();
        let paths: Vec<&str> = found.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/world/region"]);

        root.delete("world".into()).await.unwrap();
        assert!(matches!(root.stat("world".into()).await, Err(SandboxError::NotFound(_))));
        assert!(root.delete(PathBuf::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_set_permissions() {
        let (_tmp, root) = root();
        root.write("start.sh".into(), b"#!/bin/sh".to_vec()).await.unwrap();
        root.set_permissions("start.sh".into(), 0o755).await.unwrap();
        assert_eq!(root.permissions("start.sh".into()).await.unwrap(), 0o755);
    }
}
