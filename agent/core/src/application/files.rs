// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server file access.
//!
//! [`FileService::open`] resolves a caller's view of a server volume: the
//! access guard is consulted, the volume mount point is opened as a confined
//! root, and the blueprint's blocked-file list becomes the policy every
//! operation on the returned [`ServerVolume`] is checked against.

use metrics::counter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::application::error::ServiceError;
use crate::domain::access::{AccessGuard, Caller};
use crate::domain::engine::ContainerEngine;
use crate::domain::file_policy::{FileOp, FilePolicy};
use crate::domain::path_sanitizer::PathSanitizer;
use crate::domain::repository::{BlueprintRepository, ServerRepository};
use crate::domain::server::ServerId;
use crate::infrastructure::sandbox::{FileEntry, SandboxedRoot};

pub struct FileService {
    engine: Arc<dyn ContainerEngine>,
    servers: Arc<dyn ServerRepository>,
    blueprints: Arc<dyn BlueprintRepository>,
    guard: Arc<dyn AccessGuard>,
    sanitizer: PathSanitizer,
}

impl FileService {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        servers: Arc<dyn ServerRepository>,
        blueprints: Arc<dyn BlueprintRepository>,
        guard: Arc<dyn AccessGuard>,
    ) -> Self {
        Self {
            engine,
            servers,
            blueprints,
            guard,
            sanitizer: PathSanitizer::new(),
        }
    }

    /// Open the volume of `sid` on behalf of `caller`.
    ///
    /// A server whose blueprint is missing from the local cache cannot be
    /// opened: without the blocked-file list there is no policy to enforce.
    pub async fn open(&self, caller: &Caller, sid: &ServerId) -> Result<ServerVolume, ServiceError> {
        self.guard.check_access(caller, sid).await?;
        let server = self
            .servers
            .find_by_id(sid)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("server {}", sid)))?;
        let blueprint = self
            .blueprints
            .find_by_id(&server.blueprint_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("blueprint {}", server.blueprint_id)))?;

        let volume = self.engine.inspect_volume(&sid.engine_name()).await?;
        let root = SandboxedRoot::open(&volume.mountpoint)?;
        debug!(sid = %sid, root = %volume.mountpoint.display(), "Opened server volume");

        Ok(ServerVolume {
            root,
            policy: Arc::new(blueprint.file_policy()),
            sanitizer: self.sanitizer.clone(),
        })
    }
}

/// One caller's handle on one server volume.
#[derive(Debug, Clone)]
pub struct ServerVolume {
    root: SandboxedRoot,
    policy: Arc<FilePolicy>,
    sanitizer: PathSanitizer,
}

fn count(operation: &'static str) {
    counter!("hearth_file_operations_total", "operation" => operation).increment(1);
}

impl ServerVolume {
    pub fn new(root: SandboxedRoot, policy: FilePolicy) -> Self {
        Self {
            root,
            policy: Arc::new(policy),
            sanitizer: PathSanitizer::new(),
        }
    }

    /// Normalize `path` and clear it against the policy under both its
    /// lexical name and its symlink-resolved name, so an alias planted inside
    /// the volume cannot reach a blocked file.
    ///
    /// Operations that follow links act on the resolved path. Delete and move
    /// act on the link itself. A link swapped between the check and the
    /// operation is not caught here; the sandbox still confines it to the root.
    async fn resolve(&self, path: &str, op: FileOp) -> Result<PathBuf, ServiceError> {
        let rel = self.sanitizer.normalize(path)?;
        self.policy.check(&rel, op)?;
        let real = self.root.resolve_links(rel.clone()).await?;
        if real == rel {
            return Ok(rel);
        }
        self.policy.check(&real, op)?;
        match op {
            FileOp::Delete | FileOp::MoveFrom | FileOp::WriteInto => Ok(rel),
            _ => Ok(real),
        }
    }

    fn visibility(&self) -> impl Fn(&Path) -> bool + Send + 'static {
        let policy = self.policy.clone();
        move |path: &Path| policy.is_visible(path)
    }

    pub async fn stat(&self, path: &str) -> Result<FileEntry, ServiceError> {
        count("stat");
        let rel = self.resolve(path, FileOp::Inspect).await?;
        Ok(self.root.stat(rel).await?)
    }

    /// Directory listing with hidden entries left out.
    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>, ServiceError> {
        count("list");
        let rel = self.resolve(path, FileOp::Inspect).await?;
        Ok(self.root.list(rel, self.visibility()).await?)
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, ServiceError> {
        count("read");
        let rel = self.resolve(path, FileOp::Read).await?;
        Ok(self.root.read(rel).await?)
    }

    pub async fn write(&self, path: &str, content: Vec<u8>) -> Result<(), ServiceError> {
        count("write");
        let rel = self.resolve(path, FileOp::Write).await?;
        Ok(self.root.write(rel, content).await?)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ServiceError> {
        count("delete");
        let rel = self.resolve(path, FileOp::Delete).await?;
        Ok(self.root.delete(rel).await?)
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), ServiceError> {
        count("create_directory");
        let rel = self.resolve(path, FileOp::Write).await?;
        Ok(self.root.create_dir_all(rel).await?)
    }

    /// Bytes used by regular files under `path`.
    pub async fn directory_size(&self, path: &str) -> Result<u64, ServiceError> {
        count("directory_size");
        let rel = self.resolve(path, FileOp::Inspect).await?;
        Ok(self.root.dir_size(rel).await?)
    }

    pub async fn move_path(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        count("move");
        let src = self.resolve(from, FileOp::MoveFrom).await?;
        let dst = self.resolve(to, FileOp::WriteInto).await?;
        Ok(self.root.rename(src, dst).await?)
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        count("copy");
        let src = self.resolve(from, FileOp::CopyFrom).await?;
        let dst = self.resolve(to, FileOp::WriteInto).await?;
        Ok(self.root.copy(src, dst).await?)
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), ServiceError> {
        count("chmod");
        let rel = self.resolve(path, FileOp::Chmod).await?;
        Ok(self.root.set_permissions(rel, mode).await?)
    }

    pub async fn permissions(&self, path: &str) -> Result<u32, ServiceError> {
        count("permissions");
        let rel = self.resolve(path, FileOp::ReadPermissions).await?;
        Ok(self.root.permissions(rel).await?)
    }

    /// Entries below `path` whose name contains `query`, ignoring case.
    pub async fn search(&self, path: &str, query: &str) -> Result<Vec<FileEntry>, ServiceError> {
        count("search");
        if query.trim().is_empty() {
            return Err(ServiceError::Validation("search query cannot be empty".into()));
        }
        let rel = self.resolve(path, FileOp::Inspect).await?;
        Ok(self
            .root
            .search(rel, query.to_string(), self.visibility())
            .await?)
    }

    pub async fn compress(&self, _paths: &[String], _archive: &str) -> Result<(), ServiceError> {
        count("compress");
        Err(ServiceError::Unimplemented("compress"))
    }

    pub async fn decompress(&self, _archive: &str, _into: &str) -> Result<(), ServiceError> {
        count("decompress");
        Err(ServiceError::Unimplemented("decompress"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::blueprint::BlockedFile;

    fn volume(dir: &Path) -> ServerVolume {
        let policy = FilePolicy::from_blocked_files(&[
            BlockedFile { path: "secrets".into(), visible: false, readable: false },
            BlockedFile { path: "license.key".into(), visible: true, readable: false },
        ]);
        ServerVolume::new(SandboxedRoot::open(dir).unwrap(), policy)
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_io() {
        let tmp = tempfile::tempdir().unwrap();
        let vol = volume(tmp.path());
        let err = vol.read("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_policy_applies_to_every_entry_point() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("secrets")).unwrap();
        std::fs::write(tmp.path().join("secrets/token"), b"t").unwrap();
        std::fs::write(tmp.path().join("license.key"), b"k").unwrap();
        std::fs::write(tmp.path().join("server.properties"), b"motd=hi").unwrap();
        let vol = volume(tmp.path());

        let names: Vec<String> = vol.list("/").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["license.key", "server.properties"]);

        assert!(matches!(vol.read("/secrets/token").await, Err(ServiceError::AccessDenied(_))));
        assert!(matches!(vol.read("license.key").await, Err(ServiceError::AccessDenied(_))));
        assert!(matches!(vol.delete("/").await, Err(ServiceError::AccessDenied(_))));
        assert!(matches!(
            vol.move_path("server.properties", "secrets/x").await,
            Err(ServiceError::AccessDenied(_))
        ));
        assert_eq!(vol.read("./server.properties").await.unwrap(), b"motd=hi");
    }

    #[tokio::test]
    async fn test_symlink_alias_cannot_reach_blocked_paths() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("secrets")).unwrap();
        std::fs::write(tmp.path().join("secrets/token"), b"t").unwrap();
        std::fs::write(tmp.path().join("license.key"), b"k").unwrap();
        std::os::unix::fs::symlink("secrets", tmp.path().join("alias")).unwrap();
        std::os::unix::fs::symlink("license.key", tmp.path().join("lic")).unwrap();
        let vol = volume(tmp.path());

        assert!(matches!(vol.read("alias/token").await, Err(ServiceError::AccessDenied(_))));
        assert!(matches!(vol.list("alias").await, Err(ServiceError::AccessDenied(_))));
        assert!(matches!(vol.read("/lic").await, Err(ServiceError::AccessDenied(_))));
        assert!(matches!(
            vol.write("alias/planted", b"x".to_vec()).await,
            Err(ServiceError::AccessDenied(_))
        ));
        assert!(!tmp.path().join("secrets/planted").exists());
        assert!(matches!(vol.delete("alias").await, Err(ServiceError::AccessDenied(_))));
        assert!(tmp.path().join("secrets/token").exists());
    }

    #[tokio::test]
    async fn test_compress_is_unimplemented() {
        let tmp = tempfile::tempdir().unwrap();
        let vol = volume(tmp.path());
        let err = vol.compress(&["a".into()], "a.tar.gz").await.unwrap_err();
        assert_eq!(err.kind(), crate::application::error::ErrorKind::Unimplemented);
    }
}
