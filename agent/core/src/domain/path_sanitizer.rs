// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Path Sanitizer Domain Service
//!
//! Normalizes caller-supplied paths into root-relative form before they reach
//! the blocked-file policy or the sandboxed filesystem handle.
//!
//! The sandbox handle is what confines resolution to the server volume; this
//! service makes policy matching deterministic and rejects traversal early so
//! that a `..` never has to be interpreted at all.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Path sanitization errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathSanitizerError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),
}

/// Path sanitizer domain service
///
/// # Guarantees
/// - Rejects paths containing `..` components
/// - Rejects null bytes
/// - Strips the leading `/` and `.` components, so `/a/./b` and `a/b` are the
///   same path
/// - The empty path denotes the server root
#[derive(Debug, Clone)]
pub struct PathSanitizer {
    max_path_len: usize,
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PathSanitizer {
    pub fn new() -> Self {
        Self { max_path_len: 4096 }
    }

    pub fn with_max_length(max_path_len: usize) -> Self {
        Self { max_path_len }
    }

    /// Normalize a caller path to a root-relative path.
    ///
    /// # Examples
    /// ```
    /// use hearth_core::domain::path_sanitizer::PathSanitizer;
    /// use std::path::PathBuf;
    ///
    /// let sanitizer = PathSanitizer::new();
    /// assert_eq!(sanitizer.normalize("/world/./level.dat").unwrap(), PathBuf::from("world/level.dat"));
    /// assert!(sanitizer.normalize("world/../../etc/passwd").is_err());
    /// ```
    pub fn normalize(&self, path: &str) -> Result<PathBuf, PathSanitizerError> {
        if path.len() > self.max_path_len {
            return Err(PathSanitizerError::PathTooLong(path.to_string()));
        }

        if path.contains('\0') {
            tracing::warn!(path = %path, "Path contains null byte");
            return Err(PathSanitizerError::InvalidPath(
                "Path contains null byte".to_string(),
            ));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => normalized.push(part),
                Component::ParentDir => {
                    tracing::warn!(
                        path = %path,
                        "Path traversal attempt detected: contains '..' component"
                    );
                    return Err(PathSanitizerError::PathTraversal(path.to_string()));
                }
                Component::Prefix(_) => {
                    return Err(PathSanitizerError::InvalidPath(path.to_string()));
                }
            }
        }

        Ok(normalized)
    }

    /// Render a root-relative path the way callers see it (`/a/b`, `/`).
    pub fn display(relative: &Path) -> String {
        let mut out = String::from("/");
        out.push_str(&relative.to_string_lossy());
        out
    }
}
