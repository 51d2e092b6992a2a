// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Blocked-file policy evaluation.
//!
//! Rules come from the blueprint's blocked-file list. A rule covers its own
//! path and everything beneath it. All paths handled here are root-relative
//! and already normalized by [`PathSanitizer`].

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::blueprint::BlockedFile;
use crate::domain::path_sanitizer::PathSanitizer;

/// How much of a path the policy exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileAccess {
    Hidden,
    /// Listed, but content and metadata stay closed
    Unreadable,
    ReadOnly,
    Full,
}

/// The kind of operation being attempted on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    /// Stat, list a directory, size it
    Inspect,
    Read,
    ReadPermissions,
    /// Source of a copy; may expose descendants
    CopyFrom,
    Write,
    Chmod,
    Delete,
    /// Source of a move; removes the path and its descendants
    MoveFrom,
    /// Destination of a copy or move
    WriteInto,
}

impl FileOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Inspect => "inspect",
            Self::Read => "read",
            Self::ReadPermissions => "read permissions of",
            Self::CopyFrom => "copy",
            Self::Write => "write",
            Self::Chmod => "change permissions of",
            Self::Delete => "delete",
            Self::MoveFrom => "move",
            Self::WriteInto => "write into",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Blocked by blueprint policy: cannot {op} {path}")]
pub struct PolicyViolation {
    pub op: &'static str,
    pub path: String,
}

#[derive(Debug, Clone)]
struct Rule {
    path: PathBuf,
    visible: bool,
    readable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FilePolicy {
    rules: Vec<Rule>,
}

impl FilePolicy {
    /// Permit everything.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn from_blocked_files(blocked: &[BlockedFile]) -> Self {
        let sanitizer = PathSanitizer::new();
        let rules = blocked
            .iter()
            .filter_map(|entry| match sanitizer.normalize(&entry.path) {
                Ok(path) if path.as_os_str().is_empty() => {
                    tracing::warn!(path = %entry.path, "Ignoring blocked-file rule for the server root");
                    None
                }
                Ok(path) => Some(Rule {
                    path,
                    visible: entry.visible,
                    readable: entry.readable,
                }),
                Err(e) => {
                    tracing::warn!(path = %entry.path, error = %e, "Ignoring invalid blocked-file rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Access level for a path, from the most restrictive covering rule.
    pub fn access(&self, path: &Path) -> FileAccess {
        self.rules
            .iter()
            .filter(|rule| path.starts_with(&rule.path))
            .map(|rule| {
                if !rule.visible {
                    FileAccess::Hidden
                } else if !rule.readable {
                    FileAccess::Unreadable
                } else {
                    FileAccess::ReadOnly
                }
            })
            .min()
            .unwrap_or(FileAccess::Full)
    }

    pub fn is_visible(&self, path: &Path) -> bool {
        self.access(path) != FileAccess::Hidden
    }

    /// Any rule strictly beneath `path`.
    fn has_blocked_descendant(&self, path: &Path, restricted_only: bool) -> bool {
        self.rules.iter().any(|rule| {
            rule.path != path
                && rule.path.starts_with(path)
                && (!restricted_only || !rule.visible || !rule.readable)
        })
    }

    pub fn check(&self, path: &Path, op: FileOp) -> Result<(), PolicyViolation> {
        let access = self.access(path);
        let allowed = match op {
            FileOp::Inspect => access > FileAccess::Hidden,
            FileOp::Read | FileOp::ReadPermissions => access >= FileAccess::ReadOnly,
            FileOp::CopyFrom => {
                access >= FileAccess::ReadOnly && !self.has_blocked_descendant(path, true)
            }
            FileOp::Write | FileOp::Chmod => access == FileAccess::Full,
            FileOp::Delete | FileOp::MoveFrom | FileOp::WriteInto => {
                access == FileAccess::Full && !self.has_blocked_descendant(path, false)
            }
        };

        if allowed {
            Ok(())
        } else {
            tracing::warn!(path = %path.display(), op = op.as_str(), "Blocked-file policy denied operation");
            Err(PolicyViolation {
                op: op.as_str(),
                path: PathSanitizer::display(path),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FilePolicy {
        FilePolicy::from_blocked_files(&[
            BlockedFile { path: "/secrets".into(), visible: false, readable: false },
            BlockedFile { path: "config/license.key".into(), visible: true, readable: false },
            BlockedFile { path: "server.jar".into(), visible: true, readable: true },
            BlockedFile { path: "../escape".into(), visible: false, readable: false },
        ])
    }

    #[test]
    fn test_access_levels() {
        let p = policy();
        assert_eq!(p.access(Path::new("secrets")), FileAccess::Hidden);
        assert_eq!(p.access(Path::new("secrets/token")), FileAccess::Hidden);
        assert_eq!(p.access(Path::new("config/license.key")), FileAccess::Unreadable);
        assert_eq!(p.access(Path::new("server.jar")), FileAccess::ReadOnly);
        assert_eq!(p.access(Path::new("config")), FileAccess::Full);
        assert_eq!(p.access(Path::new("secrets2")), FileAccess::Full);
        assert_eq!(p.access(Path::new("")), FileAccess::Full);
    }

    #[test]
    fn test_hidden_denies_everything() {
        let p = policy();
        for op in [FileOp::Inspect, FileOp::Read, FileOp::Write, FileOp::Delete, FileOp::CopyFrom] {
            assert!(p.check(Path::new("secrets/token"), op).is_err());
        }
        assert!(!p.is_visible(Path::new("secrets")));
    }

    #[test]
    fn test_unreadable_is_listed_but_closed() {
        let p = policy();
        let key = Path::new("config/license.key");
        assert!(p.check(key, FileOp::Inspect).is_ok());
        assert!(p.check(key, FileOp::Read).is_err());
        assert!(p.check(key, FileOp::ReadPermissions).is_err());
        assert!(p.check(key, FileOp::Write).is_err());
    }

    #[test]
    fn test_read_only_blocks_mutation() {
        let p = policy();
        let jar = Path::new("server.jar");
        assert!(p.check(jar, FileOp::Read).is_ok());
        assert!(p.check(jar, FileOp::CopyFrom).is_ok());
        assert!(p.check(jar, FileOp::Write).is_err());
        assert!(p.check(jar, FileOp::Chmod).is_err());
        assert!(p.check(jar, FileOp::Delete).is_err());
        assert!(p.check(jar, FileOp::WriteInto).is_err());
    }

    #[test]
    fn test_recursive_mutations_respect_descendants() {
        let p = policy();
        assert!(p.check(Path::new(""), FileOp::Delete).is_err());
        assert!(p.check(Path::new("config"), FileOp::MoveFrom).is_err());
        assert!(p.check(Path::new("config"), FileOp::CopyFrom).is_err());
        assert!(p.check(Path::new("config"), FileOp::Write).is_ok());
        assert!(p.check(Path::new("world"), FileOp::Delete).is_ok());
    }

    #[test]
    fn test_invalid_rules_are_dropped() {
        let p = FilePolicy::from_blocked_files(&[
            BlockedFile { path: "/".into(), visible: false, readable: false },
            BlockedFile { path: "../x".into(), visible: false, readable: false },
        ]);
        assert_eq!(p.access(Path::new("anything")), FileAccess::Full);
        assert!(FilePolicy::open().check(Path::new("x"), FileOp::Delete).is_ok());
    }
}
