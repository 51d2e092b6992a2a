// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::server::{ServerId, UserId};

/// Who is calling a runtime-facing operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// The control-plane backend; trusted for every server on this node
    Backend,
    User(UserId),
}

impl std::fmt::Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend => f.write_str("backend"),
            Self::User(id) => write!(f, "user:{}", id),
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{caller} may not act on server {sid}")]
    Denied { caller: String, sid: ServerId },

    #[error("Server {0} not found")]
    UnknownServer(ServerId),

    #[error("Access check failed: {0}")]
    Unavailable(String),
}

/// Authorization oracle consulted before any engine or filesystem call.
#[async_trait]
pub trait AccessGuard: Send + Sync {
    async fn check_access(&self, caller: &Caller, sid: &ServerId) -> Result<(), AccessError>;
}
