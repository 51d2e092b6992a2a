// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::access::{AccessError, AccessGuard, Caller};
use crate::domain::repository::ServerRepository;
use crate::domain::server::ServerId;

/// Grants the backend every server, and users the servers that list them as
/// owner or user in the local registry.
pub struct RegistryAccessGuard {
    servers: Arc<dyn ServerRepository>,
}

impl RegistryAccessGuard {
    pub fn new(servers: Arc<dyn ServerRepository>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl AccessGuard for RegistryAccessGuard {
    async fn check_access(&self, caller: &Caller, sid: &ServerId) -> Result<(), AccessError> {
        let user = match caller {
            Caller::Backend => return Ok(()),
            Caller::User(user) => user,
        };

        let server = self
            .servers
            .find_by_id(sid)
            .await
            .map_err(|e| AccessError::Unavailable(e.to_string()))?
            .ok_or_else(|| AccessError::UnknownServer(sid.clone()))?;

        if server.grants_access_to(user) {
            Ok(())
        } else {
            tracing::warn!(sid = %sid, user = %user, "Access denied");
            Err(AccessError::Denied {
                caller: caller.to_string(),
                sid: sid.clone(),
            })
        }
    }
}
