// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-server exclusive execution tokens.
//!
//! Every lifecycle operation on a server holds that server's token for its
//! whole duration. Background pipelines receive the owned guard from the
//! request that spawned them, so a later request on the same server waits
//! until the pipeline is done.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::application::error::ServiceError;
use crate::domain::server::ServerId;

pub type ServerGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
pub struct ServerLocks {
    locks: DashMap<ServerId, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl ServerLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Wait for the server's token, up to the configured timeout.
    pub async fn acquire(&self, sid: &ServerId) -> Result<ServerGuard, ServiceError> {
        let lock = self
            .locks
            .entry(sid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        tokio::time::timeout(self.timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(sid = %sid, timeout = ?self.timeout, "Timed out waiting for server lock");
                ServiceError::Conflict(format!(
                    "server {} is busy with another operation",
                    sid
                ))
            })
    }

    /// Drop the token of a deleted server unless someone holds or awaits it.
    pub fn prune(&self, sid: &ServerId) {
        self.locks.remove_if(sid, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
