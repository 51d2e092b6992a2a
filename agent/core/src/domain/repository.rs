// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate root: one repository per
//! aggregate, interface defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ServerRepository` | `Server` | `InMemoryServerRepository`, `SqliteServerRepository` |
//! | `BlueprintRepository` | `Blueprint` | `InMemoryBlueprintRepository`, `SqliteBlueprintRepository` |
//!
//! ## Storage Backend Abstraction
//!
//! The backend is selected at startup from `database.url` in
//! `hearth-config.yaml`: `memory` for development and tests, a `sqlite://`
//! URL for a persistent node.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::blueprint::{Blueprint, BlueprintId};
use crate::domain::server::{Server, ServerAllocation, ServerId, UserId};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    Sqlite(SqliteConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    pub url: String,
}

impl StorageBackend {
    pub fn from_url(url: &str) -> Self {
        if url.eq_ignore_ascii_case("memory") {
            Self::InMemory
        } else {
            Self::Sqlite(SqliteConfig { url: url.to_string() })
        }
    }
}

/// Repository for the `Server` aggregate.
///
/// The server row, its access rows and its allocation rows are written by
/// separate calls so that a failed create can be compensated by `delete`.
#[async_trait]
pub trait ServerRepository: Send + Sync {
    /// Insert the server row only. Fails if the SID already exists.
    async fn insert(&self, server: &Server) -> Result<(), RepositoryError>;

    /// Update the server row (status, limits, image, timestamps, last error).
    async fn save(&self, server: &Server) -> Result<(), RepositoryError>;

    /// Replace the access rows for a server.
    async fn replace_users(&self, sid: &ServerId, users: &[UserId]) -> Result<(), RepositoryError>;

    /// Replace the allocation rows for a server.
    async fn replace_allocations(
        &self,
        sid: &ServerId,
        allocations: &[ServerAllocation],
    ) -> Result<(), RepositoryError>;

    /// Load the server with its users and allocations.
    async fn find_by_id(&self, sid: &ServerId) -> Result<Option<Server>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Server>, RepositoryError>;

    /// Remove the server row with its access and allocation rows. Deleting an
    /// absent SID is not an error.
    async fn delete(&self, sid: &ServerId) -> Result<(), RepositoryError>;
}

/// Local blueprint cache, written only by the sync feed.
#[async_trait]
pub trait BlueprintRepository: Send + Sync {
    async fn find_by_id(&self, id: &BlueprintId) -> Result<Option<Blueprint>, RepositoryError>;

    /// Store a blueprint unless a newer version is already cached. Returns
    /// whether the stored copy changed.
    async fn upsert(&self, blueprint: &Blueprint) -> Result<bool, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Blueprint>, RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                RepositoryError::AlreadyExists(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
