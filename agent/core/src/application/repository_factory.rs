// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory
//!
//! Creates concrete repository implementations for the storage backend named
//! by `database.url`.

use std::sync::Arc;

use crate::application::error::ServiceError;
use crate::domain::repository::{BlueprintRepository, ServerRepository, StorageBackend};
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::sqlite_blueprint::SqliteBlueprintRepository;
use crate::infrastructure::repositories::sqlite_server::SqliteServerRepository;
use crate::infrastructure::repositories::{InMemoryBlueprintRepository, InMemoryServerRepository};

/// Open and migrate the database for a persistent backend.
pub async fn open_database(backend: &StorageBackend) -> Result<Option<Database>, ServiceError> {
    match backend {
        StorageBackend::InMemory => Ok(None),
        StorageBackend::Sqlite(config) => {
            let db = Database::new(&config.url).await?;
            db.migrate().await?;
            Ok(Some(db))
        }
    }
}

fn require_database<'a>(
    backend: &StorageBackend,
    database: Option<&'a Database>,
) -> Result<Option<&'a Database>, ServiceError> {
    match (backend, database) {
        (StorageBackend::InMemory, _) => Ok(None),
        (StorageBackend::Sqlite(_), Some(db)) => Ok(Some(db)),
        (StorageBackend::Sqlite(config), None) => Err(ServiceError::Internal(format!(
            "storage backend {} has no open database",
            config.url
        ))),
    }
}

/// Creates a ServerRepository implementation based on the configured backend
pub fn create_server_repository(
    backend: &StorageBackend,
    database: Option<&Database>,
) -> Result<Arc<dyn ServerRepository>, ServiceError> {
    Ok(match require_database(backend, database)? {
        None => Arc::new(InMemoryServerRepository::new()),
        Some(db) => Arc::new(SqliteServerRepository::new(db.get_pool().clone())),
    })
}

/// Creates a BlueprintRepository implementation based on the configured backend
pub fn create_blueprint_repository(
    backend: &StorageBackend,
    database: Option<&Database>,
) -> Result<Arc<dyn BlueprintRepository>, ServiceError> {
    Ok(match require_database(backend, database)? {
        None => Arc::new(InMemoryBlueprintRepository::new()),
        Some(db) => Arc::new(SqliteBlueprintRepository::new(db.get_pool().clone())),
    })
}
