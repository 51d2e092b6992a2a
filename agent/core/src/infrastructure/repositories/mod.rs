// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository traits defined in
//! `crate::domain::repository`.
//!
//! ## SQLite Repositories
//!
//! Durable node state:
//! - **SqliteServerRepository** - server rows with their user and allocation rows
//! - **SqliteBlueprintRepository** - the local blueprint cache
//!
//! ## In-Memory Repositories
//!
//! `HashMap`-backed storage for tests and throwaway nodes:
//! - **InMemoryServerRepository**
//! - **InMemoryBlueprintRepository**
//!
//! Both families keep the same row split (server, users, allocations) so that
//! the compensating rollback of a failed create behaves identically.

pub mod sqlite_blueprint;
pub mod sqlite_server;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::domain::blueprint::{Blueprint, BlueprintId};
use crate::domain::repository::{BlueprintRepository, RepositoryError, ServerRepository};
use crate::domain::server::{Server, ServerAllocation, ServerId, UserId};

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Database("in-memory store lock poisoned".to_string())
}

#[derive(Default)]
struct ServerTables {
    servers: HashMap<ServerId, Server>,
    users: HashMap<ServerId, Vec<UserId>>,
    allocations: HashMap<ServerId, Vec<ServerAllocation>>,
}

impl ServerTables {
    fn assemble(&self, sid: &ServerId) -> Option<Server> {
        let mut server = self.servers.get(sid)?.clone();
        server.users = self.users.get(sid).cloned().unwrap_or_default();
        server.allocations = self.allocations.get(sid).cloned().unwrap_or_default();
        Some(server)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryServerRepository {
    tables: Arc<RwLock<ServerTables>>,
}

impl InMemoryServerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerRepository for InMemoryServerRepository {
    async fn insert(&self, server: &Server) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if tables.servers.contains_key(&server.id) {
            return Err(RepositoryError::AlreadyExists(format!("server {}", server.id)));
        }
        tables.servers.insert(server.id.clone(), server.clone());
        Ok(())
    }

    async fn save(&self, server: &Server) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        match tables.servers.get_mut(&server.id) {
            Some(row) => {
                *row = server.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(format!("server {}", server.id))),
        }
    }

    async fn replace_users(&self, sid: &ServerId, users: &[UserId]) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if !tables.servers.contains_key(sid) {
            return Err(RepositoryError::NotFound(format!("server {}", sid)));
        }
        tables.users.insert(sid.clone(), users.to_vec());
        Ok(())
    }

    async fn replace_allocations(
        &self,
        sid: &ServerId,
        allocations: &[ServerAllocation],
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        if !tables.servers.contains_key(sid) {
            return Err(RepositoryError::NotFound(format!("server {}", sid)));
        }
        tables.allocations.insert(sid.clone(), allocations.to_vec());
        Ok(())
    }

    async fn find_by_id(&self, sid: &ServerId) -> Result<Option<Server>, RepositoryError> {
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables.assemble(sid))
    }

    async fn list_all(&self) -> Result<Vec<Server>, RepositoryError> {
        let tables = self.tables.read().map_err(poisoned)?;
        let mut servers: Vec<Server> = tables
            .servers
            .keys()
            .filter_map(|sid| tables.assemble(sid))
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(servers)
    }

    async fn delete(&self, sid: &ServerId) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        tables.servers.remove(sid);
        tables.users.remove(sid);
        tables.allocations.remove(sid);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBlueprintRepository {
    blueprints: Arc<RwLock<HashMap<BlueprintId, Blueprint>>>,
}

impl InMemoryBlueprintRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlueprintRepository for InMemoryBlueprintRepository {
    async fn find_by_id(&self, id: &BlueprintId) -> Result<Option<Blueprint>, RepositoryError> {
        let blueprints = self.blueprints.read().map_err(poisoned)?;
        Ok(blueprints.get(id).cloned())
    }

    async fn upsert(&self, blueprint: &Blueprint) -> Result<bool, RepositoryError> {
        let mut blueprints = self.blueprints.write().map_err(poisoned)?;
        if let Some(existing) = blueprints.get(&blueprint.id) {
            if existing.version > blueprint.version || existing == blueprint {
                return Ok(false);
            }
        }
        blueprints.insert(blueprint.id.clone(), blueprint.clone());
        Ok(true)
    }

    async fn list_all(&self) -> Result<Vec<Blueprint>, RepositoryError> {
        let blueprints = self.blueprints.read().map_err(poisoned)?;
        let mut all: Vec<Blueprint> = blueprints.values().cloned().collect();
        all.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::server::ResourceLimit;

    fn server(sid: &str) -> Server {
        Server::new(
            ServerId::new(sid).unwrap(),
            UserId::new("owner").unwrap(),
            vec![UserId::new("friend").unwrap()],
            vec![ServerAllocation::new("10.0.0.5".parse().unwrap(), 25565).unwrap()],
            ResourceLimit::default(),
            "img:java21".to_string(),
            BlueprintId::new("bp1").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_rows_are_written_separately() {
        let repo = InMemoryServerRepository::new();
        let s = server("a");
        repo.insert(&s).await.unwrap();

        let bare = repo.find_by_id(&s.id).await.unwrap().unwrap();
        assert!(bare.users.is_empty() && bare.allocations.is_empty());

        repo.replace_users(&s.id, &s.users).await.unwrap();
        repo.replace_allocations(&s.id, &s.allocations).await.unwrap();
        assert_eq!(repo.find_by_id(&s.id).await.unwrap().unwrap(), s);

        assert!(matches!(repo.insert(&s).await, Err(RepositoryError::AlreadyExists(_))));
        repo.delete(&s.id).await.unwrap();
        repo.delete(&s.id).await.unwrap();
        assert!(repo.find_by_id(&s.id).await.unwrap().is_none());
        assert!(matches!(
            repo.replace_users(&s.id, &s.users).await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
