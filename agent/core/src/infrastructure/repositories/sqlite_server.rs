// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! SQLite Server Repository
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Persists the `Server` aggregate across `servers`,
//!   `server_users` and `server_allocations`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::net::IpAddr;

use crate::domain::blueprint::BlueprintId;
use crate::domain::repository::{RepositoryError, ServerRepository};
use crate::domain::server::{
    OfflineReason, ResourceLimit, Server, ServerAllocation, ServerId, ServerStatus, UserId,
};

const SERVER_COLUMNS: &str = r#"
    sid, owner, image, blueprint_id, resource_limit, status, offline_reason,
    container_exists, started_at, stopped_at, last_error, last_attempt_at,
    created_at, updated_at
"#;

pub struct SqliteServerRepository {
    pool: SqlitePool,
}

impl SqliteServerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_users(&self, sid: &str) -> Result<Vec<UserId>, RepositoryError> {
        let rows = sqlx::query("SELECT user_id FROM server_users WHERE sid = ? ORDER BY position")
            .bind(sid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.get("user_id");
                UserId::new(id).map_err(|e| RepositoryError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn load_allocations(&self, sid: &str) -> Result<Vec<ServerAllocation>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT ip, port FROM server_allocations WHERE sid = ? ORDER BY position",
        )
        .bind(sid)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_allocation_row).collect()
    }

    async fn assemble(&self, row: SqliteRow) -> Result<Server, RepositoryError> {
        let sid: String = row.get("sid");
        let users = self.load_users(&sid).await?;
        let allocations = self.load_allocations(&sid).await?;
        parse_server_row(&row, users, allocations)
    }
}

#[async_trait]
impl ServerRepository for SqliteServerRepository {
    async fn insert(&self, server: &Server) -> Result<(), RepositoryError> {
        let limit_json = serde_json::to_string(&server.resource_limit)?;

        sqlx::query(&format!(
            "INSERT INTO servers ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SERVER_COLUMNS
        ))
        .bind(server.id.as_str())
        .bind(server.owner.as_str())
        .bind(&server.image)
        .bind(server.blueprint_id.as_str())
        .bind(limit_json)
        .bind(server.status.as_str())
        .bind(server.offline_reason.map(|r| r.as_str()))
        .bind(server.container_exists)
        .bind(server.started_at)
        .bind(server.stopped_at)
        .bind(&server.last_error)
        .bind(server.last_attempt_at)
        .bind(server.created_at)
        .bind(server.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save(&self, server: &Server) -> Result<(), RepositoryError> {
        let limit_json = serde_json::to_string(&server.resource_limit)?;

        let result = sqlx::query(
            r#"
            UPDATE servers SET
                owner = ?, image = ?, blueprint_id = ?, resource_limit = ?,
                status = ?, offline_reason = ?, container_exists = ?,
                started_at = ?, stopped_at = ?, last_error = ?, last_attempt_at = ?,
                updated_at = ?
            WHERE sid = ?
            "#,
        )
        .bind(server.owner.as_str())
        .bind(&server.image)
        .bind(server.blueprint_id.as_str())
        .bind(limit_json)
        .bind(server.status.as_str())
        .bind(server.offline_reason.map(|r| r.as_str()))
        .bind(server.container_exists)
        .bind(server.started_at)
        .bind(server.stopped_at)
        .bind(&server.last_error)
        .bind(server.last_attempt_at)
        .bind(server.updated_at)
        .bind(server.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("server {}", server.id)));
        }
        Ok(())
    }

    async fn replace_users(&self, sid: &ServerId, users: &[UserId]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM server_users WHERE sid = ?")
            .bind(sid.as_str())
            .execute(&mut *tx)
            .await?;
        for (position, user) in users.iter().enumerate() {
            sqlx::query("INSERT INTO server_users (sid, position, user_id) VALUES (?, ?, ?)")
                .bind(sid.as_str())
                .bind(position as i64)
                .bind(user.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_allocations(
        &self,
        sid: &ServerId,
        allocations: &[ServerAllocation],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM server_allocations WHERE sid = ?")
            .bind(sid.as_str())
            .execute(&mut *tx)
            .await?;
        for (position, allocation) in allocations.iter().enumerate() {
            sqlx::query(
                "INSERT INTO server_allocations (sid, position, ip, port) VALUES (?, ?, ?, ?)",
            )
            .bind(sid.as_str())
            .bind(position as i64)
            .bind(allocation.ip.to_string())
            .bind(i64::from(allocation.port))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, sid: &ServerId) -> Result<Option<Server>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM servers WHERE sid = ?", SERVER_COLUMNS))
            .bind(sid.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<Server>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {} FROM servers ORDER BY sid", SERVER_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        let mut servers = Vec::with_capacity(rows.len());
        for row in rows {
            servers.push(self.assemble(row).await?);
        }
        Ok(servers)
    }

    async fn delete(&self, sid: &ServerId) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for table in ["server_users", "server_allocations", "servers"] {
            sqlx::query(&format!("DELETE FROM {} WHERE sid = ?", table))
                .bind(sid.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn parse_allocation_row(row: &SqliteRow) -> Result<ServerAllocation, RepositoryError> {
    let ip: String = row.get("ip");
    let port: i64 = row.get("port");
    let ip: IpAddr = ip
        .parse()
        .map_err(|e| RepositoryError::Serialization(format!("Invalid allocation ip '{}': {}", ip, e)))?;
    let port = u16::try_from(port)
        .map_err(|_| RepositoryError::Serialization(format!("Invalid allocation port {}", port)))?;
    Ok(ServerAllocation { ip, port })
}

fn parse_server_row(
    row: &SqliteRow,
    users: Vec<UserId>,
    allocations: Vec<ServerAllocation>,
) -> Result<Server, RepositoryError> {
    let sid: String = row.get("sid");
    let owner: String = row.get("owner");
    let image: String = row.get("image");
    let blueprint_id: String = row.get("blueprint_id");
    let limit_json: String = row.get("resource_limit");
    let status: String = row.get("status");
    let offline_reason: Option<String> = row.get("offline_reason");
    let container_exists: bool = row.get("container_exists");
    let started_at: Option<DateTime<Utc>> = row.get("started_at");
    let stopped_at: Option<DateTime<Utc>> = row.get("stopped_at");
    let last_error: Option<String> = row.get("last_error");
    let last_attempt_at: Option<DateTime<Utc>> = row.get("last_attempt_at");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    let corrupt = |e: &dyn std::fmt::Display| RepositoryError::Serialization(format!("server {}: {}", sid, e));

    let resource_limit: ResourceLimit = serde_json::from_str(&limit_json)
        .map_err(|e| RepositoryError::Serialization(format!("Failed to deserialize resource_limit: {}", e)))?;
    let status: ServerStatus = status.parse().map_err(|e| corrupt(&e))?;
    let offline_reason = offline_reason
        .map(|r| r.parse::<OfflineReason>())
        .transpose()
        .map_err(|e| corrupt(&e))?;

    Ok(Server {
        id: ServerId::new(sid.clone()).map_err(|e| corrupt(&e))?,
        owner: UserId::new(owner).map_err(|e| corrupt(&e))?,
        users,
        allocations,
        resource_limit,
        image,
        blueprint_id: BlueprintId::new(blueprint_id).map_err(|e| corrupt(&e))?,
        status,
        offline_reason,
        container_exists,
        started_at,
        stopped_at,
        last_error,
        last_attempt_at,
        created_at,
        updated_at,
    })
}
