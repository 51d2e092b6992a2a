// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # SQLite Connection Pool
//!
//! Wraps `sqlx::sqlite::SqlitePool` in a thin `Database` newtype that is
//! injected into the SQLite repository implementations. The schema is small
//! and owned by this crate, so it is created in place at startup.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::domain::repository::RepositoryError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS servers (
        sid TEXT PRIMARY KEY NOT NULL,
        owner TEXT NOT NULL,
        image TEXT NOT NULL,
        blueprint_id TEXT NOT NULL,
        resource_limit TEXT NOT NULL,
        status TEXT NOT NULL,
        offline_reason TEXT,
        container_exists BOOLEAN NOT NULL DEFAULT 0,
        started_at TEXT,
        stopped_at TEXT,
        last_error TEXT,
        last_attempt_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS server_users (
        sid TEXT NOT NULL REFERENCES servers(sid) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (sid, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS server_allocations (
        sid TEXT NOT NULL REFERENCES servers(sid) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        ip TEXT NOT NULL,
        port INTEGER NOT NULL,
        PRIMARY KEY (sid, position),
        UNIQUE (ip, port)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blueprints (
        id TEXT PRIMARY KEY NOT NULL,
        version INTEGER NOT NULL,
        body TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `url` in WAL mode.
    pub async fn new(url: &str) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // every connection to :memory: is its own database
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self { pool })
    }

    /// A private in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self, RepositoryError> {
        let db = Self::new("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Database schema ready");
        Ok(())
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }
}
