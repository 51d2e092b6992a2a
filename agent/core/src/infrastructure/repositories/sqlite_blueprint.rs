// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! SQLite Blueprint Repository
//!
//! Blueprints are stored whole as JSON next to their version, which is the
//! only column the cache ever compares on.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::domain::blueprint::{Blueprint, BlueprintId};
use crate::domain::repository::{BlueprintRepository, RepositoryError};

pub struct SqliteBlueprintRepository {
    pool: SqlitePool,
}

impl SqliteBlueprintRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_body(body: &str) -> Result<Blueprint, RepositoryError> {
    serde_json::from_str(body)
        .map_err(|e| RepositoryError::Serialization(format!("Failed to deserialize blueprint: {}", e)))
}

#[async_trait]
impl BlueprintRepository for SqliteBlueprintRepository {
    async fn find_by_id(&self, id: &BlueprintId) -> Result<Option<Blueprint>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM blueprints WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(Some(parse_body(&body)?))
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, blueprint: &Blueprint) -> Result<bool, RepositoryError> {
        let body = serde_json::to_string(blueprint)?;
        let version = i64::try_from(blueprint.version).map_err(|_| {
            RepositoryError::Serialization(format!("blueprint version {} too large", blueprint.version))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO blueprints (id, version, body, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                version = excluded.version,
                body = excluded.body,
                updated_at = excluded.updated_at
            WHERE excluded.version >= blueprints.version
              AND excluded.body != blueprints.body
            "#,
        )
        .bind(blueprint.id.as_str())
        .bind(version)
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<Blueprint>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM blueprints ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let body: String = row.get("body");
                parse_body(&body)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::db::Database;

    fn blueprint(version: u64, image: &str) -> Blueprint {
        Blueprint {
            id: BlueprintId::new("paper").unwrap(),
            version,
            images: vec![image.to_string()],
            blocked_files: vec![],
            server_binary: "server.jar".into(),
            start_command: "java -Xmx{{$env::SERVER_MEMORY}}M -jar {{$env::SERVER_BINARY}}".into(),
            stop_command: "stop".into(),
            setup_script_base64: "ZWNobyBoaQ==".into(),
            setup_image: "alpine:3".into(),
            setup_interpreter: "sh".into(),
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_newest_version() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteBlueprintRepository::new(db.get_pool().clone());

        assert!(repo.upsert(&blueprint(2, "img:v2")).await.unwrap());
        assert!(!repo.upsert(&blueprint(1, "img:v1")).await.unwrap());
        assert!(!repo.upsert(&blueprint(2, "img:v2")).await.unwrap());

        let id = BlueprintId::new("paper").unwrap();
        let stored = repo.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.images, vec!["img:v2"]);

        assert!(repo.upsert(&blueprint(3, "img:v3")).await.unwrap());
        assert_eq!(repo.list_all().await.unwrap().len(), 1);
    }
}
