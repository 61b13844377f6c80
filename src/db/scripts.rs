use anyhow::Result;
use sqlx::{Pool, Row, Sqlite};

use crate::models::Script;

pub struct ScriptRepo;

impl ScriptRepo {
    pub async fn get_by_name(pool: &Pool<Sqlite>, name: &str) -> Result<Option<Script>> {
        let row = sqlx::query("SELECT name, content FROM scripts WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(|row| Script {
            name: row.get("name"),
            content: row.get("content"),
        }))
    }

    /// Scripts are authored elsewhere; this only seeds fixtures.
    #[cfg(test)]
    pub async fn upsert(pool: &Pool<Sqlite>, name: &str, content: &str) -> Result<()> {
        let now = chrono::Utc::now();
        sqlx::query(
            r#"
            INSERT INTO scripts (name, content, created_at, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(content)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }
}
