pub(crate) mod row_helpers;
mod scripts;
mod tasks;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeMap;

use crate::models::*;

/// Typed error for "resource not found", downcast by the API error handler
#[derive(Debug)]
pub struct NotFoundError {
    pub resource: String,
    pub id: String,
}

impl NotFoundError {
    pub fn new(resource: &str, id: &str) -> Self {
        Self {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} not found: {}", self.resource, self.id)
    }
}

impl std::error::Error for NotFoundError {}

/// What job runs need from persistence
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_task_by_name(&self, name: &str) -> Result<Option<Task>>;

    async fn find_script_by_name(&self, name: &str) -> Result<Option<Script>>;

    /// Persist one finished run of the task atomically; the task's status is left alone
    async fn append_run(&self, task: &Task, run_time: &str, results: &BTreeMap<String, String>) -> Result<()>;
}

/// Store handles all database operations, delegating to per-entity repo modules.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Create a new database store with a specific pool size
    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&db_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database; a single connection keeps it alive
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    // ========== Tasks ==========

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        tasks::TaskRepo::create(&self.pool, task).await
    }

    pub async fn get_task_by_name(&self, name: &str) -> Result<Option<Task>> {
        tasks::TaskRepo::get_by_name(&self.pool, name).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        tasks::TaskRepo::list(&self.pool).await
    }

    pub async fn update_task_status(&self, task: &Task) -> Result<()> {
        tasks::TaskRepo::update_status(&self.pool, task).await
    }

    pub async fn append_task_run(&self, task: &Task, run_time: &str, results: &BTreeMap<String, String>) -> Result<()> {
        tasks::TaskRepo::append_run(&self.pool, task, run_time, results).await
    }

    pub async fn delete_task(&self, name: &str) -> Result<()> {
        tasks::TaskRepo::delete(&self.pool, name).await
    }

    // ========== Scripts ==========

    pub async fn get_script_by_name(&self, name: &str) -> Result<Option<Script>> {
        scripts::ScriptRepo::get_by_name(&self.pool, name).await
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    #[cfg(test)]
    pub async fn upsert_script(&self, name: &str, content: &str) -> Result<()> {
        scripts::ScriptRepo::upsert(&self.pool, name, content).await
    }
}

#[async_trait]
impl TaskRepository for Store {
    async fn find_task_by_name(&self, name: &str) -> Result<Option<Task>> {
        self.get_task_by_name(name).await
    }

    async fn find_script_by_name(&self, name: &str) -> Result<Option<Script>> {
        self.get_script_by_name(name).await
    }

    async fn append_run(&self, task: &Task, run_time: &str, results: &BTreeMap<String, String>) -> Result<()> {
        self.append_task_run(task, run_time, results).await
    }
}
