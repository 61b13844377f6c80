use anyhow::{Context, Result};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use std::collections::BTreeMap;

use super::row_helpers::none_if_empty;
use crate::models::*;

fn map_task_row(row: &SqliteRow) -> Result<Task> {
    let name: String = row.get("name");
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let targets_json: String = row.get("targets");
    let job_json: String = row.get("job");

    Ok(Task {
        id: row.get("id"),
        kind: TaskKind::parse(&kind).with_context(|| format!("Task {} has unknown kind '{}'", name, kind))?,
        recurrent: row.get::<i32, _>("recurrent") != 0,
        frequency: row
            .get::<Option<i64>, _>("frequency")
            .and_then(|f| u64::try_from(f).ok()),
        scheduled_date: none_if_empty(row.get("scheduled_date")),
        status: TaskStatus::parse(&status).with_context(|| format!("Task {} has unknown status '{}'", name, status))?,
        creation_time: row.get("creation_time"),
        creator: row.get("creator"),
        script: none_if_empty(row.get("script")),
        targets: serde_json::from_str(&targets_json)
            .with_context(|| format!("Task {} has unreadable targets", name))?,
        job: serde_json::from_str(&job_json).with_context(|| format!("Task {} has an unreadable job payload", name))?,
        logs: RunLogs::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        name,
    })
}

const SELECT_TASK: &str = r#"
    SELECT id, name, kind, recurrent, frequency, scheduled_date, status,
           creation_time, creator, script, targets, job, created_at, updated_at
    FROM tasks
"#;

pub struct TaskRepo;

impl TaskRepo {
    pub async fn create(pool: &Pool<Sqlite>, task: &Task) -> Result<()> {
        let targets_json = serde_json::to_string(&task.targets)?;
        let job_json = serde_json::to_string(&task.job)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, kind, recurrent, frequency, scheduled_date, status,
                               creation_time, creator, script, targets, job, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(task.kind.as_str())
        .bind(task.recurrent as i32)
        .bind(task.frequency.map(|f| f as i64))
        .bind(&task.scheduled_date)
        .bind(task.status.as_str())
        .bind(&task.creation_time)
        .bind(&task.creator)
        .bind(&task.script)
        .bind(&targets_json)
        .bind(&job_json)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to insert task {}", task.name))?;
        Ok(())
    }

    pub async fn get_by_name(pool: &Pool<Sqlite>, name: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("{} WHERE name = ?", SELECT_TASK))
            .bind(name)
            .fetch_optional(pool)
            .await?;

        let mut task = match row {
            Some(row) => map_task_row(&row)?,
            None => return Ok(None),
        };
        task.logs = Self::load_logs(pool, &task.id).await?;
        Ok(Some(task))
    }

    pub async fn list(pool: &Pool<Sqlite>) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!("{} ORDER BY created_at", SELECT_TASK))
            .fetch_all(pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut task = map_task_row(row)?;
            task.logs = Self::load_logs(pool, &task.id).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn load_logs(pool: &Pool<Sqlite>, task_id: &str) -> Result<RunLogs> {
        let mut logs = RunLogs::new();

        let runs = sqlx::query("SELECT run_time FROM task_runs WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await?;
        for row in &runs {
            logs.insert(row.get("run_time"), BTreeMap::new());
        }

        let results = sqlx::query("SELECT run_time, target, result FROM task_run_results WHERE task_id = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await?;
        for row in &results {
            logs.entry(row.get("run_time"))
                .or_default()
                .insert(row.get("target"), row.get("result"));
        }

        Ok(logs)
    }

    /// Record a lifecycle status change
    pub async fn update_status(pool: &Pool<Sqlite>, task: &Task) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(task.status.as_str())
            .bind(task.updated_at)
            .bind(&task.id)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to update status of task {}", task.name))?;

        if result.rows_affected() == 0 {
            return Err(super::NotFoundError::new("Task", &task.name).into());
        }
        Ok(())
    }

    /// Append one run and its per-target results.
    /// Stored results are never overwritten or removed, and the task row is not touched.
    pub async fn append_run(
        pool: &Pool<Sqlite>,
        task: &Task,
        run_time: &str,
        results: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut tx = pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = ?")
            .bind(&task.id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(super::NotFoundError::new("Task", &task.name).into());
        }

        sqlx::query("INSERT OR IGNORE INTO task_runs (task_id, run_time) VALUES (?, ?)")
            .bind(&task.id)
            .bind(run_time)
            .execute(&mut *tx)
            .await?;

        for (target, output) in results {
            sqlx::query(
                "INSERT OR IGNORE INTO task_run_results (task_id, run_time, target, result) VALUES (?, ?, ?, ?)",
            )
            .bind(&task.id)
            .bind(run_time)
            .bind(target)
            .bind(output)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to record run {} of task {}", run_time, task.name))?;
        Ok(())
    }

    pub async fn delete(pool: &Pool<Sqlite>, name: &str) -> Result<()> {
        let mut tx = pool.begin().await?;

        let row = sqlx::query("SELECT id FROM tasks WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let id: String = match row {
            Some(row) => row.get("id"),
            None => return Err(super::NotFoundError::new("Task", name).into()),
        };

        sqlx::query("DELETE FROM task_run_results WHERE task_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_runs WHERE task_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
