//! PostgreSQL state store
//!
//! Agents and locks are stored column by column; tasks keep their key
//! columns next to the full row as JSONB so new task fields need no
//! migration.

use ai_agent_common::{Agent, AgentStatus, FileLock, PersistedState, StateStore, Task, TaskId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS coord_agents (
        name TEXT PRIMARY KEY,
        role TEXT NOT NULL,
        status TEXT NOT NULL,
        current_task TEXT,
        hired_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS coord_file_locks (
        path TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        description TEXT NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS coord_tasks (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        seq BIGINT NOT NULL,
        body JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create coordinator tables")?;
        }
        info!("PostgreSQL state tables ready");
        Ok(())
    }

    /// Drop every row; used by tests sharing one database
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE coord_agents, coord_file_locks, coord_tasks")
            .execute(&self.pool)
            .await
            .context("Failed to clear coordinator tables")?;
        Ok(())
    }

    async fn load_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT name, role, status, current_task, hired_at FROM coord_agents ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load agents")?;

        rows.iter()
            .map(|row| -> Result<Agent> {
                let status: String = row.try_get("status")?;
                let current: Option<String> = row.try_get("current_task")?;
                Ok(Agent {
                    name: row.try_get("name")?,
                    role: row.try_get("role")?,
                    status: AgentStatus::from_str(&status)
                        .with_context(|| format!("Unknown agent status '{}'", status))?,
                    current_task: current.map(TaskId::from),
                    hired_at: row.try_get("hired_at")?,
                })
            })
            .collect()
    }

    async fn load_locks(&self) -> Result<Vec<FileLock>> {
        let rows = sqlx::query(
            "SELECT path, owner, description, acquired_at FROM coord_file_locks ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load file locks")?;

        rows.iter()
            .map(|row| -> Result<FileLock> {
                let path: String = row.try_get("path")?;
                Ok(FileLock {
                    path: PathBuf::from(path),
                    owner: row.try_get("owner")?,
                    description: row.try_get("description")?,
                    acquired_at: row.try_get::<DateTime<Utc>, _>("acquired_at")?,
                })
            })
            .collect()
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT id, body FROM coord_tasks ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load tasks")?;

        rows.iter()
            .map(|row| -> Result<Task> {
                let id: String = row.try_get("id")?;
                let body: serde_json::Value = row.try_get("body")?;
                serde_json::from_value(body).with_context(|| format!("Corrupt task row {}", id))
            })
            .collect()
    }
}

#[async_trait]
impl StateStore for PostgresStore {
    async fn load(&self) -> Result<PersistedState> {
        Ok(PersistedState {
            agents: self.load_agents().await?,
            locks: self.load_locks().await?,
            tasks: self.load_tasks().await?,
        })
    }

    async fn put_agent(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coord_agents (name, role, status, current_task, hired_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE SET
                role = EXCLUDED.role,
                status = EXCLUDED.status,
                current_task = EXCLUDED.current_task
            "#,
        )
        .bind(&agent.name)
        .bind(&agent.role)
        .bind(agent.status.to_string())
        .bind(agent.current_task.as_ref().map(|t| t.to_string()))
        .bind(agent.hired_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save agent {}", agent.name))?;
        Ok(())
    }

    async fn delete_agent(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM coord_agents WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete agent {}", name))?;
        Ok(())
    }

    async fn put_lock(&self, lock: &FileLock) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coord_file_locks (path, owner, description, acquired_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (path) DO UPDATE SET
                owner = EXCLUDED.owner,
                description = EXCLUDED.description,
                acquired_at = EXCLUDED.acquired_at
            "#,
        )
        .bind(lock.path.to_string_lossy().into_owned())
        .bind(&lock.owner)
        .bind(&lock.description)
        .bind(lock.acquired_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save lock on {}", lock.path.display()))?;
        Ok(())
    }

    async fn delete_lock(&self, path: &Path) -> Result<()> {
        sqlx::query("DELETE FROM coord_file_locks WHERE path = $1")
            .bind(path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete lock on {}", path.display()))?;
        Ok(())
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        let body = serde_json::to_value(task).context("Failed to serialize task")?;
        sqlx::query(
            r#"
            INSERT INTO coord_tasks (id, status, seq, body, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                seq = EXCLUDED.seq,
                body = EXCLUDED.body,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(task.id.as_str())
        .bind(task.status.to_string())
        .bind(task.seq as i64)
        .bind(body)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save task {}", task.id))?;
        Ok(())
    }
}
