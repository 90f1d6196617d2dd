//! Thin persistence layer for the REST glue (§4.M / §3 Repository &
//! Settings record): a small embedded SQLite database, queried with plain
//! runtime `sqlx` calls rather than the `query!` macro (no compile-time
//! database connection is available to this crate's build). No Git
//! plumbing lives here — `local_path`/`default_branch` are stored exactly
//! as given by the caller.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    pub name: String,
    pub local_path: String,
    pub default_branch: String,
    pub created_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRecordStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub cli: String,
    pub work_dir: String,
    pub status: SessionRecordStatus,
    pub created_unix: i64,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS repos (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                local_path TEXT NOT NULL,
                default_branch TEXT NOT NULL,
                created_unix INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                cli TEXT NOT NULL,
                work_dir TEXT NOT NULL,
                status TEXT NOT NULL,
                created_unix INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>> {
        let rows = sqlx::query(
            "SELECT id, name, local_path, default_branch, created_unix FROM repos ORDER BY created_unix",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_repo).collect())
    }

    pub async fn add_repo(&self, name: &str, local_path: &str, default_branch: &str) -> Result<Repo> {
        let repo = Repo {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            local_path: local_path.to_string(),
            default_branch: default_branch.to_string(),
            created_unix: now_unix(),
        };
        sqlx::query(
            "INSERT INTO repos (id, name, local_path, default_branch, created_unix) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&repo.id)
        .bind(&repo.name)
        .bind(&repo.local_path)
        .bind(&repo.default_branch)
        .bind(repo.created_unix)
        .execute(&self.pool)
        .await?;
        Ok(repo)
    }

    pub async fn remove_repo(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM repos WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_repo(&self, id: &str) -> Result<Option<Repo>> {
        let row = sqlx::query(
            "SELECT id, name, local_path, default_branch, created_unix FROM repos WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_repo))
    }

    pub async fn list_settings(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_session_started(&self, id: &str, cli: &str, work_dir: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, cli, work_dir, status, created_unix) VALUES (?, ?, ?, 'running', ?)
             ON CONFLICT(id) DO UPDATE SET status = 'running'",
        )
        .bind(id)
        .bind(cli)
        .bind(work_dir)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_session_stopped(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = 'stopped' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_session_records(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT id, cli, work_dir, status, created_unix FROM sessions")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| SessionRecord {
                id: r.get("id"),
                cli: r.get("cli"),
                work_dir: r.get("work_dir"),
                status: if r.get::<String, _>("status") == "running" {
                    SessionRecordStatus::Running
                } else {
                    SessionRecordStatus::Stopped
                },
                created_unix: r.get("created_unix"),
            })
            .collect())
    }

    /// Server-startup reconciliation (§7): sessions the database believes
    /// are running but the shepherd no longer reports are marked stopped.
    /// Sessions the shepherd reports but the database has never seen are
    /// left alone.
    pub async fn reconcile_with_live_sessions(&self, live_ids: &[String]) -> Result<()> {
        let records = self.list_session_records().await?;
        for record in records {
            if record.status == SessionRecordStatus::Running
                && !live_ids.contains(&record.id)
            {
                self.mark_session_stopped(&record.id).await?;
            }
        }
        Ok(())
    }
}

fn row_to_repo(row: &sqlx::sqlite::SqliteRow) -> Repo {
    Repo {
        id: row.get("id"),
        name: row.get("name"),
        local_path: row.get("local_path"),
        default_branch: row.get("default_branch"),
        created_unix: row.get("created_unix"),
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        Store::connect(&std::env::temp_dir().join(format!("sp-test-{}.db", uuid::Uuid::new_v4())))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn add_and_list_repo_round_trips() {
        let store = test_store().await;
        store.add_repo("demo", "/tmp/demo", "main").await.unwrap();
        let repos = store.list_repos().await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "demo");
    }

    #[tokio::test]
    async fn settings_round_trip_and_overwrite() {
        let store = test_store().await;
        store.set_setting("theme", "dark").await.unwrap();
        assert_eq!(store.get_setting("theme").await.unwrap().as_deref(), Some("dark"));
        store.set_setting("theme", "light").await.unwrap();
        assert_eq!(store.get_setting("theme").await.unwrap().as_deref(), Some("light"));
    }

    #[tokio::test]
    async fn reconciliation_marks_missing_sessions_stopped() {
        let store = test_store().await;
        store.record_session_started("s1", "claude", "/tmp").await.unwrap();
        store.record_session_started("s2", "claude", "/tmp").await.unwrap();
        store.reconcile_with_live_sessions(&["s1".to_string()]).await.unwrap();

        let records = store.list_session_records().await.unwrap();
        let s1 = records.iter().find(|r| r.id == "s1").unwrap();
        let s2 = records.iter().find(|r| r.id == "s2").unwrap();
        assert_eq!(s1.status, SessionRecordStatus::Running);
        assert_eq!(s2.status, SessionRecordStatus::Stopped);
    }
}
