use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct JobRow {
    pub name: String,
    pub schedule: String,
    pub last_execution: Option<String>,
    pub next_execution: String,
    pub last_exit_code: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, sqlx::FromRow)]
pub struct ActivityRow {
    pub id: i64,
    pub name: String,
    pub run_at: String,
    pub exit_code: i64,
    pub execution_time: i64,
}

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS activity (
                id INTEGER PRIMARY KEY,
                name TEXT,
                run_at TEXT,
                exit_code INTEGER,
                execution_time INTEGER,
                log TEXT
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS activity_name ON activity (name)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS activity_run_at ON activity (run_at desc)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// The jobs table mirrors the current `SCHEDULER_CONFIG`, so it is
    /// rebuilt from scratch on every server start.
    pub async fn reset_jobs(&self) -> Result<(), sqlx::Error> {
        sqlx::query("DROP TABLE IF EXISTS jobs")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE jobs (
                name TEXT PRIMARY KEY,
                schedule TEXT NOT NULL,
                last_execution TEXT NULL,
                next_execution TEXT NOT NULL,
                last_exit_code INTEGER NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_job(
        &self,
        name: &str,
        schedule: &str,
        next_execution: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO jobs (name, schedule, next_execution) VALUES (?, ?, ?)")
            .bind(name)
            .bind(schedule)
            .bind(next_execution.format(TIME_FORMAT).to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_run(
        &self,
        name: &str,
        run_at: DateTime<Utc>,
        next_execution: Option<DateTime<Utc>>,
        exit_code: i64,
        execution_time_ms: i64,
        log: &str,
    ) -> Result<(), sqlx::Error> {
        let run_at = run_at.format(TIME_FORMAT).to_string();
        let next = next_execution
            .map(|next| next.format(TIME_FORMAT).to_string())
            .unwrap_or_default();

        sqlx::query(
            "UPDATE jobs SET last_execution = ?, next_execution = ?, last_exit_code = ? WHERE name = ?",
        )
        .bind(&run_at)
        .bind(next)
        .bind(exit_code)
        .bind(name)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO activity (name, run_at, exit_code, execution_time, log) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(&run_at)
        .bind(exit_code)
        .bind(execution_time_ms)
        .bind(log)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn purge_activity_before(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM activity WHERE run_at < ?")
            .bind(cutoff.format(TIME_FORMAT).to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRow>, sqlx::Error> {
        sqlx::query_as("SELECT name, schedule, last_execution, next_execution, last_exit_code FROM jobs ORDER BY name")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn history(&self, name: &str) -> Result<Vec<ActivityRow>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id, name, run_at, exit_code, execution_time FROM activity WHERE name = ? ORDER BY run_at DESC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn run_log(&self, id: i64) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT log FROM activity WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;
    use pretty_assertions::assert_eq;

    use super::*;

    async fn memory_persistence() -> Persistence {
        let persistence = Persistence::open(":memory:").await.unwrap();
        persistence.reset_jobs().await.unwrap();
        persistence
    }

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, TIME_FORMAT)
            .unwrap()
            .and_utc()
    }

    #[tokio::test]
    async fn test_jobs_rebuild_and_run_recording() {
        let persistence = memory_persistence().await;

        persistence
            .insert_job("tick", "* * * * *", at("2026-08-01 10:01:00"))
            .await
            .unwrap();

        persistence
            .record_run(
                "tick",
                at("2026-08-01 10:01:00"),
                Some(at("2026-08-01 10:02:00")),
                0,
                42,
                "ok\n",
            )
            .await
            .unwrap();

        let jobs = persistence.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].last_execution.as_deref(), Some("2026-08-01 10:01:00"));
        assert_eq!(jobs[0].next_execution, "2026-08-01 10:02:00");
        assert_eq!(jobs[0].last_exit_code, Some(0));

        let history = persistence.history("tick").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].exit_code, 0);
        assert_eq!(history[0].execution_time, 42);

        let log = persistence.run_log(history[0].id).await.unwrap();
        assert_eq!(log.as_deref(), Some("ok\n"));
    }

    #[tokio::test]
    async fn test_activity_retention_cutoff() {
        let persistence = memory_persistence().await;
        persistence
            .insert_job("tick", "* * * * *", at("2026-08-01 10:00:00"))
            .await
            .unwrap();

        persistence
            .record_run("tick", at("2026-07-20 10:00:00"), None, 0, 1, "old")
            .await
            .unwrap();
        persistence
            .record_run("tick", at("2026-08-01 10:00:00"), None, 0, 1, "new")
            .await
            .unwrap();

        let deleted = persistence
            .purge_activity_before(at("2026-07-25 00:00:00"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let history = persistence.history("tick").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_at, "2026-08-01 10:00:00");
    }

    #[tokio::test]
    async fn test_unknown_log_id() {
        let persistence = memory_persistence().await;
        assert_eq!(persistence.run_log(99).await.unwrap(), None);
    }
}
