use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

pub struct Store {
    pool: SqlitePool,
}

impl Store {
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
            "CREATE TABLE IF NOT EXISTS secrets (
                `key` TEXT NOT NULL,
                `value` BLOB NOT NULL,
                PRIMARY KEY (`key`)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// A missing key is not an error: it reads as the empty string.
    pub async fn get(&self, key: &str) -> Result<String, sqlx::Error> {
        let row = sqlx::query("SELECT value FROM secrets WHERE `key` = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|row| String::from_utf8_lossy(&row.get::<Vec<u8>, _>(0)).into_owned())
            .unwrap_or_default())
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query("REPLACE INTO secrets (`key`, `value`) VALUES (?, ?)")
            .bind(key)
            .bind(value.as_bytes())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM secrets WHERE `key` = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
