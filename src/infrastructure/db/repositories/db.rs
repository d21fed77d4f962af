use crate::domain::error::{AppError, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA_V1: &str = include_str!("../../../../resources/schema.sql");
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Handle to the control-plane database. Cheap to clone; all repositories
/// share the underlying pool.
#[derive(Clone)]
pub struct TrainingDb {
    pool: SqlitePool,
}

impl TrainingDb {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        let db_url = db_path_to_url(db_path)?;
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| AppError::DatabaseError(format!("Failed to parse DB URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect DB: {e}")))?;

        apply_migrations(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_migrations(pool: &SqlitePool) -> Result<()> {
    // Minimal migration mechanism:
    // - PRAGMA user_version tracks the schema version.
    // - v1 == schema.sql (current full schema).
    // - Future migrations increment user_version and apply incremental statements.
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to read DB user_version: {e}")))?;

    if version < 1 {
        apply_full_schema(pool).await?;
    }

    if version < CURRENT_SCHEMA_VERSION {
        let pragma = format!("PRAGMA user_version = {}", CURRENT_SCHEMA_VERSION);
        sqlx::query(&pragma)
            .execute(pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to set DB user_version: {e}")))?;
    }

    Ok(())
}

async fn apply_full_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA_V1.split(';') {
        let stmt = statement.trim();
        if stmt.is_empty() {
            continue;
        }
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to apply schema: {e}")))?;
    }
    Ok(())
}

fn db_path_to_url(db_path: &Path) -> Result<String> {
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| AppError::DatabaseError("DB path is not valid UTF-8".to_string()))?;
    Ok(format!("sqlite://{}", db_path_str.replace("\\", "/")))
}
