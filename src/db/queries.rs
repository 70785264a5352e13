//! SQL for the two durable cache backends.
//!
//! Each upsert is a single statement, so a reader sees either the previous
//! payload or the new one, never a mix.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, SqlitePool};

// ---------------------------------------------------------------------------
// Postgres (networked)
// ---------------------------------------------------------------------------

pub async fn pg_init(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS forecast_cache (
            key         TEXT PRIMARY KEY,
            payload     JSONB NOT NULL,
            expires_at  TIMESTAMPTZ,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Get a non-expired payload.
pub async fn pg_get(
    pool: &PgPool,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    sqlx::query_scalar::<_, serde_json::Value>(
        "SELECT payload FROM forecast_cache
         WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)",
    )
    .bind(key)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Insert or overwrite a payload (last writer wins).
pub async fn pg_upsert(
    pool: &PgPool,
    key: &str,
    payload: &serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO forecast_cache (key, payload, expires_at, updated_at)
         VALUES ($1, $2, $3, NOW())
         ON CONFLICT (key) DO UPDATE
            SET payload = EXCLUDED.payload,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()",
    )
    .bind(key)
    .bind(payload)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn pg_purge_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM forecast_cache WHERE expires_at IS NOT NULL AND expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn pg_ping(pool: &PgPool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}

// ---------------------------------------------------------------------------
// SQLite (local durable). Payload as JSON text, expiry as unix milliseconds.
// ---------------------------------------------------------------------------

pub async fn sqlite_init(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS forecast_cache (
            key         TEXT PRIMARY KEY,
            payload     TEXT NOT NULL,
            expires_at  INTEGER,
            updated_at  INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn sqlite_get(
    pool: &SqlitePool,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT payload FROM forecast_cache
         WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
    )
    .bind(key)
    .bind(now.timestamp_millis())
    .fetch_optional(pool)
    .await
}

pub async fn sqlite_upsert(
    pool: &SqlitePool,
    key: &str,
    payload: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO forecast_cache (key, payload, expires_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (key) DO UPDATE
            SET payload = excluded.payload,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(payload)
    .bind(expires_at.map(|t| t.timestamp_millis()))
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn sqlite_purge_expired(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM forecast_cache WHERE expires_at IS NOT NULL AND expires_at <= ?1")
            .bind(now.timestamp_millis())
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

pub async fn sqlite_ping(pool: &SqlitePool) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .is_ok()
}
