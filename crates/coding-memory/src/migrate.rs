//! Database schema migrations.
//!
//! Every statement is idempotent, so migrations run on each start.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `records` | One row per record, all seven kinds, JSON body + vector BLOB |
//! | `records_fts` | FTS5 index over each record's search text |
//! | `sync_state` | One row per `(source, project)` import pair |

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            record_type TEXT NOT NULL,
            project_id TEXT NOT NULL,
            session_id TEXT,
            ordinal INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            started_at INTEGER,
            message_count INTEGER,
            body TEXT NOT NULL,
            embedding BLOB,
            embedding_provider TEXT,
            embedding_dims INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            project_id TEXT NOT NULL,
            state_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='records_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE records_fts USING fts5(
                record_id UNINDEXED,
                record_type UNINDEXED,
                project_id UNINDEXED,
                search_text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_type_project ON records(record_type, project_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_session ON records(session_id, ordinal)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(record_type, created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
