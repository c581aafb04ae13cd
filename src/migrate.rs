//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//!
//! # Schema
//!
//! ```text
//! ┌────────────────────┐     ┌──────────────────────┐
//! │       chunks       │──┐  │ sequence_references  │
//! │                    │  │  │                      │
//! │ id (PK)            │  ├──│ caller_chunk_id (FK) │
//! │ file_path          │  └──│ callee_chunk_id (FK) │
//! │ file_hash          │     │ sequence_key         │
//! │ chunk_index        │     │ timestamp            │
//! │ start/end_line     │     └──────────────────────┘
//! │ resource_name/type │
//! │ chunk_type         │     ┌──────────────────────┐
//! │ parent_chunk_id    │     │  chunks_fts (FTS5)   │
//! │ embedding BLOB     │     │                      │
//! │ content_hash       │─────│ chunk_id (UNINDEXED) │
//! │ semantic_type      │     │ embedding_text       │
//! │ semantic_intent    │     └──────────────────────┘
//! │ context_json       │
//! │ sequence_key       │
//! │ is_sequence_def    │
//! │ referenced_seqs    │
//! │ timestamp          │
//! │ embedding_text     │
//! └────────────────────┘
//! ```
//!
//! The unique index on `(file_path, chunk_index, start_line, end_line)` is
//! the chunk identity used by the incremental pipeline; `chunks_fts` is the
//! BM25-rankable sparse mirror kept bijective with `chunks` by the store's
//! write paths.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all migrations. Safe to call multiple times.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            resource_name TEXT NOT NULL,
            resource_type TEXT NOT NULL,
            chunk_type TEXT NOT NULL,
            parent_chunk_id INTEGER,
            embedding BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            semantic_type TEXT NOT NULL,
            semantic_intent TEXT NOT NULL,
            context_json TEXT NOT NULL DEFAULT '{}',
            sequence_key TEXT,
            is_sequence_definition INTEGER NOT NULL DEFAULT 0,
            referenced_sequences TEXT,
            timestamp INTEGER NOT NULL,
            embedding_text TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_identity
        ON chunks(file_path, chunk_index, start_line, end_line)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequence_references (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            caller_chunk_id INTEGER NOT NULL,
            callee_chunk_id INTEGER NOT NULL,
            sequence_key TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            FOREIGN KEY (caller_chunk_id) REFERENCES chunks(id) ON DELETE CASCADE,
            FOREIGN KEY (callee_chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_seq_refs_caller ON sequence_references(caller_chunk_id)",
    )
    .execute(pool)
    .await?;

    // FTS5 virtual tables have no IF NOT EXISTS; check sqlite_master first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                embedding_text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}
