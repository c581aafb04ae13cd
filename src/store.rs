//! SQLite-backed chunk store.
//!
//! Owns the `chunks` table, the `sequence_references` edge table, and the
//! `chunks_fts` sparse mirror. Every write path keeps the mirror bijective
//! with `chunks` on `chunk_id`; updates are delete-then-insert because FTS5
//! has no in-place update.

use anyhow::Result;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::db;
use crate::error::IndexError;
use crate::migrate;
use crate::models::StoredChunk;

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open the store, attempting one automatic recovery on a corrupt file.
    ///
    /// ABI-mismatch-class failures are surfaced without touching the file;
    /// any other open failure deletes the database and its WAL/SHM sidecars
    /// and reopens once. A second failure disables the service.
    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        match Self::try_open(db_path).await {
            Ok(store) => Ok(store),
            Err(first) => {
                let message = first.to_string();
                if IndexError::is_abi_mismatch(&message) {
                    return Err(IndexError::StoreAbiMismatch(message));
                }
                warn!(error = %message, path = %db_path.display(), "store open failed; recovering");
                db::remove_store_files(db_path);
                Self::try_open(db_path)
                    .await
                    .map_err(|second| IndexError::StoreCorruption(second.to_string()))
            }
        }
    }

    async fn try_open(db_path: &Path) -> Result<Self> {
        let pool = db::connect(db_path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single connection keeps every statement
    /// on the same `:memory:` database.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a chunk and its FTS mirror row. `chunk.id` is ignored; the
    /// store-assigned id is returned.
    pub async fn insert(&self, chunk: &StoredChunk) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO chunks (file_path, file_hash, chunk_index, start_line, end_line,
                                resource_name, resource_type, chunk_type, parent_chunk_id,
                                embedding, content_hash, semantic_type, semantic_intent,
                                context_json, sequence_key, is_sequence_definition,
                                referenced_sequences, timestamp, embedding_text)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.file_path)
        .bind(&chunk.file_hash)
        .bind(chunk.chunk_index)
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .bind(&chunk.resource_name)
        .bind(&chunk.resource_type)
        .bind(&chunk.chunk_type)
        .bind(chunk.parent_chunk_id)
        .bind(&chunk.embedding)
        .bind(&chunk.content_hash)
        .bind(&chunk.semantic_type)
        .bind(&chunk.semantic_intent)
        .bind(chunk.context.to_string())
        .bind(&chunk.sequence_key)
        .bind(chunk.is_sequence_definition as i64)
        .bind(serde_json::to_string(&chunk.referenced_sequences)?)
        .bind(chunk.timestamp)
        .bind(&chunk.embedding_text)
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();

        sqlx::query("INSERT INTO chunks_fts (chunk_id, embedding_text) VALUES (?, ?)")
            .bind(id)
            .bind(&chunk.embedding_text)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Overwrite a chunk in place, embedding included. The FTS row is
    /// deleted and re-inserted.
    pub async fn update(&self, id: i64, chunk: &StoredChunk) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE chunks SET
                file_path = ?, file_hash = ?, chunk_index = ?, start_line = ?, end_line = ?,
                resource_name = ?, resource_type = ?, chunk_type = ?, parent_chunk_id = ?,
                embedding = ?, content_hash = ?, semantic_type = ?, semantic_intent = ?,
                context_json = ?, sequence_key = ?, is_sequence_definition = ?,
                referenced_sequences = ?, timestamp = ?, embedding_text = ?
            WHERE id = ?
            "#,
        )
        .bind(&chunk.file_path)
        .bind(&chunk.file_hash)
        .bind(chunk.chunk_index)
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .bind(&chunk.resource_name)
        .bind(&chunk.resource_type)
        .bind(&chunk.chunk_type)
        .bind(chunk.parent_chunk_id)
        .bind(&chunk.embedding)
        .bind(&chunk.content_hash)
        .bind(&chunk.semantic_type)
        .bind(&chunk.semantic_intent)
        .bind(chunk.context.to_string())
        .bind(&chunk.sequence_key)
        .bind(chunk.is_sequence_definition as i64)
        .bind(serde_json::to_string(&chunk.referenced_sequences)?)
        .bind(chunk.timestamp)
        .bind(&chunk.embedding_text)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, embedding_text) VALUES (?, ?)")
            .bind(id)
            .bind(&chunk.embedding_text)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Metadata-only refresh for a reused chunk: everything but the stored
    /// embedding bytes.
    pub async fn update_metadata(&self, id: i64, chunk: &StoredChunk) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE chunks SET
                file_path = ?, file_hash = ?, chunk_index = ?, start_line = ?, end_line = ?,
                resource_name = ?, resource_type = ?, chunk_type = ?, parent_chunk_id = ?,
                content_hash = ?, semantic_type = ?, semantic_intent = ?,
                context_json = ?, sequence_key = ?, is_sequence_definition = ?,
                referenced_sequences = ?, timestamp = ?, embedding_text = ?
            WHERE id = ?
            "#,
        )
        .bind(&chunk.file_path)
        .bind(&chunk.file_hash)
        .bind(chunk.chunk_index)
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .bind(&chunk.resource_name)
        .bind(&chunk.resource_type)
        .bind(&chunk.chunk_type)
        .bind(chunk.parent_chunk_id)
        .bind(&chunk.content_hash)
        .bind(&chunk.semantic_type)
        .bind(&chunk.semantic_intent)
        .bind(chunk.context.to_string())
        .bind(&chunk.sequence_key)
        .bind(chunk.is_sequence_definition as i64)
        .bind(serde_json::to_string(&chunk.referenced_sequences)?)
        .bind(chunk.timestamp)
        .bind(&chunk.embedding_text)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, embedding_text) VALUES (?, ?)")
            .bind(id)
            .bind(&chunk.embedding_text)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove every chunk (and FTS row) for one file. Reference edges go
    /// with them via the cascade.
    pub async fn delete_by_file(&self, file_path: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE file_path = ?)",
        )
        .bind(file_path)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM chunks WHERE file_path = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn get_by_file(&self, file_path: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE file_path = ? ORDER BY chunk_index")
            .bind(file_path)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn get_all(&self) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query("SELECT * FROM chunks ORDER BY file_path, chunk_index")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Latest known file hash per path, for warm-starting the scanner.
    pub async fn latest_file_hashes(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT file_path, file_hash, MAX(timestamp) AS ts FROM chunks GROUP BY file_path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("file_path"), row.get("file_hash")))
            .collect())
    }

    /// Resolve a qualified reference (`kind:name`) to a definition chunk id.
    ///
    /// Matches on the name only unless `qualified` is set; kind-blind
    /// matching preserves the behavior of the system this index was built
    /// against.
    pub async fn find_definition(&self, reference: &str, qualified: bool) -> Result<Option<i64>> {
        let (kind, name) = match reference.split_once(':') {
            Some((kind, name)) => (kind, name),
            None => ("", reference),
        };

        let id: Option<i64> = if qualified && !kind.is_empty() {
            sqlx::query_scalar(
                r#"
                SELECT id FROM chunks
                WHERE is_sequence_definition = 1 AND sequence_key = ?
                  AND (chunk_type = ? OR chunk_type LIKE '%:' || ?)
                ORDER BY id LIMIT 1
                "#,
            )
            .bind(name)
            .bind(kind)
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                r#"
                SELECT id FROM chunks
                WHERE is_sequence_definition = 1 AND sequence_key = ?
                ORDER BY id LIMIT 1
                "#,
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        };

        Ok(id)
    }

    /// Insert a caller → callee edge.
    pub async fn link_reference(
        &self,
        caller_chunk_id: i64,
        callee_chunk_id: i64,
        sequence_key: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO sequence_references (caller_chunk_id, callee_chunk_id, sequence_key, timestamp)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(caller_chunk_id)
        .bind(callee_chunk_id)
        .bind(sequence_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop a caller's outgoing edges ahead of re-linking.
    pub async fn clear_references(&self, caller_chunk_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sequence_references WHERE caller_chunk_id = ?")
            .bind(caller_chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reference_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sequence_references")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn fts_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_fts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// BM25 candidates for a query, best first. FTS rank values are negative
    /// with most-negative best; callers normalize. A malformed MATCH
    /// expression yields an empty set rather than an error.
    pub async fn bm25_candidates(&self, query: &str, limit: i64) -> Result<Vec<(i64, f64)>> {
        let result = sqlx::query(
            r#"
            SELECT chunk_id, rank FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(rows) => Ok(rows
                .iter()
                .map(|row| (row.get::<i64, _>("chunk_id"), row.get::<f64, _>("rank")))
                .collect()),
            Err(sqlx::Error::Database(e)) => {
                let err = IndexError::FtsSyntax(e.to_string());
                warn!(error = %err, "returning empty sparse set");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<StoredChunk> {
    let context_json: String = row.get("context_json");
    let context: Value = serde_json::from_str(&context_json).unwrap_or(Value::Null);
    let refs_json: Option<String> = row.get("referenced_sequences");
    let referenced_sequences: Vec<String> = refs_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    Ok(StoredChunk {
        id: row.get("id"),
        file_path: row.get("file_path"),
        file_hash: row.get("file_hash"),
        chunk_index: row.get("chunk_index"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        resource_name: row.get("resource_name"),
        resource_type: row.get("resource_type"),
        chunk_type: row.get("chunk_type"),
        parent_chunk_id: row.get("parent_chunk_id"),
        embedding: row.get("embedding"),
        content_hash: row.get("content_hash"),
        semantic_type: row.get("semantic_type"),
        semantic_intent: row.get("semantic_intent"),
        context,
        sequence_key: row.get("sequence_key"),
        is_sequence_definition: row.get::<i64, _>("is_sequence_definition") != 0,
        referenced_sequences,
        timestamp: row.get("timestamp"),
        embedding_text: row.get("embedding_text"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_chunk(file: &str, index: i64, lines: (i64, i64)) -> StoredChunk {
        StoredChunk {
            id: 0,
            file_path: file.to_string(),
            file_hash: "filehash".to_string(),
            chunk_index: index,
            start_line: lines.0,
            end_line: lines.1,
            resource_name: "OrderApi".to_string(),
            resource_type: "api".to_string(),
            chunk_type: "resource".to_string(),
            parent_chunk_id: None,
            embedding: crate::embedding::vec_to_blob(&[0.1, 0.2, 0.3]),
            content_hash: format!("hash-{}-{}", file, index),
            semantic_type: "api".to_string(),
            semantic_intent: "mediation".to_string(),
            context: json!({"artifact": {"type": "api", "name": "OrderApi"}}),
            sequence_key: None,
            is_sequence_definition: false,
            referenced_sequences: vec!["sequence:AuditSeq".to_string()],
            timestamp: 1_700_000_000_000,
            embedding_text: "Artifact: name=OrderApi type=api resource methods=GET".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_then_get_roundtrips_all_fields() {
        let store = Store::open_in_memory().await.unwrap();
        let chunk = sample_chunk("/p/a.xml", 0, (1, 10));
        let id = store.insert(&chunk).await.unwrap();
        assert!(id > 0);

        let fetched = store.get_by_file("/p/a.xml").await.unwrap();
        assert_eq!(fetched.len(), 1);
        let got = &fetched[0];
        assert_eq!(got.id, id);
        assert_eq!(got.file_hash, chunk.file_hash);
        assert_eq!(got.chunk_index, chunk.chunk_index);
        assert_eq!(got.start_line, chunk.start_line);
        assert_eq!(got.end_line, chunk.end_line);
        assert_eq!(got.resource_name, chunk.resource_name);
        assert_eq!(got.chunk_type, chunk.chunk_type);
        assert_eq!(got.embedding, chunk.embedding);
        assert_eq!(got.content_hash, chunk.content_hash);
        assert_eq!(got.context, chunk.context);
        assert_eq!(got.referenced_sequences, chunk.referenced_sequences);
        assert_eq!(got.embedding_text, chunk.embedding_text);
        assert!(!got.is_sequence_definition);
    }

    #[tokio::test]
    async fn fts_mirror_stays_bijective() {
        let store = Store::open_in_memory().await.unwrap();
        let id1 = store.insert(&sample_chunk("/p/a.xml", 0, (1, 5))).await.unwrap();
        let _id2 = store.insert(&sample_chunk("/p/a.xml", 1, (6, 9))).await.unwrap();
        assert_eq!(store.fts_count().await.unwrap(), 2);

        let mut updated = sample_chunk("/p/a.xml", 0, (1, 5));
        updated.embedding_text = "changed text".to_string();
        store.update(id1, &updated).await.unwrap();
        assert_eq!(store.fts_count().await.unwrap(), 2);

        store.delete(id1).await.unwrap();
        assert_eq!(store.fts_count().await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_by_file_clears_chunks_and_mirror() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert(&sample_chunk("/p/a.xml", 0, (1, 5))).await.unwrap();
        store.insert(&sample_chunk("/p/a.xml", 1, (6, 9))).await.unwrap();
        store.insert(&sample_chunk("/p/b.xml", 0, (1, 5))).await.unwrap();

        let removed = store.delete_by_file("/p/a.xml").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.fts_count().await.unwrap(), 1);
        assert!(store.get_by_file("/p/a.xml").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unique_identity_index_rejects_duplicates() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert(&sample_chunk("/p/a.xml", 0, (1, 5))).await.unwrap();
        assert!(store.insert(&sample_chunk("/p/a.xml", 0, (1, 5))).await.is_err());
    }

    #[tokio::test]
    async fn latest_file_hashes_reports_each_file_once() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert(&sample_chunk("/p/a.xml", 0, (1, 5))).await.unwrap();
        store.insert(&sample_chunk("/p/a.xml", 1, (6, 9))).await.unwrap();
        store.insert(&sample_chunk("/p/b.xml", 0, (1, 5))).await.unwrap();

        let hashes = store.latest_file_hashes().await.unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes.get("/p/a.xml").map(String::as_str), Some("filehash"));
    }

    #[tokio::test]
    async fn find_definition_matches_name_only_by_default() {
        let store = Store::open_in_memory().await.unwrap();
        let mut def = sample_chunk("/p/seq.xml", 0, (1, 5));
        def.chunk_type = "sequence".to_string();
        def.sequence_key = Some("AuditSeq".to_string());
        def.is_sequence_definition = true;
        let def_id = store.insert(&def).await.unwrap();

        // Kind-blind: an endpoint-flavored reference still resolves by name.
        assert_eq!(
            store.find_definition("endpoint:AuditSeq", false).await.unwrap(),
            Some(def_id)
        );
        // Qualified: the kind must match the chunk type.
        assert_eq!(
            store.find_definition("endpoint:AuditSeq", true).await.unwrap(),
            None
        );
        assert_eq!(
            store.find_definition("sequence:AuditSeq", true).await.unwrap(),
            Some(def_id)
        );
    }

    #[tokio::test]
    async fn reference_edges_cascade_on_chunk_delete() {
        let store = Store::open_in_memory().await.unwrap();
        let caller = store.insert(&sample_chunk("/p/a.xml", 0, (1, 5))).await.unwrap();
        let callee = store.insert(&sample_chunk("/p/b.xml", 0, (1, 5))).await.unwrap();
        store.link_reference(caller, callee, "AuditSeq").await.unwrap();
        assert_eq!(store.reference_count().await.unwrap(), 1);

        store.delete(callee).await.unwrap();
        assert_eq!(store.reference_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bm25_orders_best_match_first() {
        let store = Store::open_in_memory().await.unwrap();
        let mut a = sample_chunk("/p/a.xml", 0, (1, 5));
        a.embedding_text = "order payment validation sequence".to_string();
        let mut b = sample_chunk("/p/b.xml", 0, (1, 5));
        b.embedding_text = "logging audit trail".to_string();
        let id_a = store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let hits = store.bm25_candidates("payment", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id_a);
        assert!(hits[0].1 < 0.0, "FTS5 rank is negative, got {}", hits[0].1);
    }

    #[tokio::test]
    async fn malformed_fts_query_yields_empty_set() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert(&sample_chunk("/p/a.xml", 0, (1, 5))).await.unwrap();
        let hits = store.bm25_candidates("\"unbalanced (", 10).await.unwrap();
        assert!(hits.is_empty());
    }
}
