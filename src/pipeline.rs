//! Indexing pipeline: Scanner → Chunker → (reuse | embed) → Store.
//!
//! Both entry points funnel through [`Pipeline::process_changes`]. For each
//! changed file the new chunking is reconciled against the stored rows by
//! slot `(chunk_index, start_line, end_line)`: a slot whose content hash is
//! unchanged keeps its embedding and database id and only refreshes its
//! metadata; a changed slot is re-embedded in place; a new slot is inserted;
//! stored rows whose slot is no longer produced are deleted. The per-file
//! Merkle diff lets a chunk whose identical content moved between slots
//! reuse the stored embedding instead of re-embedding.
//!
//! Per-item failures (parse, embed) are logged and skipped; they never
//! poison the pass.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactRegistry;
use crate::chunker::Chunker;
use crate::config::IndexConfig;
use crate::embedding::{vec_to_blob, Embedder, EmbedderTokenCounter};
use crate::error::IndexError;
use crate::hasher;
use crate::models::{ChunkDraft, FileChange, IndexStats, StoredChunk};
use crate::progress::{ProgressReporter, ProgressStage};
use crate::scanner::Scanner;
use crate::store::Store;

pub struct Pipeline<'a> {
    registry: &'a ArtifactRegistry,
    store: &'a Store,
    embedder: &'a dyn Embedder,
    config: &'a IndexConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        registry: &'a ArtifactRegistry,
        store: &'a Store,
        embedder: &'a dyn Embedder,
        config: &'a IndexConfig,
    ) -> Self {
        Self {
            registry,
            store,
            embedder,
            config,
        }
    }

    /// First pass after service start: warm-start the scanner from the
    /// store so untouched files are not re-indexed, then process whatever
    /// differs.
    pub async fn process_initial(
        &self,
        dirs: &[PathBuf],
        scanner: &mut Scanner,
        progress: &dyn ProgressReporter,
    ) -> Result<IndexStats> {
        let known = self.store.latest_file_hashes().await?;
        scanner.seed(known);
        self.process_incremental(dirs, scanner, progress).await
    }

    /// Scan the directories and reconcile every reported change.
    pub async fn process_incremental(
        &self,
        dirs: &[PathBuf],
        scanner: &mut Scanner,
        progress: &dyn ProgressReporter,
    ) -> Result<IndexStats> {
        progress.report(ProgressStage::Scanning, "scanning project", 0, 0);
        let changes = scanner.scan(dirs)?;
        self.process_changes(&changes, progress).await
    }

    pub async fn process_changes(
        &self,
        changes: &[FileChange],
        progress: &dyn ProgressReporter,
    ) -> Result<IndexStats> {
        let mut stats = IndexStats::default();
        let total = changes.len();
        let mut pending_refs: Vec<(i64, Vec<String>)> = Vec::new();

        for (file_index, change) in changes.iter().enumerate() {
            let path_str = change.path.display().to_string();
            progress.report(ProgressStage::Scanning, &path_str, file_index, total);

            if !change.exists {
                let removed = self.store.delete_by_file(&path_str).await?;
                stats.deleted += removed;
                stats.files_deleted += 1;
                info!(path = %path_str, chunks = removed, "removed deleted file from index");
                continue;
            }

            match self
                .process_file(change, &path_str, file_index, total, progress, &mut stats)
                .await
            {
                Ok(refs) => {
                    stats.files_processed += 1;
                    pending_refs.extend(refs);
                }
                Err(e) => {
                    warn!(path = %path_str, error = %e, "skipping file");
                }
            }
        }

        // Resolve references once every file of the pass is stored, so
        // definitions indexed later in the walk are still found.
        for (caller_id, references) in pending_refs {
            self.store.clear_references(caller_id).await?;
            for reference in &references {
                let callee = self
                    .store
                    .find_definition(reference, self.config.references.qualified)
                    .await?;
                if let Some(callee_id) = callee {
                    if callee_id != caller_id {
                        let name = reference.split_once(':').map(|(_, n)| n).unwrap_or(reference);
                        self.store.link_reference(caller_id, callee_id, name).await?;
                        stats.references_linked += 1;
                    }
                } else {
                    debug!(reference = %reference, "unresolved reference");
                }
            }
        }

        progress.report(
            ProgressStage::Complete,
            &format!(
                "{} embedded, {} reused, {} deleted",
                stats.embedded, stats.reused, stats.deleted
            ),
            total,
            total,
        );
        Ok(stats)
    }

    /// Reconcile one file; returns `(chunk_id, references)` pairs for the
    /// caller to resolve after the pass.
    async fn process_file(
        &self,
        change: &FileChange,
        path_str: &str,
        file_index: usize,
        total: usize,
        progress: &dyn ProgressReporter,
        stats: &mut IndexStats,
    ) -> Result<Vec<(i64, Vec<String>)>> {
        let counter = EmbedderTokenCounter(self.embedder);
        let chunker = Chunker::new(self.registry, &counter, self.config.chunking.max_tokens);
        let drafts = chunker
            .chunk_file(&change.path)
            .map_err(|e| IndexError::Parse {
                path: path_str.to_string(),
                message: e.to_string(),
            })?;

        let existing = self.store.get_by_file(path_str).await?;
        let by_slot: HashMap<(i64, i64, i64), &StoredChunk> = existing
            .iter()
            .map(|c| ((c.chunk_index, c.start_line, c.end_line), c))
            .collect();
        let by_hash: HashMap<&str, &StoredChunk> = existing
            .iter()
            .map(|c| (c.content_hash.as_str(), c))
            .collect();

        // Merkle diff: leaves outside the changed set may reuse stored
        // embeddings even when their slot moved.
        let old_tree = if existing.is_empty() {
            None
        } else {
            let rows: Vec<(String, serde_json::Value, i64, String)> = existing
                .iter()
                .map(|c| {
                    (
                        c.content_hash.clone(),
                        c.context.clone(),
                        c.chunk_index,
                        c.chunk_type.clone(),
                    )
                })
                .collect();
            Some(hasher::build_tree(&rows))
        };
        let new_tree = hasher::build_tree_for_drafts(&drafts);
        let changed: HashSet<String> =
            hasher::find_changed_leaves(old_tree.as_ref(), &new_tree)
                .into_iter()
                .collect();

        // Decide the write for every draft, then embed what needs it in one
        // batch.
        enum Write {
            ReuseSlot(i64),
            OverwriteSlot(i64, Option<Vec<u8>>),
            Insert(Option<Vec<u8>>),
        }

        let mut writes: Vec<Write> = Vec::with_capacity(drafts.len());
        let mut pending_texts: Vec<String> = Vec::new();
        let mut pending_slots: Vec<usize> = Vec::new();

        for (i, draft) in drafts.iter().enumerate() {
            let slot = by_slot.get(&(draft.chunk_index, draft.start_line, draft.end_line));
            match slot {
                Some(row) if row.content_hash == draft.content_hash => {
                    writes.push(Write::ReuseSlot(row.id));
                }
                Some(row) => {
                    let reusable = reuse_embedding(&by_hash, &changed, draft);
                    if reusable.is_none() {
                        pending_texts.push(draft.embedding_text.clone());
                        pending_slots.push(i);
                    }
                    writes.push(Write::OverwriteSlot(row.id, reusable));
                }
                None => {
                    let reusable = reuse_embedding(&by_hash, &changed, draft);
                    if reusable.is_none() {
                        pending_texts.push(draft.embedding_text.clone());
                        pending_slots.push(i);
                    }
                    writes.push(Write::Insert(reusable));
                }
            }
        }

        progress.report(ProgressStage::Embedding, path_str, file_index, total);
        let mut embedded_vectors: HashMap<usize, Vec<u8>> = HashMap::new();
        if !pending_texts.is_empty() {
            match self.embedder.embed(&pending_texts).await {
                Ok(vectors) => {
                    for (slot, vector) in pending_slots.iter().zip(vectors.iter()) {
                        embedded_vectors.insert(*slot, vec_to_blob(vector));
                    }
                }
                Err(e) => {
                    let err = IndexError::Embed(e.to_string());
                    warn!(path = %path_str, error = %err, "affected chunks skipped");
                }
            }
        }

        progress.report(ProgressStage::Updating, path_str, file_index, total);
        let now = chrono::Utc::now().timestamp_millis();
        let mut matched: HashSet<i64> = HashSet::new();
        let mut index_to_id: HashMap<usize, i64> = HashMap::new();
        let mut pending_refs: Vec<(i64, Vec<String>)> = Vec::new();

        for (i, (draft, write)) in drafts.iter().zip(writes.into_iter()).enumerate() {
            let parent_chunk_id = draft
                .parent_index
                .and_then(|p| index_to_id.get(&p).copied());
            let written_id = match write {
                Write::ReuseSlot(id) => {
                    let row = stored_from_draft(draft, change, parent_chunk_id, Vec::new(), now);
                    self.store.update_metadata(id, &row).await?;
                    matched.insert(id);
                    stats.reused += 1;
                    id
                }
                Write::OverwriteSlot(id, reusable) => {
                    let (blob, reused) = match reusable {
                        Some(blob) => (blob, true),
                        None => match embedded_vectors.remove(&i) {
                            Some(blob) => (blob, false),
                            None => {
                                // Embed failed; keep the stale row rather
                                // than dropping the slot.
                                matched.insert(id);
                                continue;
                            }
                        },
                    };
                    let row = stored_from_draft(draft, change, parent_chunk_id, blob, now);
                    self.store.update(id, &row).await?;
                    matched.insert(id);
                    if reused {
                        stats.reused += 1;
                    } else {
                        stats.embedded += 1;
                    }
                    id
                }
                Write::Insert(reusable) => {
                    let (blob, reused) = match reusable {
                        Some(blob) => (blob, true),
                        None => match embedded_vectors.remove(&i) {
                            Some(blob) => (blob, false),
                            None => continue,
                        },
                    };
                    let row = stored_from_draft(draft, change, parent_chunk_id, blob, now);
                    let id = self.store.insert(&row).await?;
                    matched.insert(id);
                    if reused {
                        stats.reused += 1;
                    } else {
                        stats.embedded += 1;
                    }
                    id
                }
            };
            index_to_id.insert(i, written_id);
            if !draft.referenced_sequences.is_empty() {
                pending_refs.push((written_id, draft.referenced_sequences.clone()));
            }
        }

        // Stored rows whose slot is no longer produced.
        for row in &existing {
            if !matched.contains(&row.id) {
                self.store.delete(row.id).await?;
                stats.deleted += 1;
            }
        }

        Ok(pending_refs)
    }
}

/// A stored embedding is reusable for a draft when an existing chunk of the
/// file carries the same content hash and the Merkle diff did not flag the
/// leaf as changed.
fn reuse_embedding(
    by_hash: &HashMap<&str, &StoredChunk>,
    changed: &HashSet<String>,
    draft: &ChunkDraft,
) -> Option<Vec<u8>> {
    if changed.contains(&draft.content_hash) {
        return None;
    }
    by_hash
        .get(draft.content_hash.as_str())
        .map(|row| row.embedding.clone())
}

fn stored_from_draft(
    draft: &ChunkDraft,
    change: &FileChange,
    parent_chunk_id: Option<i64>,
    embedding: Vec<u8>,
    now: i64,
) -> StoredChunk {
    StoredChunk {
        id: 0,
        file_path: change.path.display().to_string(),
        file_hash: change.hash.clone(),
        chunk_index: draft.chunk_index,
        start_line: draft.start_line,
        end_line: draft.end_line,
        resource_name: draft.resource_name.clone(),
        resource_type: draft.resource_type.clone(),
        chunk_type: draft.chunk_type.clone(),
        parent_chunk_id,
        embedding,
        content_hash: draft.content_hash.clone(),
        semantic_type: draft.semantic_type.clone(),
        semantic_intent: draft.semantic_intent.clone(),
        context: draft.context.clone(),
        sequence_key: draft.sequence_key.clone(),
        is_sequence_definition: draft.is_sequence_definition,
        referenced_sequences: draft.referenced_sequences.clone(),
        timestamp: now,
        embedding_text: draft.embedding_text.clone(),
    }
}
