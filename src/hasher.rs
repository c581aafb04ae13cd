//! Content hashing and Merkle grouping for change detection.
//!
//! A chunk's identity for embedding reuse is a SHA-256 over a canonical
//! encoding of its content plus semantic metadata; two logically equal
//! chunks hash identically regardless of attribute order or JSON whitespace.
//! On top of that, chunks of a file are grouped into a small labeled tree
//! (artifact → resource → sequence → leaf) whose interior hashes let an
//! incremental pass prune unchanged subtrees and touch only the differing
//! leaves.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::models::ChunkDraft;

/// Canonical JSON: objects recursively key-sorted, no insignificant
/// whitespace. Arrays keep their order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let fields: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// SHA-256 over the canonical encoding of `{content, type, intent, context}`.
pub fn compute_chunk_hash(
    content: &str,
    semantic_type: &str,
    semantic_intent: &str,
    context: &Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(semantic_type.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(semantic_intent.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical_json(context).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Node in the grouping tree. Leaves carry a chunk's content hash; interior
/// nodes hash the sorted concatenation of their children's hashes.
#[derive(Debug, Clone)]
pub struct MerkleNode {
    pub label: String,
    pub hash: String,
    pub children: BTreeMap<String, MerkleNode>,
    pub is_leaf: bool,
}

impl MerkleNode {
    fn leaf(label: String, hash: String) -> Self {
        Self {
            label,
            hash,
            children: BTreeMap::new(),
            is_leaf: true,
        }
    }

    fn interior(label: String) -> Self {
        Self {
            label,
            hash: String::new(),
            children: BTreeMap::new(),
            is_leaf: false,
        }
    }

    fn finalize(&mut self) {
        if self.is_leaf {
            return;
        }
        for child in self.children.values_mut() {
            child.finalize();
        }
        // BTreeMap iterates sorted by label, so the concatenation is stable.
        let joined: Vec<&str> = self.children.values().map(|c| c.hash.as_str()).collect();
        let mut hasher = Sha256::new();
        hasher.update(joined.join("|").as_bytes());
        self.hash = format!("{:x}", hasher.finalize());
    }
}

fn context_label(context: &Value, key: &str) -> Option<String> {
    let entry = context.get(key)?;
    match entry {
        Value::Object(map) => {
            if key == "artifact" {
                map.get("name").and_then(Value::as_str).map(str::to_string)
            } else if key == "resource" {
                let methods = map.get("methods").and_then(Value::as_str).unwrap_or("");
                let uri = map
                    .get("uri-template")
                    .or_else(|| map.get("url-mapping"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                Some(format!("{} {}", methods, uri).trim().to_string())
            } else {
                map.get("name")
                    .or_else(|| map.get("key"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
        }
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Group a file's chunks into artifact → resource → sequence → leaf and
/// compute interior hashes.
pub fn build_tree(chunks: &[(String, Value, i64, String)]) -> MerkleNode {
    // (content_hash, context, chunk_index, chunk_type) per chunk.
    let mut root = MerkleNode::interior("file".to_string());

    for (content_hash, context, chunk_index, chunk_type) in chunks {
        let artifact = context_label(context, "artifact").unwrap_or_else(|| "artifact".into());
        let mut node = root
            .children
            .entry(artifact.clone())
            .or_insert_with(|| MerkleNode::interior(artifact));

        if let Some(resource) = context_label(context, "resource") {
            node = node
                .children
                .entry(resource.clone())
                .or_insert_with(|| MerkleNode::interior(resource));
        }
        if let Some(sequence) = context_label(context, "sequence") {
            node = node
                .children
                .entry(sequence.clone())
                .or_insert_with(|| MerkleNode::interior(sequence));
        }

        let leaf_label = format!("{}:{}", chunk_index, chunk_type);
        node.children.insert(
            leaf_label.clone(),
            MerkleNode::leaf(leaf_label, content_hash.clone()),
        );
    }

    root.finalize();
    root
}

/// Convenience over the chunker's drafts.
pub fn build_tree_for_drafts(drafts: &[ChunkDraft]) -> MerkleNode {
    let rows: Vec<(String, Value, i64, String)> = drafts
        .iter()
        .map(|d| {
            (
                d.content_hash.clone(),
                d.context.clone(),
                d.chunk_index,
                d.chunk_type.clone(),
            )
        })
        .collect();
    build_tree(&rows)
}

/// Walk both trees by label, prune subtrees with identical interior hashes,
/// and collect the content hashes of leaves that are new or changed. Labels
/// present only in the old tree are ignored (deletions are handled by slot
/// reconciliation). A missing old tree means every leaf changed.
pub fn find_changed_leaves(old: Option<&MerkleNode>, new: &MerkleNode) -> Vec<String> {
    let mut changed = Vec::new();
    collect_changed(old, new, &mut changed);
    changed
}

fn collect_changed(old: Option<&MerkleNode>, new: &MerkleNode, out: &mut Vec<String>) {
    if let Some(old_node) = old {
        if old_node.hash == new.hash {
            return;
        }
    }
    if new.is_leaf {
        out.push(new.hash.clone());
        return;
    }
    for (label, child) in &new.children {
        let old_child = old.and_then(|o| o.children.get(label));
        collect_changed(old_child, child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let a = json!({"b": {"y": 1, "x": 2}, "a": [1, 2]});
        let b = json!({"a": [1, 2], "b": {"x": 2, "y": 1}});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":[1,2],"b":{"x":2,"y":1}}"#);
    }

    #[test]
    fn chunk_hash_ignores_context_key_order() {
        let c1 = json!({"artifact": {"type": "api", "name": "A"}, "resource": {"methods": "GET"}});
        let c2 = json!({"resource": {"methods": "GET"}, "artifact": {"name": "A", "type": "api"}});
        let h1 = compute_chunk_hash("<log/>", "mediator", "logging", &c1);
        let h2 = compute_chunk_hash("<log/>", "mediator", "logging", &c2);
        assert_eq!(h1, h2);
    }

    #[test]
    fn chunk_hash_changes_with_content() {
        let ctx = json!({"artifact": {"type": "api", "name": "A"}});
        let h1 = compute_chunk_hash("<log level=\"full\"/>", "mediator", "logging", &ctx);
        let h2 = compute_chunk_hash("<log level=\"simple\"/>", "mediator", "logging", &ctx);
        assert_ne!(h1, h2);
    }

    fn row(hash: &str, artifact: &str, resource: Option<&str>, index: i64) -> (String, Value, i64, String) {
        let mut ctx = json!({"artifact": {"type": "api", "name": artifact}});
        if let Some(r) = resource {
            ctx["resource"] = json!({"methods": "GET", "uri-template": r});
        }
        (hash.to_string(), ctx, index, "log".to_string())
    }

    #[test]
    fn identical_trees_have_no_changed_leaves() {
        let rows = vec![row("h1", "A", Some("/a"), 0), row("h2", "A", Some("/b"), 1)];
        let old = build_tree(&rows);
        let new = build_tree(&rows);
        assert!(find_changed_leaves(Some(&old), &new).is_empty());
    }

    #[test]
    fn single_leaf_change_is_isolated() {
        let old = build_tree(&[row("h1", "A", Some("/a"), 0), row("h2", "A", Some("/b"), 1)]);
        let new = build_tree(&[row("h1", "A", Some("/a"), 0), row("h3", "A", Some("/b"), 1)]);
        let changed = find_changed_leaves(Some(&old), &new);
        assert_eq!(changed, vec!["h3".to_string()]);
    }

    #[test]
    fn missing_old_tree_flags_everything() {
        let new = build_tree(&[row("h1", "A", None, 0), row("h2", "A", None, 1)]);
        let changed = find_changed_leaves(None, &new);
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn deleted_labels_are_ignored() {
        let old = build_tree(&[row("h1", "A", Some("/a"), 0), row("h2", "A", Some("/b"), 1)]);
        let new = build_tree(&[row("h1", "A", Some("/a"), 0)]);
        assert!(find_changed_leaves(Some(&old), &new).is_empty());
    }

    #[test]
    fn interior_hash_is_order_independent() {
        let t1 = build_tree(&[row("h1", "A", Some("/a"), 0), row("h2", "B", Some("/b"), 1)]);
        let t2 = build_tree(&[row("h2", "B", Some("/b"), 1), row("h1", "A", Some("/a"), 0)]);
        assert_eq!(t1.hash, t2.hash);
    }
}
