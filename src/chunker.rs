//! Structure-aware XML chunker.
//!
//! Partitions heterogeneous XML into token-bounded, context-rich chunks.
//! The walk is an exclusive top-down descent: an element recognized as a
//! semantic unit emits one chunk covering its whole subtree when it fits the
//! token ceiling, and only descends into its children when it does not.
//! Connector-style elements (tag contains `.`) always expose their children
//! as the retrieval units; a recursion that produces nothing force-emits the
//! element so no content is silently dropped.
//!
//! Line ranges are resolved against the original text by a depth-counting
//! scan whose cursor advances monotonically with emission order, then
//! expanded outward over bare structural wrappers (`<then>`, `<inSequence>`)
//! so the chunk stays syntactically self-contained.

use anyhow::Result;
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::OnceLock;

use crate::artifacts::{local_name, ArtifactMetadata, ArtifactRegistry};
use crate::hasher::compute_chunk_hash;
use crate::models::ChunkDraft;
use crate::xml::{parse_document, XmlElement, XmlNode};

/// Tags whose direct flow keywords are boundaries even without registry
/// backing (Rule 5).
const FLOW_KEYWORDS: &[&str] = &["query", "operation", "resource", "config", "validate", "header"];

/// Attributes that identify an element as a nameable unit (Rule 6).
const IDENTIFYING_ATTRS: &[&str] = &["name", "key", "id", "context"];

/// Wrapper look-back and look-forward bounds for range expansion.
const WRAP_LOOKBACK: usize = 5;
const WRAP_LOOKFORWARD: usize = 10;

/// Tokens longer than this are dropped from the embedding text.
const MAX_TOKEN_CHARS: usize = 100;

/// Tags whose chunks are standalone artifact definitions.
const DEFINITION_TAGS: &[&str] = &["sequence", "localEntry", "endpoint", "template"];

pub struct Chunker<'a> {
    registry: &'a ArtifactRegistry,
    counter: &'a dyn crate::embedding::TokenCounter,
    max_tokens: usize,
}

impl<'a> Chunker<'a> {
    pub fn new(
        registry: &'a ArtifactRegistry,
        counter: &'a dyn crate::embedding::TokenCounter,
        max_tokens: usize,
    ) -> Self {
        Self {
            registry,
            counter,
            max_tokens,
        }
    }

    /// Chunk a file on disk.
    pub fn chunk_file(&self, path: &Path) -> Result<Vec<ChunkDraft>> {
        let text = std::fs::read_to_string(path)?;
        self.chunk_content(path, &text)
    }

    /// Chunk already-loaded content. `path` is used for the folder-name
    /// artifact fallback only.
    pub fn chunk_content(&self, path: &Path, text: &str) -> Result<Vec<ChunkDraft>> {
        let root = parse_document(text)?;
        let meta = self
            .registry
            .detect_any_artifact(&root.name, &root.attrs, path);

        let mut context = Map::new();
        context.insert("artifact".to_string(), artifact_context(&meta));
        let context = Value::Object(context);

        let mut walk = Walk {
            chunker: self,
            locator: LineLocator::new(text),
            drafts: Vec::new(),
            artifact_type: meta.artifact_type.clone(),
            depth: 0,
        };
        walk.element(&root, &context, "", 0);
        Ok(walk.drafts)
    }
}

fn artifact_context(meta: &ArtifactMetadata) -> Value {
    let mut map = Map::new();
    map.insert("type".to_string(), Value::String(meta.artifact_type.clone()));
    map.insert("name".to_string(), Value::String(meta.name.clone()));
    if let Some(xmlns) = &meta.xmlns {
        map.insert("xmlns".to_string(), Value::String(xmlns.clone()));
    }
    for (k, v) in &meta.additional {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    Value::Object(map)
}

struct Walk<'a, 'b> {
    chunker: &'b Chunker<'a>,
    locator: LineLocator,
    drafts: Vec<ChunkDraft>,
    artifact_type: String,
    depth: usize,
}

impl Walk<'_, '_> {
    /// Process one element; returns the line after its located range so the
    /// caller can continue with the next sibling.
    fn element(
        &mut self,
        el: &XmlElement,
        context: &Value,
        parent_tag: &str,
        search_from: usize,
    ) -> usize {
        self.depth += 1;
        let next = self.element_inner(el, context, parent_tag, search_from);
        self.depth -= 1;
        next
    }

    fn element_inner(
        &mut self,
        el: &XmlElement,
        context: &Value,
        parent_tag: &str,
        search_from: usize,
    ) -> usize {
        let range = match self.locator.locate(&el.name, search_from) {
            Some(range) => range,
            // Pathological layout; nothing to slice, skip the subtree.
            None => return search_from,
        };

        let connector = el.name.contains('.');
        let chunkable = self.chunker.registry.is_resource_type(&el.name)
            || self.is_semantic_boundary(el, parent_tag)
            || self.chunker.registry.is_mediator(&el.name);

        if connector {
            // Connector properties are the retrieval units (Rule 7 plus the
            // bare-text rule); a childless connector emits itself.
            let before = self.drafts.len();
            self.descend(el, context, range);
            if self.drafts.len() == before {
                self.emit(el, context, range);
            }
            return range.1 + 1;
        }

        if chunkable {
            let expanded = self.expand_wrappers(range);
            let text = self.build_embedding_text(el, context, expanded);
            let atomic = self.chunker.registry.is_atomic(&el.name);
            if atomic || self.chunker.counter.count_tokens(&text.embedding_text) <= self.chunker.max_tokens
            {
                self.emit_built(el, context, expanded, text);
                return range.1 + 1;
            }
            let before = self.drafts.len();
            self.descend(el, context, range);
            if self.drafts.len() == before {
                // Oversized leaf: one chunk beats silently dropping it.
                self.emit_built(el, context, expanded, text);
            }
            return range.1 + 1;
        }

        self.descend(el, context, range);
        range.1 + 1
    }

    /// Walk the children with this element folded into the context and
    /// recorded as the parent tag. The root element is already represented
    /// by `context.artifact`, so it is not folded a second time.
    fn descend(&mut self, el: &XmlElement, context: &Value, range: (usize, usize)) {
        let child_context = if self.depth <= 1 {
            context.clone()
        } else {
            push_context(context, el)
        };
        let mut cursor = range.0;
        for node in &el.children {
            match node {
                XmlNode::Element(child) => {
                    cursor = self.element(child, &child_context, &el.name, cursor);
                }
                XmlNode::Text(text) => {
                    if el.name.contains('.') {
                        self.emit_text_child(el, &child_context, text, range);
                    }
                }
            }
        }
    }

    fn is_semantic_boundary(&self, el: &XmlElement, parent_tag: &str) -> bool {
        let tag = el.name.as_str();
        let local = el.local_name();

        // 1. Registry hit on the full or local name.
        if self.chunker.registry.is_semantic_boundary(tag) {
            return true;
        }
        // 2. Connector form.
        if tag.contains('.') {
            return true;
        }
        // 3. `prefix:LocalName`, lowercase prefix, uppercase local: policy-like.
        if let Some((prefix, rest)) = tag.split_once(':') {
            if !prefix.is_empty()
                && prefix.chars().all(|c| c.is_ascii_lowercase())
                && rest.chars().next().is_some_and(|c| c.is_ascii_uppercase())
            {
                return true;
            }
        }
        // 4. Uppercase-leading local name: declarative config.
        if local.chars().next().is_some_and(|c| c.is_ascii_uppercase()) && !local.contains('.') {
            return true;
        }
        // 5. Standard flow keywords.
        if FLOW_KEYWORDS.contains(&local) {
            return true;
        }
        // 6. Identifying attribute.
        if el.attrs.iter().any(|(k, _)| IDENTIFYING_ATTRS.contains(&k.as_str())) {
            return true;
        }
        // 7. Direct child of a connector.
        if parent_tag.contains('.') {
            return true;
        }
        // 8. Structural complexity safety net.
        el.distinct_child_tags() >= 2
    }

    fn emit(&mut self, el: &XmlElement, context: &Value, range: (usize, usize)) {
        let expanded = self.expand_wrappers(range);
        let text = self.build_embedding_text(el, context, expanded);
        self.emit_built(el, context, expanded, text);
    }

    fn emit_built(
        &mut self,
        el: &XmlElement,
        context: &Value,
        range: (usize, usize),
        text: BuiltText,
    ) {
        let local = el.local_name();
        let resource_name = el
            .attr("name")
            .or_else(|| el.attr("key"))
            .or_else(|| el.attr("context"))
            .unwrap_or(local)
            .to_string();

        let semantic_type = classify_type(self.chunker.registry, &el.name);
        let semantic_intent = classify_intent(local);
        let content_hash =
            compute_chunk_hash(&text.content, &semantic_type, &semantic_intent, context);

        let is_definition = DEFINITION_TAGS.contains(&local)
            && (el.attr("name").is_some() || el.attr("key").is_some());
        let sequence_key = if is_definition {
            el.attr("name").or_else(|| el.attr("key")).map(str::to_string)
        } else {
            None
        };

        self.drafts.push(ChunkDraft {
            chunk_index: self.drafts.len() as i64,
            start_line: range.0 as i64 + 1,
            end_line: range.1 as i64 + 1,
            resource_name,
            resource_type: self.artifact_type.clone(),
            chunk_type: el.name.clone(),
            parent_index: None,
            content_hash,
            semantic_type,
            semantic_intent,
            context: context.clone(),
            sequence_key,
            is_sequence_definition: is_definition,
            referenced_sequences: text.references,
            embedding_text: text.embedding_text,
        });
    }

    /// Bare text child of a connector: its own chunk on its own line range.
    fn emit_text_child(
        &mut self,
        parent: &XmlElement,
        context: &Value,
        text: &str,
        parent_range: (usize, usize),
    ) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let needle = trimmed.lines().next().unwrap_or(trimmed).trim();
        let line = self
            .locator
            .find_line_containing(needle, parent_range.0, parent_range.1)
            .unwrap_or(parent_range.0);
        let span = trimmed.lines().count().saturating_sub(1);
        let end = (line + span).min(parent_range.1);

        let metadata = format_metadata(context, &[]);
        let cleaned = clean_content(trimmed);
        let embedding_text = join_text(&metadata, &cleaned);
        let semantic_type = classify_type(self.chunker.registry, &parent.name);
        let semantic_intent = classify_intent(parent.local_name());
        let content_hash = compute_chunk_hash(trimmed, &semantic_type, &semantic_intent, context);

        self.drafts.push(ChunkDraft {
            chunk_index: self.drafts.len() as i64,
            start_line: line as i64 + 1,
            end_line: end as i64 + 1,
            resource_name: parent.local_name().to_string(),
            resource_type: self.artifact_type.clone(),
            chunk_type: parent.name.clone(),
            parent_index: None,
            content_hash,
            semantic_type,
            semantic_intent,
            context: context.clone(),
            sequence_key: None,
            is_sequence_definition: false,
            referenced_sequences: Vec::new(),
            embedding_text,
        });
    }

    fn build_embedding_text(
        &self,
        _el: &XmlElement,
        context: &Value,
        range: (usize, usize),
    ) -> BuiltText {
        let content = self.locator.slice(range);
        let references = extract_references(&content);
        let metadata = format_metadata(context, &references);
        let cleaned = clean_content(&content);
        BuiltText {
            embedding_text: join_text(&metadata, &cleaned),
            references,
            content,
        }
    }

    /// Engulf bare structural wrappers around the range, pairwise and
    /// bounded, so the slice stays syntactically self-contained.
    fn expand_wrappers(&self, range: (usize, usize)) -> (usize, usize) {
        let (mut start, mut end) = range;
        let mut back = 0usize;
        let mut forward = 0usize;
        while back < WRAP_LOOKBACK && forward < WRAP_LOOKFORWARD && start > 0 {
            let above = self.locator.line(start - 1).trim();
            let Some(wrapper) = bare_wrapper_tag(above) else {
                break;
            };
            let below = match self.locator.line_checked(end + 1) {
                Some(line) => line.trim(),
                None => break,
            };
            if below != format!("</{}>", wrapper) {
                break;
            }
            start -= 1;
            end += 1;
            back += 1;
            forward += 1;
        }
        (start, end)
    }
}

struct BuiltText {
    embedding_text: String,
    references: Vec<String>,
    content: String,
}

/// `<then>` → `then`; anything with attributes, a slash, or a prefix is not
/// a bare wrapper.
fn bare_wrapper_tag(line: &str) -> Option<&str> {
    let inner = line.strip_prefix('<')?.strip_suffix('>')?;
    if inner.is_empty()
        || !inner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some(inner)
}

/// Fold an element into the downstream context: attributes become a keyed
/// map, attribute-less wrappers stay visible as their own name.
fn push_context(context: &Value, el: &XmlElement) -> Value {
    let mut map = match context {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let local = el.local_name().to_string();
    if el.attrs.is_empty() {
        map.insert(local.clone(), Value::String(local));
    } else {
        let mut attrs = Map::new();
        for (k, v) in &el.attrs {
            if k == "xmlns" || k.starts_with("xmlns:") {
                continue;
            }
            attrs.insert(k.clone(), Value::String(v.clone()));
        }
        map.insert(local, Value::Object(attrs));
    }
    Value::Object(map)
}

/// Human-readable flattening of the context plus references, stable across
/// runs (map iteration is key-ordered).
fn format_metadata(context: &Value, references: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Value::Object(map) = context {
        for (key, value) in map {
            let label = capitalize(key);
            match value {
                Value::Object(attrs) => {
                    let pairs: Vec<String> = attrs
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| format!("{}={}", k, s)))
                        .collect();
                    if pairs.is_empty() {
                        parts.push(format!("{}:", label));
                    } else {
                        parts.push(format!("{}: {}", label, pairs.join(" ")));
                    }
                }
                Value::String(s) => parts.push(format!("{}: {}", label, s)),
                other => parts.push(format!("{}: {}", label, other)),
            }
        }
    }
    if !references.is_empty() {
        parts.push(format!("Uses: {}", references.join(", ")));
    }
    parts.join(" ")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn join_text(metadata: &str, cleaned: &str) -> String {
    if metadata.is_empty() {
        cleaned.to_string()
    } else if cleaned.is_empty() {
        metadata.to_string()
    } else {
        format!("{} {}", metadata, cleaned)
    }
}

/// Strip markup down to searchable tokens: angle brackets dropped, attribute
/// quotes removed, JSON payload blocks kept verbatim, long garbage tokens
/// filtered out.
fn clean_content(content: &str) -> String {
    let (working, json_blocks) = extract_json_blocks(content);

    let mut s = working.replace("=\"", "=");
    s = s.replace('"', " ");
    s = s.replace('<', " ").replace('>', " ");

    let mut tokens: Vec<&str> = s
        .split_whitespace()
        .filter(|t| t.len() <= MAX_TOKEN_CHARS)
        .collect();
    tokens.retain(|t| *t != "/" && *t != "/." && !t.is_empty());

    let mut out = tokens.join(" ");
    for block in json_blocks {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(block.trim());
    }
    out
}

/// Pull the inner text of `<format>`/`<args>` blocks that carry JSON so the
/// payload survives cleaning verbatim.
fn extract_json_blocks(content: &str) -> (String, Vec<String>) {
    let mut working = content.to_string();
    let mut blocks = Vec::new();
    for tag in ["format", "args"] {
        let open = format!("<{}", tag);
        let close = format!("</{}>", tag);
        let mut from = 0usize;
        while let Some(rel) = working[from..].find(&open) {
            let start = from + rel;
            let Some(gt) = working[start..].find('>').map(|i| start + i) else {
                break;
            };
            let Some(end_rel) = working[gt..].find(&close) else {
                from = gt + 1;
                continue;
            };
            let inner_start = gt + 1;
            let inner_end = gt + end_rel;
            let inner = working[inner_start..inner_end].to_string();
            if inner.contains('{') {
                blocks.push(inner);
                working.replace_range(inner_start..inner_end, " ");
                from = inner_start + 1;
            } else {
                from = inner_end + close.len();
            }
        }
    }
    (working, blocks)
}

/// The six reference forms, qualified as `kind:name`.
fn reference_patterns() -> &'static Vec<(Regex, &'static str)> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r#"<sequence\s+key="([^"]+)""#).unwrap(),
                "sequence",
            ),
            (Regex::new(r#"configKey="([^"]+)""#).unwrap(), "localEntry"),
            (
                Regex::new(r#"<endpoint\s+key="([^"]+)""#).unwrap(),
                "endpoint",
            ),
            (
                Regex::new(r#"<call-template\s+target="([^"]+)""#).unwrap(),
                "template",
            ),
            (Regex::new(r#"useConfig="([^"]+)""#).unwrap(), "config"),
            (
                Regex::new(r#"<call-query\s+href="([^"]+)""#).unwrap(),
                "query",
            ),
        ]
    })
}

/// Scan raw chunk content for qualified references.
pub fn extract_references(content: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for (pattern, kind) in reference_patterns() {
        for captures in pattern.captures_iter(content) {
            if let Some(name) = captures.get(1) {
                let qualified = format!("{}:{}", kind, name.as_str());
                if !refs.contains(&qualified) {
                    refs.push(qualified);
                }
            }
        }
    }
    refs
}

fn classify_type(registry: &ArtifactRegistry, tag: &str) -> String {
    let local = local_name(tag);
    if tag.contains('.') {
        return "connector".to_string();
    }
    if local == "api" || local == "resource" {
        return "api".to_string();
    }
    if matches!(
        local,
        "sequence" | "inSequence" | "outSequence" | "faultSequence" | "onError"
    ) {
        return "sequence".to_string();
    }
    if registry.is_mediator(tag) {
        return "mediator".to_string();
    }
    if local.eq_ignore_ascii_case("policy")
        || tag
            .split_once(':')
            .is_some_and(|(p, r)| {
                p.chars().all(|c| c.is_ascii_lowercase())
                    && r.chars().next().is_some_and(|c| c.is_ascii_uppercase())
            })
    {
        return "policy".to_string();
    }
    if matches!(
        local,
        "localEntry" | "property" | "parameter" | "config" | "registry" | "task" | "datasource"
            | "dataSource" | "definition"
    ) {
        return "configuration".to_string();
    }
    if registry.is_semantic_boundary(tag) {
        return "boundary".to_string();
    }
    "component".to_string()
}

fn classify_intent(local: &str) -> String {
    match local {
        "validate" | "filter" => "validation",
        "payloadFactory" | "enrich" | "xslt" | "datamapper" | "smooks" | "rewrite" | "script" => {
            "transformation"
        }
        "call" | "send" | "callout" | "call-template" | "endpoint" | "address" => "delegation",
        "respond" | "loopback" | "drop" => "response",
        "log" => "logging",
        "makefault" | "faultSequence" | "onError" => "error-handling",
        "dblookup" | "dbreport" | "query" | "sql" | "data" | "dataService" | "call-query" => {
            "data-access"
        }
        "sequence" | "inSequence" | "outSequence" | "proxy" | "target" => "mediation",
        _ => "processing",
    }
    .to_string()
}

/// Monotone line-range resolver over the original text.
struct LineLocator {
    lines: Vec<String>,
}

impl LineLocator {
    fn new(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    fn line(&self, idx: usize) -> &str {
        &self.lines[idx]
    }

    fn line_checked(&self, idx: usize) -> Option<&str> {
        self.lines.get(idx).map(String::as_str)
    }

    fn slice(&self, range: (usize, usize)) -> String {
        let end = range.1.min(self.lines.len().saturating_sub(1));
        self.lines[range.0..=end].join("\n")
    }

    fn find_line_containing(&self, needle: &str, from: usize, to: usize) -> Option<usize> {
        let to = to.min(self.lines.len().saturating_sub(1));
        (from..=to).find(|&i| self.lines[i].contains(needle))
    }

    /// Locate the next occurrence of `tag` at or after line `from` and
    /// depth-count to its matching close. Self-closing tags collapse to one
    /// line. Returns inclusive 0-based lines.
    fn locate(&self, tag: &str, from: usize) -> Option<(usize, usize)> {
        let open = format!("<{}", tag);
        let close = format!("</{}>", tag);

        let (start_line, start_col) = self.find_open(&open, from, 0)?;

        let mut depth = 0usize;
        let mut line = start_line;
        let mut col = start_col;
        loop {
            let next_open = self.find_open(&open, line, col);
            let next_close = self.find_token(&close, line, col);

            let take_open = match (next_open, next_close) {
                (Some(o), Some(c)) => o < c,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => return None,
            };

            if take_open {
                let (o_line, o_col) = next_open?;
                let (gt_line, gt_col, self_closing) =
                    self.find_tag_end(o_line, o_col + open.len())?;
                if self_closing {
                    if depth == 0 {
                        return Some((start_line, gt_line));
                    }
                } else {
                    depth += 1;
                }
                line = gt_line;
                col = gt_col + 1;
            } else {
                let (c_line, c_col) = next_close?;
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some((start_line, c_line));
                }
                line = c_line;
                col = c_col + close.len();
            }
        }
    }

    /// Next `<tag` occurrence followed by a delimiter, from (line, col).
    fn find_open(&self, open: &str, from_line: usize, from_col: usize) -> Option<(usize, usize)> {
        for i in from_line..self.lines.len() {
            let start = if i == from_line { from_col } else { 0 };
            let hay = &self.lines[i];
            if start > hay.len() {
                continue;
            }
            let mut offset = start;
            while let Some(rel) = hay[offset..].find(open) {
                let pos = offset + rel;
                let after = hay[pos + open.len()..].chars().next();
                match after {
                    None | Some(' ') | Some('\t') | Some('>') | Some('/') => {
                        return Some((i, pos));
                    }
                    _ => offset = pos + 1,
                }
            }
        }
        None
    }

    fn find_token(&self, token: &str, from_line: usize, from_col: usize) -> Option<(usize, usize)> {
        for i in from_line..self.lines.len() {
            let start = if i == from_line { from_col } else { 0 };
            let hay = &self.lines[i];
            if start > hay.len() {
                continue;
            }
            if let Some(rel) = hay[start..].find(token) {
                return Some((i, start + rel));
            }
        }
        None
    }

    /// Scan forward (possibly across lines) from an opening tag for its
    /// terminating `>`; reports whether the tag is self-closing.
    fn find_tag_end(&self, from_line: usize, from_col: usize) -> Option<(usize, usize, bool)> {
        let mut prev_non_ws: Option<char> = None;
        for i in from_line..self.lines.len() {
            let start = if i == from_line { from_col } else { 0 };
            let hay = &self.lines[i];
            if start > hay.len() {
                continue;
            }
            for (rel, ch) in hay[start..].char_indices() {
                if ch == '>' {
                    return Some((i, start + rel, prev_non_ws == Some('/')));
                }
                if !ch.is_whitespace() {
                    prev_non_ws = Some(ch);
                }
            }
        }
        None
    }
}
