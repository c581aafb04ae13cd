//! Artifact plugin registry.
//!
//! The single place any list of known tags lives. Each [`ArtifactPlugin`] is
//! a flat record describing one artifact family: which root tags identify
//! it, at which descendant tags the chunker may split, which tags are flow
//! mediators, and which tags must never be split further. Aggregate lookup
//! sets are precomputed so the chunker's hot path is a hash probe.
//!
//! All lookups accept both the namespaced (`wsp:Policy`) and local
//! (`Policy`) forms of a tag.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Metadata extracted from an artifact root element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMetadata {
    pub artifact_type: String,
    pub name: String,
    pub xmlns: Option<String>,
    /// Extra root attributes worth keeping (version, context, transports, …).
    pub additional: BTreeMap<String, String>,
}

impl ArtifactMetadata {
    pub fn unknown() -> Self {
        Self {
            artifact_type: "unknown".to_string(),
            name: "unknown".to_string(),
            xmlns: None,
            additional: BTreeMap::new(),
        }
    }
}

type ExtractFn = fn(&str, &[(String, String)]) -> ArtifactMetadata;

/// One artifact family: identification plus chunking hints.
#[derive(Clone)]
pub struct ArtifactPlugin {
    pub id: &'static str,
    pub root_tags: Vec<String>,
    pub semantic_boundaries: Vec<String>,
    pub mediator_tags: Vec<String>,
    pub atomic_tags: Vec<String>,
    pub extract_metadata: ExtractFn,
}

/// Registry of artifact plugins with aggregate fast-lookup sets.
pub struct ArtifactRegistry {
    plugins: Vec<ArtifactPlugin>,
    boundaries: HashSet<String>,
    mediators: HashSet<String>,
    atomics: HashSet<String>,
    root_index: HashMap<String, usize>,
}

/// Local part of a possibly namespaced tag (`wsp:Policy` → `Policy`).
pub fn local_name(tag: &str) -> &str {
    tag.rsplit(':').next().unwrap_or(tag)
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Generic extraction: name from `name`/`key`/`context`, xmlns kept,
/// remaining root attributes preserved as additional metadata.
fn extract_named(artifact_type: &str, attrs: &[(String, String)]) -> ArtifactMetadata {
    let name = attr(attrs, "name")
        .or_else(|| attr(attrs, "key"))
        .or_else(|| attr(attrs, "context"))
        .unwrap_or(artifact_type)
        .to_string();
    let mut additional = BTreeMap::new();
    for (k, v) in attrs {
        if k != "name" && k != "xmlns" && !k.starts_with("xmlns:") {
            additional.insert(k.clone(), v.clone());
        }
    }
    ArtifactMetadata {
        artifact_type: artifact_type.to_string(),
        name,
        xmlns: attr(attrs, "xmlns").map(str::to_string),
        additional,
    }
}

macro_rules! extract_as {
    ($fn_name:ident, $ty:literal) => {
        fn $fn_name(_root: &str, attrs: &[(String, String)]) -> ArtifactMetadata {
            extract_named($ty, attrs)
        }
    };
}

extract_as!(extract_api, "api");
extract_as!(extract_sequence, "sequence");
extract_as!(extract_endpoint, "endpoint");
extract_as!(extract_proxy, "proxy");
extract_as!(extract_inbound, "inboundEndpoint");
extract_as!(extract_message_store, "messageStore");
extract_as!(extract_message_processor, "messageProcessor");
extract_as!(extract_local_entry, "localEntry");
extract_as!(extract_template, "template");
extract_as!(extract_task, "task");
extract_as!(extract_data_service, "dataService");
extract_as!(extract_data_source, "dataSource");

/// Mediator tags shared by the flow-bearing artifact families.
const FLOW_MEDIATORS: &[&str] = &[
    "log",
    "property",
    "propertyGroup",
    "call",
    "send",
    "respond",
    "drop",
    "filter",
    "switch",
    "payloadFactory",
    "enrich",
    "xslt",
    "callout",
    "loopback",
    "validate",
    "cache",
    "throttle",
    "iterate",
    "aggregate",
    "clone",
    "foreach",
    "header",
    "script",
    "class",
    "dblookup",
    "dbreport",
    "store",
    "call-template",
    "makefault",
    "datamapper",
    "smooks",
    "rewrite",
    "bean",
    "publishEvent",
];

/// Tags whose content must stay in one piece (inline payloads, scripts).
const ATOMIC_TAGS: &[&str] = &["payloadFactory", "xslt", "script", "datamapper", "smooks"];

fn owned(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

fn builtin_plugins() -> Vec<ArtifactPlugin> {
    vec![
        ArtifactPlugin {
            id: "api",
            root_tags: owned(&["api"]),
            semantic_boundaries: owned(&[
                "resource",
                "inSequence",
                "outSequence",
                "faultSequence",
                "handlers",
            ]),
            mediator_tags: owned(FLOW_MEDIATORS),
            atomic_tags: owned(ATOMIC_TAGS),
            extract_metadata: extract_api,
        },
        ArtifactPlugin {
            id: "sequence",
            root_tags: owned(&["sequence"]),
            semantic_boundaries: owned(&["sequence", "onError"]),
            mediator_tags: owned(FLOW_MEDIATORS),
            atomic_tags: owned(ATOMIC_TAGS),
            extract_metadata: extract_sequence,
        },
        ArtifactPlugin {
            id: "endpoint",
            root_tags: owned(&["endpoint"]),
            semantic_boundaries: owned(&[
                "endpoint",
                "address",
                "http",
                "wsdl",
                "loadbalance",
                "failover",
                "recipientlist",
            ]),
            mediator_tags: Vec::new(),
            atomic_tags: Vec::new(),
            extract_metadata: extract_endpoint,
        },
        ArtifactPlugin {
            id: "proxy",
            root_tags: owned(&["proxy"]),
            semantic_boundaries: owned(&[
                "target",
                "inSequence",
                "outSequence",
                "faultSequence",
                "publishWSDL",
                "policy",
            ]),
            mediator_tags: owned(FLOW_MEDIATORS),
            atomic_tags: owned(ATOMIC_TAGS),
            extract_metadata: extract_proxy,
        },
        ArtifactPlugin {
            id: "inbound-endpoint",
            root_tags: owned(&["inboundEndpoint"]),
            semantic_boundaries: owned(&["parameters", "parameter"]),
            mediator_tags: Vec::new(),
            atomic_tags: Vec::new(),
            extract_metadata: extract_inbound,
        },
        ArtifactPlugin {
            id: "message-store",
            root_tags: owned(&["messageStore"]),
            semantic_boundaries: owned(&["parameter"]),
            mediator_tags: Vec::new(),
            atomic_tags: Vec::new(),
            extract_metadata: extract_message_store,
        },
        ArtifactPlugin {
            id: "message-processor",
            root_tags: owned(&["messageProcessor"]),
            semantic_boundaries: owned(&["parameter"]),
            mediator_tags: Vec::new(),
            atomic_tags: Vec::new(),
            extract_metadata: extract_message_processor,
        },
        ArtifactPlugin {
            id: "local-entry",
            root_tags: owned(&["localEntry"]),
            semantic_boundaries: Vec::new(),
            mediator_tags: Vec::new(),
            atomic_tags: Vec::new(),
            extract_metadata: extract_local_entry,
        },
        ArtifactPlugin {
            id: "template",
            root_tags: owned(&["template"]),
            semantic_boundaries: owned(&["sequence", "endpoint"]),
            mediator_tags: owned(FLOW_MEDIATORS),
            atomic_tags: owned(ATOMIC_TAGS),
            extract_metadata: extract_template,
        },
        ArtifactPlugin {
            id: "task",
            root_tags: owned(&["task"]),
            semantic_boundaries: owned(&["trigger", "property"]),
            mediator_tags: Vec::new(),
            atomic_tags: Vec::new(),
            extract_metadata: extract_task,
        },
        ArtifactPlugin {
            id: "data-service",
            root_tags: owned(&["data", "dataService"]),
            semantic_boundaries: owned(&["config", "query", "operation", "resource", "policy"]),
            mediator_tags: Vec::new(),
            atomic_tags: owned(&["sql", "expression"]),
            extract_metadata: extract_data_service,
        },
        ArtifactPlugin {
            id: "data-source",
            root_tags: owned(&["datasource", "dataSource"]),
            semantic_boundaries: owned(&["definition", "configuration"]),
            mediator_tags: Vec::new(),
            atomic_tags: Vec::new(),
            extract_metadata: extract_data_source,
        },
    ]
}

/// Folder-name fallback for files whose root tag no plugin claims.
const FOLDER_TYPES: &[(&str, &str)] = &[
    ("apis", "api"),
    ("api", "api"),
    ("sequences", "sequence"),
    ("endpoints", "endpoint"),
    ("proxy-services", "proxy"),
    ("inbound-endpoints", "inboundEndpoint"),
    ("message-stores", "messageStore"),
    ("message-processors", "messageProcessor"),
    ("local-entries", "localEntry"),
    ("templates", "template"),
    ("tasks", "task"),
    ("data-services", "dataService"),
    ("data-sources", "dataSource"),
];

impl ArtifactRegistry {
    /// Registry preloaded with the twelve built-in plugins.
    pub fn new() -> Self {
        let mut registry = Self {
            plugins: Vec::new(),
            boundaries: HashSet::new(),
            mediators: HashSet::new(),
            atomics: HashSet::new(),
            root_index: HashMap::new(),
        };
        for plugin in builtin_plugins() {
            registry.register(plugin);
        }
        registry
    }

    /// Add a plugin and fold its tags into the aggregate sets.
    pub fn register(&mut self, plugin: ArtifactPlugin) {
        let idx = self.plugins.len();
        for tag in &plugin.root_tags {
            self.root_index.entry(tag.clone()).or_insert(idx);
        }
        self.boundaries
            .extend(plugin.semantic_boundaries.iter().cloned());
        self.mediators.extend(plugin.mediator_tags.iter().cloned());
        self.atomics.extend(plugin.atomic_tags.iter().cloned());
        self.plugins.push(plugin);
    }

    fn set_contains(set: &HashSet<String>, tag: &str) -> bool {
        set.contains(tag) || set.contains(local_name(tag))
    }

    /// Registry-declared semantic boundary (heuristic rules live in the
    /// chunker, not here).
    pub fn is_semantic_boundary(&self, tag: &str) -> bool {
        Self::set_contains(&self.boundaries, tag)
    }

    pub fn is_mediator(&self, tag: &str) -> bool {
        Self::set_contains(&self.mediators, tag)
    }

    pub fn is_atomic(&self, tag: &str) -> bool {
        Self::set_contains(&self.atomics, tag)
    }

    /// Whether the tag is a root tag of any artifact family.
    pub fn is_resource_type(&self, tag: &str) -> bool {
        self.root_index.contains_key(tag) || self.root_index.contains_key(local_name(tag))
    }

    pub fn plugin_for_root(&self, tag: &str) -> Option<&ArtifactPlugin> {
        self.root_index
            .get(tag)
            .or_else(|| self.root_index.get(local_name(tag)))
            .map(|&idx| &self.plugins[idx])
    }

    /// Identify the artifact from its root element.
    pub fn detect_artifact(
        &self,
        root_tag: &str,
        attrs: &[(String, String)],
    ) -> Option<ArtifactMetadata> {
        self.plugin_for_root(root_tag)
            .map(|plugin| (plugin.extract_metadata)(root_tag, attrs))
    }

    /// Identify the artifact from the root element, falling back to the
    /// containing folder name, and finally to `unknown`.
    pub fn detect_any_artifact(
        &self,
        root_tag: &str,
        attrs: &[(String, String)],
        path: &Path,
    ) -> ArtifactMetadata {
        if let Some(meta) = self.detect_artifact(root_tag, attrs) {
            return meta;
        }

        for component in path.iter().rev().skip(1) {
            let component = component.to_string_lossy();
            if let Some((_, ty)) = FOLDER_TYPES.iter().find(|(dir, _)| *dir == component) {
                let mut meta = extract_named(ty, attrs);
                if meta.name == *ty {
                    if let Some(stem) = path.file_stem() {
                        meta.name = stem.to_string_lossy().to_string();
                    }
                }
                return meta;
            }
        }

        let mut meta = ArtifactMetadata::unknown();
        if let Some(name) = attr(attrs, "name") {
            meta.name = name.to_string();
        } else if let Some(stem) = path.file_stem() {
            meta.name = stem.to_string_lossy().to_string();
        }
        meta
    }
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builtin_count() {
        let registry = ArtifactRegistry::new();
        assert_eq!(registry.plugins.len(), 12);
    }

    #[test]
    fn namespaced_and_local_forms_match() {
        let registry = ArtifactRegistry::new();
        assert!(registry.is_mediator("log"));
        assert!(registry.is_mediator("syn:log"));
        assert!(registry.is_resource_type("api"));
        assert!(registry.is_resource_type("syn:api"));
        assert!(registry.is_semantic_boundary("inSequence"));
        assert!(registry.is_atomic("payloadFactory"));
        assert!(!registry.is_mediator("nosuchtag"));
    }

    #[test]
    fn detect_api_metadata() {
        let registry = ArtifactRegistry::new();
        let meta = registry
            .detect_artifact(
                "api",
                &attrs(&[
                    ("name", "OrderApi"),
                    ("context", "/orders"),
                    ("xmlns", "http://ws.apache.org/ns/synapse"),
                ]),
            )
            .unwrap();
        assert_eq!(meta.artifact_type, "api");
        assert_eq!(meta.name, "OrderApi");
        assert_eq!(meta.xmlns.as_deref(), Some("http://ws.apache.org/ns/synapse"));
        assert_eq!(meta.additional.get("context").map(String::as_str), Some("/orders"));
    }

    #[test]
    fn folder_fallback_maps_directory_names() {
        let registry = ArtifactRegistry::new();
        let path = PathBuf::from("/proj/src/main/wso2mi/artifacts/sequences/audit.xml");
        let meta = registry.detect_any_artifact("wrapper", &[], &path);
        assert_eq!(meta.artifact_type, "sequence");
        assert_eq!(meta.name, "audit");
    }

    #[test]
    fn unknown_when_nothing_matches() {
        let registry = ArtifactRegistry::new();
        let path = PathBuf::from("/proj/misc/notes.xml");
        let meta = registry.detect_any_artifact("unrecognized", &[], &path);
        assert_eq!(meta.artifact_type, "unknown");
        assert_eq!(meta.name, "notes");
    }

    #[test]
    fn data_service_root_aliases() {
        let registry = ArtifactRegistry::new();
        assert!(registry.plugin_for_root("data").is_some());
        assert!(registry.plugin_for_root("dataService").is_some());
        let meta = registry
            .detect_artifact("data", &attrs(&[("name", "AccountsDS")]))
            .unwrap();
        assert_eq!(meta.artifact_type, "dataService");
        assert_eq!(meta.name, "AccountsDS");
    }
}
