//! Per-project service facade.
//!
//! One [`IndexService`] per project, registered in a process-wide map keyed
//! by the canonicalized project root. The service owns the store handle, the
//! embedder, the scanner state, the poll timer, and the file watcher; it
//! exposes lifecycle (`start` / `stop`), change notification, and search.
//!
//! The facade never propagates errors to its caller: initialization
//! failures become readiness events and search failures become structured
//! responses the host can fall back on.
//!
//! ```text
//! uninitialized → initializing → ready
//!                        ↓
//!                      failed  (start() may retry)
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::artifacts::ArtifactRegistry;
use crate::config::IndexConfig;
use crate::embedding::{Embedder, HashingEmbedder, LocalModelProvider, ModelProvider, TractEmbedder};
use crate::models::{SearchOptions, SearchResponse};
use crate::pipeline::Pipeline;
use crate::progress::ProgressMode;
use crate::scanner::Scanner;
use crate::search::SearchEngine;
use crate::store::Store;
use crate::watcher::FileWatcher;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

struct ServiceInner {
    store: Store,
    embedder: Arc<dyn Embedder>,
    scanner: Scanner,
    watcher: Option<FileWatcher>,
}

pub struct IndexService {
    project_root: PathBuf,
    config: IndexConfig,
    registry: ArtifactRegistry,
    state_tx: watch::Sender<ServiceState>,
    inner: Mutex<Option<ServiceInner>>,
    /// Serializes initialization so concurrent `start` calls coalesce.
    init_guard: Mutex<()>,
    /// At most one re-index pass in flight.
    reindex_guard: Mutex<()>,
    /// Per-path debounce generation counters.
    debounce: StdMutex<HashMap<PathBuf, u64>>,
    tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
    progress_mode: StdMutex<ProgressMode>,
}

fn registry_map() -> &'static StdMutex<HashMap<PathBuf, Arc<IndexService>>> {
    static REGISTRY: OnceLock<StdMutex<HashMap<PathBuf, Arc<IndexService>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

impl IndexService {
    /// Fetch or create the service for a project. The key is the
    /// canonicalized absolute root, so `/proj` and `/proj/../proj` share one
    /// instance.
    pub fn for_project(project_root: &Path, config: IndexConfig) -> Arc<Self> {
        let key = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());
        let mut map = registry_map().lock().expect("service registry poisoned");
        map.entry(key.clone())
            .or_insert_with(|| {
                let (state_tx, _) = watch::channel(ServiceState::Uninitialized);
                Arc::new(Self {
                    project_root: key,
                    config,
                    registry: ArtifactRegistry::new(),
                    state_tx,
                    inner: Mutex::new(None),
                    init_guard: Mutex::new(()),
                    reindex_guard: Mutex::new(()),
                    debounce: StdMutex::new(HashMap::new()),
                    tasks: StdMutex::new(Vec::new()),
                    progress_mode: StdMutex::new(ProgressMode::Off),
                })
            })
            .clone()
    }

    /// Drop a project's service from the registry (used by `stop` callers
    /// that want a truly fresh instance).
    pub fn evict(project_root: &Path) {
        let key = project_root
            .canonicalize()
            .unwrap_or_else(|_| project_root.to_path_buf());
        let mut map = registry_map().lock().expect("service registry poisoned");
        map.remove(&key);
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    /// How pipeline passes report progress (off by default; the CLI turns
    /// this on).
    pub fn set_progress(&self, mode: ProgressMode) {
        *self.progress_mode.lock().expect("progress mode poisoned") = mode;
    }

    fn progress_reporter(&self) -> Box<dyn crate::progress::ProgressReporter> {
        self.progress_mode
            .lock()
            .expect("progress mode poisoned")
            .reporter()
    }

    pub fn is_available(&self) -> bool {
        self.state() == ServiceState::Ready
    }

    pub fn is_initializing(&self) -> bool {
        self.state() == ServiceState::Initializing
    }

    /// Observe readiness transitions. The first value after `Initializing`
    /// is the one-shot `on_ready` signal.
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    /// Resolves once initialization has left the `initializing` state.
    /// Never fails; returns whether the service came up.
    pub async fn wait_for_ready(&self) -> bool {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            match state {
                ServiceState::Ready => return true,
                ServiceState::Failed | ServiceState::Uninitialized => return false,
                ServiceState::Initializing => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Idempotent startup. Concurrent callers coalesce onto the same
    /// initialization; a failed attempt leaves the service retryable.
    pub async fn start(self: &Arc<Self>) -> bool {
        if self.is_available() {
            return true;
        }
        if self.is_initializing() {
            return self.wait_for_ready().await;
        }

        let _guard = self.init_guard.lock().await;
        // A racer may have finished while this caller waited on the guard.
        match self.state() {
            ServiceState::Ready => return true,
            ServiceState::Initializing => return self.wait_for_ready().await,
            _ => {}
        }

        // send_replace updates the state even when nobody is subscribed yet.
        self.state_tx.send_replace(ServiceState::Initializing);
        match self.initialize().await {
            Ok(()) => {
                self.state_tx.send_replace(ServiceState::Ready);
                info!(project = %self.project_root.display(), "index ready");
                true
            }
            Err(e) => {
                error!(project = %self.project_root.display(), error = %e, "index init failed");
                self.state_tx.send_replace(ServiceState::Failed);
                false
            }
        }
    }

    async fn initialize(self: &Arc<Self>) -> anyhow::Result<()> {
        let embedder: Arc<dyn Embedder> = match &self.config.embedding.model_dir {
            Some(dir) => {
                let provider = LocalModelProvider::new(dir.clone());
                let model_dir = provider.ensure_model()?;
                Arc::new(TractEmbedder::load(&model_dir, &self.config.embedding)?)
            }
            None => Arc::new(HashingEmbedder::new(self.config.embedding.dims)),
        };

        let db_path = match &self.config.db.path {
            Some(path) => path.clone(),
            None => default_db_path(&self.project_root)?,
        };
        let store = Store::open(&db_path).await?;

        let mut scanner = Scanner::new(&self.config.watch.extensions);
        {
            let reporter = self.progress_reporter();
            let pipeline = Pipeline::new(&self.registry, &store, embedder.as_ref(), &self.config);
            let stats = pipeline
                .process_initial(&[self.project_root.clone()], &mut scanner, reporter.as_ref())
                .await?;
            info!(
                embedded = stats.embedded,
                reused = stats.reused,
                deleted = stats.deleted,
                "initial index pass complete"
            );
        }

        let watcher = self.spawn_watcher();
        *self.inner.lock().await = Some(ServiceInner {
            store,
            embedder,
            scanner,
            watcher,
        });

        self.spawn_poll_timer();
        Ok(())
    }

    fn spawn_watcher(self: &Arc<Self>) -> Option<FileWatcher> {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<PathBuf>(64);
        let mut watcher =
            match FileWatcher::new(tx, Duration::from_millis(self.config.watch.debounce_ms)) {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!(error = %e, "file watcher unavailable; relying on the poll timer");
                    return None;
                }
            };
        if let Err(e) = watcher.watch(&self.project_root) {
            warn!(error = %e, "could not watch project root");
            return None;
        }

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                service.notify_file_change(&path).await;
            }
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
        Some(watcher)
    }

    fn spawn_poll_timer(self: &Arc<Self>) {
        let interval_secs = self.config.watch.poll_interval_secs;
        if interval_secs == 0 {
            return;
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let root = service.project_root.clone();
                service.reindex_dirs(&[root]).await;
            }
        });
        self.tasks.lock().expect("task list poisoned").push(handle);
    }

    /// Best-effort immediate re-index of the changed file's directory.
    /// Events for the same path within the collapse window coalesce.
    pub async fn notify_file_change(self: &Arc<Self>, path: &Path) {
        if !self.is_available() {
            return;
        }

        let generation = {
            let mut map = self.debounce.lock().expect("debounce map poisoned");
            let counter = map.entry(path.to_path_buf()).or_insert(0);
            *counter += 1;
            *counter
        };

        tokio::time::sleep(Duration::from_millis(self.config.watch.debounce_ms)).await;

        let current = self
            .debounce
            .lock()
            .expect("debounce map poisoned")
            .get(path)
            .copied()
            .unwrap_or(0);
        if current != generation {
            // A newer event for this path supersedes this one.
            return;
        }

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.project_root.clone());
        self.reindex_dirs(&[dir]).await;
    }

    async fn reindex_dirs(self: &Arc<Self>, dirs: &[PathBuf]) {
        let _pass = self.reindex_guard.lock().await;
        let mut inner_slot = self.inner.lock().await;
        let Some(inner) = inner_slot.as_mut() else {
            return;
        };
        let pipeline = Pipeline::new(
            &self.registry,
            &inner.store,
            inner.embedder.as_ref(),
            &self.config,
        );
        // Inner holds both pieces; split the borrow before the call.
        let scanner = &mut inner.scanner;
        let reporter = self.progress_reporter();
        match pipeline
            .process_incremental(dirs, scanner, reporter.as_ref())
            .await
        {
            Ok(stats) => {
                if stats.embedded + stats.reused + stats.deleted > 0 {
                    info!(
                        embedded = stats.embedded,
                        reused = stats.reused,
                        deleted = stats.deleted,
                        "incremental pass complete"
                    );
                }
            }
            Err(e) => warn!(error = %e, "incremental pass failed"),
        }
    }

    /// Search the project index. Never errors: before readiness the
    /// response carries `EMBEDDING_SERVICE_UNAVAILABLE`, and internal
    /// failures surface as an empty result set with a message.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> SearchResponse {
        let threshold = opts
            .score_threshold
            .unwrap_or(self.config.retrieval.score_threshold);
        if !self.is_available() {
            tracing::debug!(error = %crate::error::IndexError::IndexNotReady, "search rejected");
            return SearchResponse::unavailable(threshold);
        }

        let inner_slot = self.inner.lock().await;
        let Some(inner) = inner_slot.as_ref() else {
            return SearchResponse::unavailable(threshold);
        };

        let engine = SearchEngine::new(
            &inner.store,
            inner.embedder.as_ref(),
            &self.config.retrieval,
        );
        match engine.search(query, opts).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "search failed");
                SearchResponse {
                    results: Vec::new(),
                    confidence_threshold: threshold,
                    query_latency_ms: 0,
                    code: None,
                    message: Some(format!("Search failed: {}", e)),
                }
            }
        }
    }

    /// Release every resource. Waits for an in-flight re-index pass, drops
    /// the watcher and poll timer, and closes the store; errors are
    /// swallowed. A later `start` rebuilds from scratch.
    pub async fn stop(&self) {
        let _pass = self.reindex_guard.lock().await;

        for handle in self.tasks.lock().expect("task list poisoned").drain(..) {
            handle.abort();
        }

        if let Some(inner) = self.inner.lock().await.take() {
            drop(inner.watcher);
            inner.store.close().await;
        }

        self.debounce.lock().expect("debounce map poisoned").clear();
        self.state_tx.send_replace(ServiceState::Uninitialized);
        info!(project = %self.project_root.display(), "index stopped");
    }

    pub async fn chunk_count(&self) -> i64 {
        let inner_slot = self.inner.lock().await;
        match inner_slot.as_ref() {
            Some(inner) => inner.store.count().await.unwrap_or(0),
            None => 0,
        }
    }
}

/// Store location for a project: a per-project directory under the user
/// data dir, never inside the project tree.
pub fn default_db_path(project_root: &Path) -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("no user data directory available"))?;
    let digest = crate::scanner::hash_bytes(project_root.to_string_lossy().as_bytes());
    Ok(base
        .join("artifact-index")
        .join(&digest[..16])
        .join("embeddings.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    const SEQUENCE: &str = r#"<sequence xmlns="http://ws.apache.org/ns/synapse" name="AuditSeq">
    <log level="full" category="INFO"/>
    <property name="target" value="audit-store"/>
</sequence>"#;

    fn test_config(tmp: &Path) -> IndexConfig {
        let mut config = IndexConfig::default();
        config.db.path = Some(tmp.join("data").join("embeddings.db"));
        config.watch.debounce_ms = 25;
        config.watch.poll_interval_secs = 0;
        config
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn search_before_start_is_structured() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        let service = IndexService::for_project(&project, test_config(tmp.path()));

        let response = service.search("anything", &SearchOptions::default()).await;
        assert_eq!(
            response.code.as_deref(),
            Some("EMBEDDING_SERVICE_UNAVAILABLE")
        );
        assert!(response.results.is_empty());
        IndexService::evict(&project);
    }

    #[tokio::test]
    async fn start_indexes_and_serves_search() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        write(&project, "sequences/audit.xml", SEQUENCE);
        let service = IndexService::for_project(&project, test_config(tmp.path()));

        assert!(service.start().await);
        assert!(service.is_available());
        assert!(service.chunk_count().await > 0);

        let response = service
            .search(
                "audit log full",
                &SearchOptions {
                    top_k: Some(5),
                    score_threshold: Some(0.05),
                    semantic_type: None,
                },
            )
            .await;
        assert!(response.code.is_none());
        assert!(!response.results.is_empty());

        service.stop().await;
        assert!(!service.is_available());
        IndexService::evict(&project);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        write(&project, "sequences/audit.xml", SEQUENCE);
        let service = IndexService::for_project(&project, test_config(tmp.path()));

        assert!(service.start().await);
        let count = service.chunk_count().await;
        assert!(service.start().await);
        assert_eq!(service.chunk_count().await, count);

        service.stop().await;
        IndexService::evict(&project);
    }

    #[tokio::test]
    async fn same_project_resolves_to_same_instance() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();

        let a = IndexService::for_project(&project, test_config(tmp.path()));
        let b = IndexService::for_project(&project, test_config(tmp.path()));
        assert!(Arc::ptr_eq(&a, &b));
        IndexService::evict(&project);
    }

    #[tokio::test]
    async fn notify_file_change_reindexes_directory() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        write(&project, "sequences/audit.xml", SEQUENCE);
        let project = project.canonicalize().unwrap();
        let path = project.join("sequences").join("audit.xml");
        let service = IndexService::for_project(&project, test_config(tmp.path()));
        assert!(service.start().await);
        let before = service.chunk_count().await;

        // Add a second sequence definition to the same file's directory.
        write(
            &project,
            "sequences/extra.xml",
            &SEQUENCE.replace("AuditSeq", "ExtraSeq"),
        );
        service.notify_file_change(&path).await;

        let after = service.chunk_count().await;
        assert!(after > before, "expected new chunks, {} -> {}", before, after);

        service.stop().await;
        IndexService::evict(&project);
    }

    #[tokio::test]
    async fn wait_for_ready_reports_failure_without_throwing() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        let mut config = test_config(tmp.path());
        // A model dir with no model files must fail initialization.
        config.embedding.model_dir = Some(tmp.path().join("no-model"));
        let service = IndexService::for_project(&project, config);

        assert!(!service.start().await);
        assert_eq!(service.state(), ServiceState::Failed);
        assert!(!service.wait_for_ready().await);
        IndexService::evict(&project);
    }
}
