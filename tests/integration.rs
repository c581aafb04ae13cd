use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use artifact_index::artifacts::ArtifactRegistry;
use artifact_index::config::IndexConfig;
use artifact_index::embedding::HashingEmbedder;
use artifact_index::models::SearchOptions;
use artifact_index::pipeline::Pipeline;
use artifact_index::progress::NoProgress;
use artifact_index::scanner::Scanner;
use artifact_index::search::SearchEngine;
use artifact_index::service::IndexService;
use artifact_index::store::Store;

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

fn project_fixture(root: &Path) {
    write(
        root,
        "apis/order.xml",
        r#"<api xmlns="http://ws.apache.org/ns/synapse" name="OrderApi" context="/orders">
    <resource methods="GET" uri-template="/list">
        <inSequence>
            <log level="full" category="INFO"/>
            <call>
                <endpoint key="OrdersEp"/>
            </call>
            <respond/>
        </inSequence>
    </resource>
</api>"#,
    );
    write(
        root,
        "sequences/audit.xml",
        r#"<sequence xmlns="http://ws.apache.org/ns/synapse" name="AuditSeq">
    <log level="full" category="INFO" description="order payment audit trail"/>
    <property name="target" value="audit-store"/>
</sequence>"#,
    );
    write(
        root,
        "sequences/health.xml",
        r#"<sequence xmlns="http://ws.apache.org/ns/synapse" name="HealthSeq">
    <log level="simple" description="health check heartbeat ping"/>
    <respond/>
</sequence>"#,
    );
}

fn config_for(tmp: &Path) -> IndexConfig {
    let mut config = IndexConfig::default();
    config.db.path = Some(tmp.join("data").join("embeddings.db"));
    config.watch.debounce_ms = 25;
    config.watch.poll_interval_secs = 0;
    config
}

#[tokio::test]
async fn full_lifecycle_index_search_update_delete() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    project_fixture(&project);
    let project = project.canonicalize().unwrap();

    let service = IndexService::for_project(&project, config_for(tmp.path()));
    assert!(service.start().await);
    let initial = service.chunk_count().await;
    assert!(initial >= 3, "three artifacts yield at least 3 chunks");

    // Search finds the audit sequence for an audit-flavored query.
    let response = service
        .search(
            "order payment audit",
            &SearchOptions {
                top_k: Some(5),
                score_threshold: Some(0.05),
                semantic_type: None,
            },
        )
        .await;
    assert!(response.code.is_none());
    assert!(!response.results.is_empty());
    assert!(
        response.results[0].file_path.ends_with("audit.xml"),
        "expected audit.xml first, got {:?}",
        response.results[0]
    );
    assert!(response.results[0].score > 0.0);
    assert!(!response.results[0].xml_element_hierarchy.is_empty());

    // Delete one artifact and notify; its chunks disappear.
    let health = project.join("sequences").join("health.xml");
    std::fs::remove_file(&health).unwrap();
    service.notify_file_change(&health).await;
    let after_delete = service.chunk_count().await;
    assert!(after_delete < initial);

    service.stop().await;
    assert!(!service.is_available());
    IndexService::evict(&project);
}

#[tokio::test]
async fn restart_reuses_the_persisted_index() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    project_fixture(&project);
    let config = config_for(tmp.path());

    let service = IndexService::for_project(&project, config.clone());
    assert!(service.start().await);
    let count = service.chunk_count().await;
    service.stop().await;
    IndexService::evict(&project);

    // A fresh service over the same store warm-starts and keeps the data.
    let service = IndexService::for_project(&project, config);
    assert!(service.start().await);
    assert_eq!(service.chunk_count().await, count);
    service.stop().await;
    IndexService::evict(&project);
}

#[tokio::test]
async fn steady_state_rechunk_reuses_every_embedding() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    project_fixture(&project);

    let db = tmp.path().join("data").join("embeddings.db");
    let store = Store::open(&db).await.unwrap();
    let embedder = HashingEmbedder::new(64);
    let registry = ArtifactRegistry::new();
    let config = IndexConfig::default();
    let dirs = vec![project.clone()];

    let pipeline = Pipeline::new(&registry, &store, &embedder, &config);
    let mut scanner = Scanner::new(&config.watch.extensions);
    let first = pipeline
        .process_incremental(&dirs, &mut scanner, &NoProgress)
        .await
        .unwrap();
    assert!(first.embedded > 0);
    assert_eq!(first.reused, 0);

    // Cold scanner: every file re-chunks, every chunk reuses its embedding.
    let mut cold = Scanner::new(&config.watch.extensions);
    let second = pipeline
        .process_incremental(&dirs, &mut cold, &NoProgress)
        .await
        .unwrap();
    assert_eq!(second.embedded, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.reused as i64, store.count().await.unwrap());

    // FTS mirror bijection holds after both passes.
    assert_eq!(store.fts_count().await.unwrap(), store.count().await.unwrap());
    store.close().await;
}

#[tokio::test]
async fn deleting_a_file_keeps_the_mirror_tight() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    project_fixture(&project);

    let db = tmp.path().join("data").join("embeddings.db");
    let store = Store::open(&db).await.unwrap();
    let embedder = HashingEmbedder::new(64);
    let registry = ArtifactRegistry::new();
    let config = IndexConfig::default();
    let dirs = vec![project.clone()];

    let pipeline = Pipeline::new(&registry, &store, &embedder, &config);
    let mut scanner = Scanner::new(&config.watch.extensions);
    pipeline
        .process_incremental(&dirs, &mut scanner, &NoProgress)
        .await
        .unwrap();

    let audit = project.join("sequences").join("audit.xml");
    let audit_chunks = store
        .get_by_file(&audit.display().to_string())
        .await
        .unwrap()
        .len() as i64;
    assert!(audit_chunks > 0);
    let total = store.count().await.unwrap();

    std::fs::remove_file(&audit).unwrap();
    let stats = pipeline
        .process_incremental(&dirs, &mut scanner, &NoProgress)
        .await
        .unwrap();
    assert_eq!(stats.deleted as i64, audit_chunks);
    assert_eq!(store.count().await.unwrap(), total - audit_chunks);
    assert_eq!(store.fts_count().await.unwrap(), total - audit_chunks);
    assert!(store
        .get_by_file(&audit.display().to_string())
        .await
        .unwrap()
        .is_empty());
    store.close().await;
}

#[tokio::test]
async fn connector_children_index_as_individual_chunks() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    write(
        &project,
        "sequences/agent.xml",
        "<ai.agent>\n<role>assistant</role>\n<model>foo</model>\n</ai.agent>",
    );

    let db = tmp.path().join("data").join("embeddings.db");
    let store = Store::open(&db).await.unwrap();
    let embedder = HashingEmbedder::new(64);
    let registry = ArtifactRegistry::new();
    let config = IndexConfig::default();

    let pipeline = Pipeline::new(&registry, &store, &embedder, &config);
    let mut scanner = Scanner::new(&config.watch.extensions);
    pipeline
        .process_incremental(&[project.clone()], &mut scanner, &NoProgress)
        .await
        .unwrap();

    let chunks = store.get_all().await.unwrap();
    let types: Vec<&str> = chunks.iter().map(|c| c.chunk_type.as_str()).collect();
    assert!(types.contains(&"role"), "got {:?}", types);
    assert!(types.contains(&"model"), "got {:?}", types);
    store.close().await;
}

#[tokio::test]
async fn hybrid_ordering_prefers_exact_phrase_then_dedups_overlap() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    // One sequence matches the query exactly; the other shares a word.
    write(
        &project,
        "sequences/exact.xml",
        r#"<sequence xmlns="http://ws.apache.org/ns/synapse" name="ExactSeq">
    <log description="validate customer payment request"/>
</sequence>"#,
    );
    write(
        &project,
        "sequences/near.xml",
        r#"<sequence xmlns="http://ws.apache.org/ns/synapse" name="NearSeq">
    <log description="check customer invoice"/>
</sequence>"#,
    );

    let db = tmp.path().join("data").join("embeddings.db");
    let store = Store::open(&db).await.unwrap();
    let embedder = HashingEmbedder::new(64);
    let registry = ArtifactRegistry::new();
    let config = IndexConfig::default();

    let pipeline = Pipeline::new(&registry, &store, &embedder, &config);
    let mut scanner = Scanner::new(&config.watch.extensions);
    pipeline
        .process_incremental(&[project.clone()], &mut scanner, &NoProgress)
        .await
        .unwrap();

    let engine = SearchEngine::new(&store, &embedder, &config.retrieval);
    let response = engine
        .search(
            "validate customer payment request",
            &SearchOptions {
                top_k: Some(5),
                score_threshold: Some(0.05),
                semantic_type: None,
            },
        )
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    assert!(
        response.results[0].file_path.ends_with("exact.xml"),
        "hybrid fusion must rank the exact match first: {:?}",
        response.results
    );
    store.close().await;
}

#[tokio::test]
async fn service_coalesces_concurrent_starts() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    project_fixture(&project);

    let service = IndexService::for_project(&project, config_for(tmp.path()));
    let a = {
        let s = Arc::clone(&service);
        tokio::spawn(async move { s.start().await })
    };
    let b = {
        let s = Arc::clone(&service);
        tokio::spawn(async move { s.start().await })
    };
    assert!(a.await.unwrap());
    assert!(b.await.unwrap());
    assert!(service.is_available());

    service.stop().await;
    IndexService::evict(&project);
}
