//! End-to-end generation flows over real on-disk state: persisted blobs, a
//! durable registry and usage index, and the local backend.

use std::path::PathBuf;
use std::sync::Arc;

use cag_cache::cache::purge::purge;
use cag_cache::cache::registry::{CacheEntry, CacheRegistry, DocumentRef};
use cag_cache::cache::selector::SelectorError;
use cag_cache::cache::store::{CacheStore, SidecarMetadata};
use cag_cache::cache::usage::UsageTracker;
use cag_cache::config::GenerationConfig;
use cag_cache::inference::backend::LocalBackend;
use cag_cache::inference::engine::{
    EngineError, GenerationEngine, GenerationEvent, GenerationRequest,
};
use cag_cache::inference::model::ModelRef;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

struct Env {
    engine: GenerationEngine,
    store: Arc<CacheStore>,
    registry: Arc<RwLock<CacheRegistry>>,
    usage: Arc<RwLock<UsageTracker>>,
    model: ModelRef,
    dir: TempDir,
}

async fn env() -> Env {
    let dir = TempDir::new().unwrap();

    let model_path = dir.path().join("model.gguf");
    std::fs::write(&model_path, vec![1u8; 1024]).unwrap();
    let model = ModelRef::new(model_path, 8192, "v1".into());

    let store = Arc::new(
        CacheStore::new(dir.path().join("caches"), true, 3)
            .await
            .unwrap(),
    );
    let registry = Arc::new(RwLock::new(
        CacheRegistry::load(dir.path().join("cache_registry.json"))
            .await
            .unwrap(),
    ));
    let usage = Arc::new(RwLock::new(
        UsageTracker::load(dir.path().join("usage_registry.json"))
            .await
            .unwrap(),
    ));

    let backend = Box::new(LocalBackend::load(&model).unwrap().with_answer_tokens(4));
    let engine = GenerationEngine::new(
        backend,
        store.clone(),
        registry.clone(),
        usage.clone(),
        model.clone(),
        GenerationConfig::default(),
    );

    Env {
        engine,
        store,
        registry,
        usage,
        model,
        dir,
    }
}

async fn register(env: &Env, id: &str, master: bool) {
    let doc_path = env.dir.path().join(format!("{id}.txt"));
    std::fs::write(&doc_path, "annual revenue grew twelve percent").unwrap();

    let fingerprint = env.model.fingerprint().unwrap();
    let sidecar = SidecarMetadata {
        model_path: env.model.path.clone(),
        model_fingerprint: fingerprint.clone(),
        document_path: doc_path.clone(),
        document_hash: 3,
        token_estimate: 25,
        context_size: 8192,
        created_at: 0,
    };
    let loc = env.store.put(id, &vec![5u8; 2048], &sidecar).await.unwrap();

    env.registry
        .write()
        .await
        .register(CacheEntry {
            id: id.to_string(),
            document: DocumentRef {
                path: doc_path,
                content_hash: 3,
                token_estimate: 25,
            },
            model_fingerprint: fingerprint,
            blob_path: loc.blob_path,
            metadata_path: loc.metadata_path,
            size_bytes: loc.size_bytes,
            created_at: 0,
            last_used_at: 0,
            use_count: 0,
            is_master: master,
        })
        .await
        .unwrap();
}

fn request(query: &str, cache_id: Option<&str>) -> GenerationRequest {
    GenerationRequest {
        request_id: "it-req".into(),
        query: query.into(),
        cache_id: cache_id.map(str::to_string),
        max_tokens: 32,
        temperature: 0.7,
    }
}

async fn collect(mut rx: mpsc::Receiver<GenerationEvent>) -> Vec<GenerationEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn master_promotion_serves_unselected_requests_and_logs_usage() {
    let env = env().await;
    register(&env, "a", false).await;
    env.registry.write().await.set_master("a").await.unwrap();

    // No explicit selection: the master serves the request.
    let rx = env
        .engine
        .generate(request("how much did revenue grow?", None))
        .await
        .unwrap();
    let events = collect(rx).await;

    let mut next_index = 0;
    for event in &events {
        match event {
            GenerationEvent::Token { index, .. } => {
                assert_eq!(*index, next_index);
                next_index += 1;
            }
            GenerationEvent::Done {
                used_cache,
                fallback,
                ..
            } => {
                assert_eq!(used_cache.as_deref(), Some("a"));
                assert!(!fallback);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(next_index > 0);

    // Usage landed in both indexes and survives a reload from disk.
    assert_eq!(env.registry.read().await.get("a").unwrap().use_count, 1);
    let reloaded = UsageTracker::load(env.dir.path().join("usage_registry.json"))
        .await
        .unwrap();
    let rec = reloaded.get("a").unwrap();
    assert_eq!(rec.use_count, 1);
    assert!(rec.last_used_at > 0);
}

#[tokio::test]
async fn corrupt_blob_degrades_to_excerpt_with_warning() {
    let env = env().await;
    register(&env, "a", true).await;

    // Stomp the blob in place; the registry still lists the entry.
    std::fs::write(env.store.blob_path("a"), b"garbage").unwrap();

    let rx = env
        .engine
        .generate(request("how much did revenue grow?", None))
        .await
        .unwrap();
    let events = collect(rx).await;

    match &events[0] {
        GenerationEvent::Warning { message } => assert!(message.contains("'a'")),
        other => panic!("expected warning first, got {other:?}"),
    }
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::Done {
            used_cache: None,
            fallback: true,
            ..
        })
    ));

    // A degraded request never counts as a cache use.
    assert!(env.usage.read().await.get("a").is_none());
}

#[tokio::test]
async fn stale_selection_after_purge_is_rejected() {
    let env = env().await;
    register(&env, "a", false).await;

    {
        let mut registry = env.registry.write().await;
        let mut usage = env.usage.write().await;
        purge(&env.store, &mut registry, &mut usage, "a")
            .await
            .unwrap();
    }

    let err = env
        .engine
        .generate(request("anything", Some("a")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Selector(SelectorError::CacheNotFound(_))
    ));
}

#[tokio::test]
async fn requests_alternate_between_entries() {
    let env = env().await;
    register(&env, "a", true).await;
    register(&env, "b", false).await;

    let rx = env.engine.generate(request("q1", None)).await.unwrap();
    collect(rx).await;
    let rx = env.engine.generate(request("q2", Some("b"))).await.unwrap();
    collect(rx).await;
    let rx = env.engine.generate(request("q3", None)).await.unwrap();
    collect(rx).await;

    let usage = env.usage.read().await;
    assert_eq!(usage.get("a").unwrap().use_count, 2);
    assert_eq!(usage.get("b").unwrap().use_count, 1);
}
