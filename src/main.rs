use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use cag_cache::cache::registry::CacheRegistry;
use cag_cache::cache::store::CacheStore;
use cag_cache::cache::usage::UsageTracker;
use cag_cache::config::{Cli, Config};
use cag_cache::inference::backend::LocalBackend;
use cag_cache::inference::engine::GenerationEngine;
use cag_cache::inference::model::ModelRef;
use cag_cache::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "cag_cache=debug,tower_http=debug"
    } else {
        "cag_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("cag-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let config = Arc::new(config);

    info!(
        model = %config.model.model_path.display(),
        context_size = config.model.context_size,
        cache_dir = %config.cache.cache_dir.display(),
        compress = config.cache.compress_blobs,
        "Configuration loaded"
    );

    // Durable state: blob store plus the two indexes.
    let store = Arc::new(
        CacheStore::new(
            config.cache.cache_dir.clone(),
            config.cache.compress_blobs,
            config.cache.zstd_level,
        )
        .await?,
    );
    let registry = Arc::new(RwLock::new(CacheRegistry::load(config.registry_path()).await?));
    let usage = Arc::new(RwLock::new(UsageTracker::load(config.usage_path()).await?));

    {
        let registry = registry.read().await;
        info!(
            entries = registry.len(),
            total_bytes = registry.total_bytes(),
            master = ?registry.master().map(|e| e.id.clone()),
            "Cache registry ready"
        );
    }

    // The inference backend. Startup requires the model file; out-of-band
    // removal later surfaces as a per-request model-load failure.
    let model = ModelRef::new(
        config.model.model_path.clone(),
        config.model.context_size,
        config.model.version_tag.clone(),
    );
    let backend = Box::new(LocalBackend::load(&model)?);

    let engine = GenerationEngine::new(
        backend,
        store.clone(),
        registry.clone(),
        usage.clone(),
        model.clone(),
        config.generation.clone(),
    );

    // Build application state.
    let state = Arc::new(AppState {
        engine,
        store,
        registry,
        usage,
        selected: RwLock::new(None),
        history: RwLock::new(Vec::new()),
        model,
        config: config.clone(),
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = cli
        .listen
        .unwrap_or_else(|| config.server.listen.clone());
    info!(addr = %listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
