//! Ingestion worker daemon
//!
//! Run with: cargo run -p docflow --bin docflow-worker

use std::sync::Arc;

use docflow::config::PipelineConfig;
use docflow::ingestion::TextChunker;
use docflow::providers::extractor::TikaExtractor;
use docflow::providers::local::{LocalBlobStore, MemoryVectorStore};
use docflow::providers::ollama::OllamaEmbedder;
use docflow::providers::{ContentExtractor, EmbeddingProvider};
use docflow::{BlobStager, CleanupSweeper, IngestDb, IngestWorker, JobQueue};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::var("DOCFLOW_CONFIG") {
        Ok(path) => PipelineConfig::from_file(&path)?,
        Err(_) => PipelineConfig::default(),
    };

    let worker_count = config.processing.resolved_worker_count();

    tracing::info!("Configuration loaded");
    tracing::info!("  - Database: {}", config.storage.database_path.display());
    tracing::info!("  - Staging dir: {}", config.storage.staging_dir.display());
    tracing::info!("  - Workers: {}", worker_count);
    tracing::info!(
        "  - Chunk window: {} tokens ({} overlap)",
        config.chunking.target_tokens,
        config.chunking.overlap_tokens
    );
    tracing::info!("  - Embedding model: {}", config.embeddings.model);

    // Wire up storage and providers
    let db = Arc::new(IngestDb::new(&config.storage.database_path)?);
    let blob_store = Arc::new(LocalBlobStore::new(&config.storage.staging_dir)?);
    let stager = Arc::new(BlobStager::new(
        db.clone(),
        blob_store,
        config.staging.clone(),
    ));

    let extractor: Arc<dyn ContentExtractor> = Arc::new(TikaExtractor::new(&config.extractor)?);
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OllamaEmbedder::new(&config.embeddings)?);
    let vector_store = Arc::new(MemoryVectorStore::new());

    match extractor.health_check().await {
        Ok(true) => tracing::info!("Extractor reachable at {}", config.extractor.base_url),
        _ => tracing::warn!(
            "Extractor not reachable at {} - extraction will fail until it is up",
            config.extractor.base_url
        ),
    }
    match embedder.health_check().await {
        Ok(true) => tracing::info!("Embedder reachable at {}", config.embeddings.base_url),
        _ => tracing::warn!(
            "Embedder not reachable at {} - embedding will fail until it is up",
            config.embeddings.base_url
        ),
    }

    let queue = Arc::new(JobQueue::new(db.clone(), config.processing.clone()));

    // Start the worker pool
    for i in 0..worker_count {
        let worker = IngestWorker::new(
            format!("worker-{}", i),
            queue.clone(),
            stager.clone(),
            extractor.clone(),
            embedder.clone(),
            vector_store.clone(),
            TextChunker::new(&config.chunking),
            config.processing.clone(),
        );
        tokio::spawn(worker.run());
    }
    tracing::info!("{} workers started", worker_count);

    // Start the cleanup sweeper
    let sweeper = CleanupSweeper::new(db, stager, config.cleanup.sweep_interval());
    tokio::spawn(sweeper.run());

    tracing::info!("docflow worker daemon running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
