//! Deltasearch Server Binary
//!
//! Boots the full service: configuration, clients, registry restore, the
//! delta dispatcher, the update worker pool, eager index builds, and the
//! HTTP surface.
//!
//! ## Usage
//!
//! ```bash
//! # Start with the default settings file (config/settings.json)
//! deltasearch
//!
//! # Start with an explicit settings file
//! deltasearch --config /etc/deltasearch/settings.json
//! ```

use clap::Parser;
use deltasearch::config::Config;
use deltasearch::delta::worker::DeltaDispatcher;
use deltasearch::delta::DeltaHandler;
use deltasearch::document::DocumentBuilder;
use deltasearch::extractor::ContentExtractor;
use deltasearch::http::{self, AppState};
use deltasearch::index_manager::IndexManager;
use deltasearch::rdf::client::RdfClientPool;
use deltasearch::search_client::SearchClient;
use deltasearch::update_handler::{UpdateHandler, UpdateProcessor};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "deltasearch", about = "Authorization-aware search index maintainer")]
struct Args {
    /// Path to the JSON settings file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Using default configuration ({e})");
            Config::default()
        }),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let config = Arc::new(config);
    let schema = Arc::new(config.schema()?);
    info!(types = schema.types().len(), "schema_loaded");

    // Clients
    let rdf = Arc::new(RdfClientPool::new(
        config.database_url.as_str(),
        config.connection_pool_size,
    )?);
    let search = Arc::new(SearchClient::new(config.search_url.as_str())?);
    let extractor = Arc::new(ContentExtractor::new(
        config.extractor_url.clone(),
        config.cache_dir.clone(),
        config.attachments_path_base.clone(),
    )?);

    // Core components
    let builder = Arc::new(DocumentBuilder::new(
        Arc::clone(&rdf),
        Arc::clone(&extractor),
        Arc::clone(&schema),
    ));
    let manager = Arc::new(IndexManager::new(
        Arc::clone(&config),
        Arc::clone(&schema),
        Arc::clone(&rdf),
        Arc::clone(&search),
        Arc::clone(&builder),
    ));
    if let Err(e) = manager.restore().await {
        warn!(error = %e, "registry_restore_failed");
    }

    // Update queue: restore the durable snapshot before any worker starts.
    let updates = Arc::new(UpdateHandler::new(
        config.wait_interval(),
        config.queue_file.clone(),
    ));
    match updates.restore() {
        Ok(count) if count > 0 => info!(count, "update_queue_restored_from_disk"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "update_queue_restore_failed"),
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Update workers
    let processor = Arc::new(UpdateProcessor::new(
        Arc::clone(&manager),
        Arc::clone(&builder),
        Arc::clone(&search),
        Arc::clone(&schema),
    ));
    let worker_handles = {
        let processor = Arc::clone(&processor);
        updates.spawn_workers(
            config.number_of_threads,
            shutdown_rx.clone(),
            move |subject, types, action| {
                let processor = Arc::clone(&processor);
                async move { processor.process(subject, types, action).await }
            },
        )
    };
    let persister_handle = updates.spawn_persister(shutdown_rx.clone());

    // Delta pipeline
    let (delta, delta_rx) = DeltaHandler::new(Arc::clone(&schema));
    let dispatcher = Arc::new(DeltaDispatcher::new(
        Arc::clone(&config),
        Arc::clone(&rdf),
        Arc::clone(&updates),
        Arc::clone(&manager),
    ));
    let dispatcher_handle = dispatcher.spawn(delta_rx, shutdown_rx.clone());

    // Eager index builds run in the background so ingestion starts at once.
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.ensure_eager_indexes().await;
        });
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        schema,
        delta,
        updates: Arc::clone(&updates),
        manager,
        search,
        rdf,
    });

    http::start_http_server(state, shutdown_tx)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // The server has stopped and the shutdown signal is out; let the
    // persister write its final snapshot and the workers drain.
    let _ = persister_handle.await;
    let _ = dispatcher_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("shutdown_complete");

    Ok(())
}
