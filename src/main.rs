use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod config;
mod credential;
mod extract;
mod lock;
mod rag;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use config::Config;
use extract::SourceExtractor;
use rag::{CompletionClient, HttpCompletionClient, QueryEngine};
use semantic::{EmbeddingModel, IndexManager, IndexStore};

/// Question answering over a document.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// YAML config file; environment variables override its values
    #[clap(long)]
    config: Option<PathBuf>,

    /// Rebuild the index even if a stored one is usable
    #[clap(long, default_value = "false")]
    rebuild: bool,

    /// Address to listen on
    #[clap(long)]
    listen: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    log::debug!("{config:?}");

    let base_path = config.resolve_base_path()?;
    let embedder = EmbeddingModel::new(
        &config.embedding.model,
        base_path,
        Some(Duration::from_secs(config.embedding.download_timeout_secs)),
    )
    .context("failed to load the embedding model")?;

    let manager = IndexManager::startup(
        Arc::new(embedder),
        Arc::new(SourceExtractor::new()),
        IndexStore::new(config.store_paths()),
        config.build_settings(),
        args.rebuild,
    )
    .context("failed to build the index")?;
    let manager = Arc::new(manager);

    let current = manager.current();
    log::info!(
        "serving generation {} ({} documents, {} dimensions)",
        current.id(),
        current.len(),
        current.dimensions()
    );

    // the blocking client has to exist before the runtime starts
    let completion = match config.completion_settings()? {
        Some(settings) => {
            log::info!("answers via {}", settings.url);
            let client: Arc<dyn CompletionClient> = Arc::new(HttpCompletionClient::new(settings)?);
            Some(client)
        }
        None => None,
    };

    let engine = QueryEngine::new(manager.clone(), completion, config.query_settings());
    if engine.is_local() {
        log::info!("no completion endpoint configured, answering in local mode");
    }

    if config.reindex_secret.is_none() {
        log::warn!("DOCSAGE_REINDEX_SECRET is not set, /reindex is disabled");
    }

    let state = Arc::new(web::SharedState {
        engine: Arc::new(engine),
        manager,
        reindex_secret: config.reindex_secret.clone(),
    });

    web::start_daemon(config.listen.clone(), state)
}
