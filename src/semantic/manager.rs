//! Ownership of the live index generation.
//!
//! The manager holds the embedding model, the store and the generation that
//! queries currently read. Queries take an `Arc` snapshot through `current()`
//! and keep it for the whole request. A rebuild produces a complete generation
//! on the side, persists it, and only then replaces the snapshot pointer.

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

use crate::extract::{ExtractionError, TextExtractor};
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::generation::{GenerationError, IndexGeneration};
use crate::semantic::storage::{IndexStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index construction failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("saving the index failed: {0}")]
    Storage(#[from] StoreError),

    #[error("the source document contains no text")]
    EmptyCorpus,

    #[error("build did not finish within {0:?}")]
    Timeout(Duration),

    #[error("build worker failed: {0}")]
    Worker(String),
}

/// Inputs of a full build.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub source: PathBuf,
    pub batch_size: usize,
    pub timeout: Duration,
}

pub struct IndexManager {
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn TextExtractor>,
    store: IndexStore,
    settings: BuildSettings,
    current: RwLock<Arc<IndexGeneration>>,
    /// Held for the whole of a rebuild so rebuilds run one after another.
    rebuild_lock: Mutex<()>,
}

impl IndexManager {
    /// Adopt the stored generation, or build one when there is none (or when
    /// `force_rebuild` is set). Any build failure here is fatal to the caller.
    pub fn startup(
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn TextExtractor>,
        store: IndexStore,
        settings: BuildSettings,
        force_rebuild: bool,
    ) -> Result<Self, BuildError> {
        let stored = if force_rebuild {
            log::info!("rebuild requested, ignoring stored index");
            None
        } else {
            store.load(&embedder.model_id())
        };

        let generation = match stored {
            Some(generation) => generation,
            None => {
                let generation = build_generation(&embedder, &extractor, &settings)?;
                store.save(&generation, &embedder.model_id())?;
                generation
            }
        };

        Ok(Self {
            embedder,
            extractor,
            store,
            settings,
            current: RwLock::new(Arc::new(generation)),
            rebuild_lock: Mutex::new(()),
        })
    }

    /// Snapshot of the live generation.
    pub fn current(&self) -> Arc<IndexGeneration> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Build, persist and publish a new generation from the source document.
    ///
    /// On any failure the previous generation keeps serving and the stored
    /// artifacts are the previous ones.
    pub fn rebuild(&self) -> Result<Arc<IndexGeneration>, BuildError> {
        let _rebuilding = self
            .rebuild_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let started = Instant::now();
        let previous = self.current().id();

        let generation = build_generation(&self.embedder, &self.extractor, &self.settings)
            .inspect_err(|e| log::error!("rebuild failed, keeping generation {previous}: {e}"))?;

        self.store
            .save(&generation, &self.embedder.model_id())
            .inspect_err(|e| log::error!("rebuild not persisted, keeping generation {previous}: {e}"))?;

        let generation = Arc::new(generation);
        {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *guard = Arc::clone(&generation);
        }

        log::info!(
            "generation {} replaced {} ({} documents, {:.1?})",
            generation.id(),
            previous,
            generation.len(),
            started.elapsed()
        );

        Ok(generation)
    }
}

/// Extract and encode on a worker thread, bounded by the build timeout, then
/// assemble the generation. Nothing here touches the store.
fn build_generation(
    embedder: &Arc<dyn Embedder>,
    extractor: &Arc<dyn TextExtractor>,
    settings: &BuildSettings,
) -> Result<IndexGeneration, BuildError> {
    log::info!("building index from {}", settings.source.display());

    let (tx, rx) = mpsc::channel();
    let worker_embedder = Arc::clone(embedder);
    let worker_extractor = Arc::clone(extractor);
    let source = settings.source.clone();
    let batch_size = settings.batch_size.max(1);

    std::thread::Builder::new()
        .name("index-build".to_string())
        .spawn(move || {
            let result = extract_and_encode(
                worker_embedder.as_ref(),
                worker_extractor.as_ref(),
                &source,
                batch_size,
            );
            // receiver is gone when the build already timed out
            let _ = tx.send(result);
        })
        .map_err(|e| BuildError::Worker(e.to_string()))?;

    let (documents, embeddings) = match rx.recv_timeout(settings.timeout) {
        Ok(result) => result?,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            log::error!("build exceeded {:?}, discarding its result", settings.timeout);
            return Err(BuildError::Timeout(settings.timeout));
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(BuildError::Worker(
                "build worker exited without a result".to_string(),
            ))
        }
    };

    Ok(IndexGeneration::build(
        embedder.name(),
        embedder.dimensions(),
        documents,
        embeddings,
    )?)
}

fn extract_and_encode(
    embedder: &dyn Embedder,
    extractor: &dyn TextExtractor,
    source: &std::path::Path,
    batch_size: usize,
) -> Result<(Vec<String>, Vec<Vec<f32>>), BuildError> {
    let documents = extractor.extract(source)?;
    if documents.is_empty() {
        return Err(BuildError::EmptyCorpus);
    }

    let progress = ProgressBar::new(documents.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} documents")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut embeddings = Vec::with_capacity(documents.len());
    for batch in documents.chunks(batch_size) {
        let vectors = embedder.encode(batch)?;
        embeddings.extend(vectors);
        progress.inc(batch.len() as u64);
    }
    progress.finish_and_clear();

    log::info!("encoded {} documents", embeddings.len());
    Ok((documents, embeddings))
}
