//! Embedding model wrapper for fastembed.
//!
//! - `Embedder`: the capability the index pipeline depends on
//! - `EmbeddingModel`: fastembed-backed implementation, loaded once per process

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::{mpsc, Mutex};
use std::time::Duration;

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Maps strings to fixed-length vectors.
///
/// Implementations must be deterministic for a fixed model and input and must
/// return one vector per input, in input order.
pub trait Embedder: Send + Sync {
    /// Model identifier, as configured.
    fn name(&self) -> &str;

    /// Length of every vector this model produces.
    fn dimensions(&self) -> usize;

    /// Encode a batch of texts.
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Encode a single text.
    fn encode_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.encode(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    /// SHA256 of the model name, used to tag persisted artifacts.
    fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.name())
    }
}

/// Compute SHA256 hash of a model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Model ids accepted in configuration. All produce 384-dimensional vectors.
const SUPPORTED_MODELS: [(&str, fastembed::EmbeddingModel); 4] = [
    ("all-minilm-l6-v2", fastembed::EmbeddingModel::AllMiniLML6V2),
    ("all-minilm-l6-v2-q", fastembed::EmbeddingModel::AllMiniLML6V2Q),
    ("bge-small-en-v1.5", fastembed::EmbeddingModel::BGESmallENV15),
    ("bge-small-en-v1.5-q", fastembed::EmbeddingModel::BGESmallENV15Q),
];

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Load the named model, downloading it into `cache_dir/models` if needed.
    ///
    /// Loading happens on a helper thread; if it does not finish within
    /// `download_timeout` this returns `DownloadTimeout` and the late result is
    /// dropped.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!(
            "loading embedding model '{}' (cache: {})",
            model_name,
            models_dir.display()
        );

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let loaded = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))
                .and_then(|mut model| {
                    let dimensions = Self::probe_dimensions(&mut model)?;
                    Ok((model, dimensions))
                });
            // receiver is gone when the caller already timed out
            let _ = tx.send(loaded);
        });

        let (model, dimensions) = match rx.recv_timeout(timeout) {
            Ok(loaded) => loaded?,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed(
                    "model loader thread exited unexpectedly".to_string(),
                ))
            }
        };

        log::info!("embedding model '{model_name}' ready ({dimensions} dimensions)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    /// Map a configured model id (case-insensitive) to its fastembed model.
    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        let wanted = name.to_lowercase();
        SUPPORTED_MODELS
            .iter()
            .find(|(id, _)| *id == wanted)
            .map(|(_, model)| model.clone())
            .ok_or_else(|| {
                let known: Vec<&str> = SUPPORTED_MODELS.iter().map(|(id, _)| *id).collect();
                EmbeddingError::InvalidModel(format!(
                    "unknown model {name}, expected one of: {}",
                    known.join(", ")
                ))
            })
    }

    /// Embed one short text to learn the vector width.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let probe = model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("dimension probe failed: {e}")))?;

        match probe.first() {
            Some(vector) if !vector.is_empty() => Ok(vector.len()),
            _ => Err(EmbeddingError::InitFailed(
                "model returned an empty embedding".to_string(),
            )),
        }
    }
}

impl Embedder for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "model returned {} vectors for {} inputs",
                embeddings.len(),
                texts.len()
            )));
        }

        Ok(embeddings)
    }
}
