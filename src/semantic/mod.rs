//! Semantic index over the extracted documents.
//!
//! # Architecture
//!
//! - `embeddings`: Wraps fastembed for embedding generation
//! - `index`: Exact flat L2 nearest-neighbor search
//! - `generation`: One immutable build of documents, embeddings and index
//! - `storage`: Three-artifact persistence of a generation
//! - `manager`: Owns the live generation and rebuilds it

pub mod embeddings;
mod generation;
mod index;
mod manager;
mod storage;

pub use embeddings::{Embedder, EmbeddingError, EmbeddingModel};
pub use generation::GenerationId;
pub use index::IndexError;
pub use manager::{BuildError, BuildSettings, IndexManager};
pub use storage::{IndexStore, StorePaths};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
