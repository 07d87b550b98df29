//! One consistent build of the corpus: documents, their embeddings and the
//! index over those embeddings.

use chrono::{DateTime, Utc};
use rusty_ulid::Ulid;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use crate::semantic::index::{FlatL2Index, IndexError};

/// Identifier of one build. Sortable by creation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GenerationId(Ulid);

impl GenerationId {
    pub fn new() -> Self {
        GenerationId(Ulid::generate())
    }

    pub fn to_bytes(self) -> [u8; 16] {
        u128::from(self.0).to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        GenerationId(Ulid::from(u128::from_be_bytes(bytes)))
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenerationId {
    type Err = rusty_ulid::DecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_str(s).map(GenerationId)
    }
}

impl Serialize for GenerationId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GenerationId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Immutable snapshot served to queries.
///
/// Construction checks `documents.len() == embeddings.len() == index.len()`;
/// nothing mutates a generation afterwards.
#[derive(Debug)]
pub struct IndexGeneration {
    id: GenerationId,
    model: String,
    built_at: DateTime<Utc>,
    documents: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    index: FlatL2Index,
}

/// Errors raised when the three parts of a generation disagree.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("{documents} documents, {embeddings} embeddings and {indexed} indexed vectors")]
    CountMismatch {
        documents: usize,
        embeddings: usize,
        indexed: usize,
    },

    #[error("embedding matrix row {0} differs from the indexed vector")]
    VectorMismatch(usize),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl IndexGeneration {
    /// Build a fresh generation from documents and their embeddings.
    pub fn build(
        model: &str,
        dimensions: usize,
        documents: Vec<String>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self, GenerationError> {
        let index = FlatL2Index::build(dimensions, &embeddings)?;
        Self::assemble(
            GenerationId::new(),
            model.to_string(),
            Utc::now(),
            documents,
            embeddings,
            index,
        )
    }

    /// Put together parts read back from storage, checking that they belong
    /// together.
    pub fn assemble(
        id: GenerationId,
        model: String,
        built_at: DateTime<Utc>,
        documents: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        index: FlatL2Index,
    ) -> Result<Self, GenerationError> {
        if documents.len() != embeddings.len() || embeddings.len() != index.len() {
            return Err(GenerationError::CountMismatch {
                documents: documents.len(),
                embeddings: embeddings.len(),
                indexed: index.len(),
            });
        }

        for (position, (row, indexed)) in embeddings.iter().zip(index.vectors()).enumerate() {
            if row.as_slice() != indexed {
                return Err(GenerationError::VectorMismatch(position));
            }
        }

        Ok(Self {
            id,
            model,
            built_at,
            documents,
            embeddings,
            index,
        })
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn embeddings(&self) -> &[Vec<f32>] {
        &self.embeddings
    }

    pub fn index(&self) -> &FlatL2Index {
        &self.index
    }

    pub fn dimensions(&self) -> usize {
        self.index.dimensions()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }
}
