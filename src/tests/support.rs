//! Shared fixtures: deterministic embedders, stub extractors and completion
//! clients, and temp-dir backed stores.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::extract::{ExtractionError, SourceExtractor, TextExtractor};
use crate::rag::{CompletionClient, CompletionError};
use crate::semantic::{
    BuildError, BuildSettings, Embedder, EmbeddingError, IndexManager, IndexStore, StorePaths,
};

pub const DIMENSIONS: usize = 256;

/// Bag-of-words embedder: every lowercase token adds 1.0 to the slot its CRC32
/// hashes to. Identical texts map to identical vectors.
pub struct HashEmbedder {
    name: String,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::named("hash-test")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; DIMENSIONS];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let slot = crc32fast::hash(token.to_lowercase().as_bytes()) as usize % DIMENSIONS;
            vector[slot] += 1.0;
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Counts encode calls.
pub struct CountingEmbedder {
    inner: HashEmbedder,
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashEmbedder::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for CountingEmbedder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(texts)
    }
}

/// Sleeps before every encode call. Same model name as `HashEmbedder::new`.
pub struct SlowEmbedder {
    inner: HashEmbedder,
    delay: Duration,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(),
            delay,
        }
    }
}

impl Embedder for SlowEmbedder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        std::thread::sleep(self.delay);
        self.inner.encode(texts)
    }
}

/// Hands out the given corpora in turn, one per extract call.
pub struct RotatingExtractor {
    corpora: Vec<Vec<String>>,
    next: AtomicUsize,
}

impl RotatingExtractor {
    pub fn new(corpora: &[&[&str]]) -> Self {
        Self {
            corpora: corpora
                .iter()
                .map(|docs| docs.iter().map(|d| d.to_string()).collect())
                .collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl TextExtractor for RotatingExtractor {
    fn extract(&self, _path: &Path) -> Result<Vec<String>, ExtractionError> {
        let turn = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(self.corpora[turn % self.corpora.len()].clone())
    }

    fn name(&self) -> &'static str {
        "rotating"
    }
}

/// Completion client replaying scripted outcomes and recording prompts.
pub struct ScriptedCompletion {
    outcomes: Mutex<VecDeque<Result<String, CompletionError>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletion {
    pub fn new(outcomes: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl CompletionClient for ScriptedCompletion {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("scripted answer".to_string()))
    }
}

pub const CORPUS: [&str; 4] = [
    "The warranty covers manufacturing defects for two years from purchase.",
    "Batteries must be charged fully before the first use of the device.",
    "Contact support by email to request a replacement part.",
    "The device is water resistant but must not be submerged.",
];

/// A source document and store inside one temp dir.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub source: PathBuf,
}

impl Fixture {
    pub fn new(documents: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let source = dir.path().join("manual.txt");
        let fixture = Self { dir, source };
        fixture.write_source(documents);
        fixture
    }

    /// Paragraph-separated plain text, one paragraph per document.
    pub fn write_source(&self, documents: &[&str]) {
        std::fs::write(&self.source, documents.join("\n\n")).unwrap();
    }

    pub fn paths(&self) -> StorePaths {
        let dir = self.dir.path().join("store");
        StorePaths {
            index: dir.join("index.bin"),
            embeddings: dir.join("embeddings.bin"),
            documents: dir.join("documents.bin"),
        }
    }

    pub fn store(&self) -> IndexStore {
        IndexStore::new(self.paths())
    }

    pub fn settings(&self) -> BuildSettings {
        BuildSettings {
            source: self.source.clone(),
            batch_size: 2,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn start(
        &self,
        embedder: Arc<dyn Embedder>,
        force_rebuild: bool,
    ) -> Result<IndexManager, BuildError> {
        IndexManager::startup(
            embedder,
            Arc::new(SourceExtractor::new()),
            self.store(),
            self.settings(),
            force_rebuild,
        )
    }

    pub fn manager(&self) -> Arc<IndexManager> {
        Arc::new(
            self.start(Arc::new(HashEmbedder::new()), false)
                .expect("failed to start index manager"),
        )
    }
}
