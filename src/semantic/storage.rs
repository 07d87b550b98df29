//! Durable storage for one index generation.
//!
//! A generation is persisted as three files: the serialized vector index, the
//! raw embedding matrix and the document list. Each file is wrapped in the same
//! envelope:
//!
//! Header (70 bytes):
//! - magic: [u8; 4] ("DSAG")
//! - version: u8 (1)
//! - kind: u8 (1 = index, 2 = embeddings, 3 = documents)
//! - generation: [u8; 16] (ULID of the build)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - payload_len: u64 (little-endian)
//! - payload_checksum: u32 (CRC32 of payload)
//! - header_checksum: u32 (CRC32 of the header fields before it)
//!
//! Payloads:
//! - index: `FlatL2Index::to_bytes`
//! - embeddings: rows u64, dimensions u32, then rows * dimensions f32 (little-endian)
//! - documents: JSON object with `model`, `built_at` and `documents`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::lock::StoreLock;
use crate::semantic::generation::{GenerationError, GenerationId, IndexGeneration};
use crate::semantic::index::{FlatL2Index, IndexError};

const MAGIC: [u8; 4] = *b"DSAG";

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// magic(4) + version(1) + kind(1) + generation(16) + model_id(32)
/// + payload_len(8) + payload_checksum(4) + header_checksum(4)
const HEADER_SIZE: usize = 70;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid file format in {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch in {0}: file may be corrupted")]
    ChecksumMismatch(PathBuf),

    #[error("Model mismatch: artifacts were built with a different model")]
    ModelMismatch,

    #[error("Artifacts belong to different generations ({0})")]
    GenerationMismatch(String),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Inconsistent generation: {0}")]
    Inconsistent(#[from] GenerationError),

    #[error("Document list is not valid JSON: {0}")]
    Documents(#[from] serde_json::Error),

    #[error("Could not lock the index store: {0}")]
    Lock(std::io::Error),
}

/// The three artifact locations of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePaths {
    pub index: PathBuf,
    pub embeddings: PathBuf,
    pub documents: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Index = 1,
    Embeddings = 2,
    Documents = 3,
}

/// Header of one artifact file.
#[derive(Debug)]
struct Envelope {
    kind: u8,
    generation: [u8; 16],
    model_id: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct DocumentsPayload {
    model: String,
    built_at: DateTime<Utc>,
    documents: Vec<String>,
}

/// Durable home of the current index generation.
///
/// The store does no in-process locking; callers serialize writers.
pub struct IndexStore {
    paths: StorePaths,
}

impl IndexStore {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    #[cfg(test)]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// True when all three artifacts exist on disk.
    #[cfg(test)]
    pub fn exists(&self) -> bool {
        self.artifact_paths().iter().all(|p| p.exists())
    }

    /// Load the persisted generation.
    ///
    /// Returns `None` when any artifact is missing, unreadable, corrupt, from a
    /// different model, or from a different build than the others. A partial
    /// generation is never returned.
    pub fn load(&self, expected_model_id: &[u8; 32]) -> Option<IndexGeneration> {
        if let Some(missing) = self.artifact_paths().iter().find(|p| !p.exists()) {
            log::info!("no stored index: {} is missing", missing.display());
            return None;
        }

        match self.try_load(expected_model_id) {
            Ok(generation) => {
                log::info!(
                    "loaded generation {} with {} documents from storage",
                    generation.id(),
                    generation.len()
                );
                Some(generation)
            }
            Err(err) => {
                log::warn!("ignoring stored index: {err}");
                None
            }
        }
    }

    /// Load and validate all three artifacts, reporting why they are unusable.
    pub fn try_load(&self, expected_model_id: &[u8; 32]) -> Result<IndexGeneration, StoreError> {
        let (index_env, index_payload) = read_artifact(&self.paths.index, ArtifactKind::Index)?;
        let (emb_env, emb_payload) =
            read_artifact(&self.paths.embeddings, ArtifactKind::Embeddings)?;
        let (doc_env, doc_payload) =
            read_artifact(&self.paths.documents, ArtifactKind::Documents)?;

        for env in [&index_env, &emb_env, &doc_env] {
            if env.model_id != *expected_model_id {
                return Err(StoreError::ModelMismatch);
            }
        }

        if index_env.generation != emb_env.generation || emb_env.generation != doc_env.generation
        {
            return Err(StoreError::GenerationMismatch(format!(
                "index {}, embeddings {}, documents {}",
                GenerationId::from_bytes(index_env.generation),
                GenerationId::from_bytes(emb_env.generation),
                GenerationId::from_bytes(doc_env.generation),
            )));
        }

        let index = FlatL2Index::from_bytes(&index_payload)?;
        let embeddings = decode_matrix(&self.paths.embeddings, &emb_payload)?;
        let documents: DocumentsPayload = serde_json::from_slice(&doc_payload)?;

        Ok(IndexGeneration::assemble(
            GenerationId::from_bytes(index_env.generation),
            documents.model,
            documents.built_at,
            documents.documents,
            embeddings,
            index,
        )?)
    }

    /// Persist a generation.
    ///
    /// All three artifacts are written and fsynced to temporary siblings first;
    /// only when every write succeeded are they renamed over the targets. If a
    /// write fails the temporaries are removed and the previous artifacts are
    /// left as they were.
    pub fn save(&self, generation: &IndexGeneration, model_id: &[u8; 32]) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.paths.index).map_err(StoreError::Lock)?;

        let generation_bytes = generation.id().to_bytes();
        let documents = serde_json::to_vec(&DocumentsPayload {
            model: generation.model().to_string(),
            built_at: generation.built_at(),
            documents: generation.documents().to_vec(),
        })?;

        let artifacts = [
            (&self.paths.index, ArtifactKind::Index, generation.index().to_bytes()),
            (
                &self.paths.embeddings,
                ArtifactKind::Embeddings,
                encode_matrix(generation.dimensions(), generation.embeddings()),
            ),
            (&self.paths.documents, ArtifactKind::Documents, documents),
        ];

        let mut written: Vec<(PathBuf, &PathBuf)> = Vec::with_capacity(artifacts.len());
        for (target, kind, payload) in &artifacts {
            let temp = temp_path(target);
            let envelope = Envelope {
                kind: *kind as u8,
                generation: generation_bytes,
                model_id: *model_id,
            };

            if let Err(err) = write_artifact(&temp, &envelope, payload) {
                let _ = std::fs::remove_file(&temp);
                for (temp, _) in &written {
                    let _ = std::fs::remove_file(temp);
                }
                return Err(err);
            }
            written.push((temp, *target));
        }

        for (renamed, (temp, target)) in written.iter().enumerate() {
            if let Err(source) = std::fs::rename(temp, target) {
                for (temp, _) in &written[renamed..] {
                    let _ = std::fs::remove_file(temp);
                }
                if renamed > 0 {
                    log::error!(
                        "store is torn: {renamed} of {} artifacts replaced by generation {}, \
                         the previous generation is no longer loadable",
                        written.len(),
                        generation.id()
                    );
                }
                return Err(StoreError::Io {
                    path: (*target).clone(),
                    source,
                });
            }
        }

        log::info!(
            "saved generation {} ({} documents)",
            generation.id(),
            generation.len()
        );

        Ok(())
    }

    fn artifact_paths(&self) -> [&PathBuf; 3] {
        [&self.paths.index, &self.paths.embeddings, &self.paths.documents]
    }
}

/// `documents.bin` -> `documents.bin.tmp`
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_artifact(path: &Path, envelope: &Envelope, payload: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&encode_header(envelope, payload)).map_err(io_err)?;
    writer.write_all(payload).map_err(io_err)?;

    writer.flush().map_err(io_err)?;
    let file = writer
        .into_inner()
        .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    file.sync_all().map_err(io_err)?;

    Ok(())
}

fn encode_header(envelope: &Envelope, payload: &[u8]) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];

    header[0..4].copy_from_slice(&MAGIC);
    header[4] = FORMAT_VERSION;
    header[5] = envelope.kind;
    header[6..22].copy_from_slice(&envelope.generation);
    header[22..54].copy_from_slice(&envelope.model_id);
    header[54..62].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    header[62..66].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());

    let checksum = crc32fast::hash(&header[0..66]);
    header[66..70].copy_from_slice(&checksum.to_le_bytes());

    header
}

fn read_artifact(path: &Path, kind: ArtifactKind) -> Result<(Envelope, Vec<u8>), StoreError> {
    let bytes = std::fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |reason: String| StoreError::InvalidFormat {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < HEADER_SIZE {
        return Err(invalid(format!("file is only {} bytes", bytes.len())));
    }
    let (header, payload) = bytes.split_at(HEADER_SIZE);

    if header[0..4] != MAGIC {
        return Err(invalid("bad magic".to_string()));
    }
    if header[4] != FORMAT_VERSION {
        return Err(StoreError::VersionMismatch(header[4], FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([header[66], header[67], header[68], header[69]]);
    if crc32fast::hash(&header[0..66]) != stored_checksum {
        return Err(StoreError::ChecksumMismatch(path.to_path_buf()));
    }

    if header[5] != kind as u8 {
        return Err(invalid(format!(
            "expected artifact kind {}, found {}",
            kind as u8, header[5]
        )));
    }

    let mut generation = [0u8; 16];
    generation.copy_from_slice(&header[6..22]);
    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header[22..54]);

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[54..62]);
    let payload_len = u64::from_le_bytes(len_bytes);
    if payload.len() as u64 != payload_len {
        return Err(invalid(format!(
            "header declares {payload_len} payload bytes, found {}",
            payload.len()
        )));
    }

    let payload_checksum = u32::from_le_bytes([header[62], header[63], header[64], header[65]]);
    if crc32fast::hash(payload) != payload_checksum {
        return Err(StoreError::ChecksumMismatch(path.to_path_buf()));
    }

    Ok((
        Envelope {
            kind: header[5],
            generation,
            model_id,
        },
        payload.to_vec(),
    ))
}

fn encode_matrix(dimensions: usize, rows: &[Vec<f32>]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(12 + rows.len() * dimensions * 4);
    bytes.extend_from_slice(&(rows.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&(dimensions as u32).to_le_bytes());
    for row in rows {
        for value in row {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    bytes
}

fn decode_matrix(path: &Path, bytes: &[u8]) -> Result<Vec<Vec<f32>>, StoreError> {
    let invalid = |reason: String| StoreError::InvalidFormat {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < 12 {
        return Err(invalid("embedding matrix header is truncated".to_string()));
    }

    let mut rows_bytes = [0u8; 8];
    rows_bytes.copy_from_slice(&bytes[0..8]);
    let rows = u64::from_le_bytes(rows_bytes) as usize;
    let dimensions = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;

    let values = &bytes[12..];
    let expected = rows
        .checked_mul(dimensions)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| invalid("embedding matrix size overflows".to_string()))?;
    if values.len() != expected {
        return Err(invalid(format!(
            "{rows}x{dimensions} matrix needs {expected} bytes, found {}",
            values.len()
        )));
    }
    if dimensions == 0 {
        return Ok(vec![Vec::new(); rows]);
    }

    Ok(values
        .chunks_exact(dimensions * 4)
        .map(|row| {
            row.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::embeddings::model_id_hash;

    fn store_in(dir: &Path) -> IndexStore {
        IndexStore::new(StorePaths {
            index: dir.join("index.bin"),
            embeddings: dir.join("embeddings.bin"),
            documents: dir.join("documents.bin"),
        })
    }

    fn sample_generation(docs: &[&str]) -> IndexGeneration {
        let embeddings = docs
            .iter()
            .enumerate()
            .map(|(i, _)| vec![i as f32, 1.0, -0.5 * i as f32])
            .collect();
        IndexGeneration::build(
            "test-model",
            3,
            docs.iter().map(|d| d.to_string()).collect(),
            embeddings,
        )
        .unwrap()
    }

    fn model_id() -> [u8; 32] {
        model_id_hash("test-model")
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let generation = sample_generation(&["alpha", "beta", "gamma"]);

        store.save(&generation, &model_id()).unwrap();
        assert!(store.exists());

        let loaded = store.load(&model_id()).unwrap();
        assert_eq!(loaded.id(), generation.id());
        assert_eq!(loaded.documents(), generation.documents());
        assert_eq!(loaded.embeddings(), generation.embeddings());
        assert_eq!(loaded.index(), generation.index());
        assert_eq!(loaded.built_at(), generation.built_at());
        assert_eq!(loaded.model(), "test-model");
    }

    #[test]
    fn test_missing_artifact_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&sample_generation(&["alpha"]), &model_id()).unwrap();

        std::fs::remove_file(&store.paths().embeddings).unwrap();
        assert!(!store.exists());
        assert!(store.load(&model_id()).is_none());
    }

    #[test]
    fn test_empty_store_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(store_in(tmp.path()).load(&model_id()).is_none());
    }

    #[test]
    fn test_model_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&sample_generation(&["alpha"]), &model_id()).unwrap();

        let other = model_id_hash("other-model");
        assert!(matches!(
            store.try_load(&other),
            Err(StoreError::ModelMismatch)
        ));
        assert!(store.load(&other).is_none());
    }

    #[test]
    fn test_mixed_generations_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let first = store_in(&tmp.path().join("first"));
        let second = store_in(&tmp.path().join("second"));

        first.save(&sample_generation(&["alpha", "beta"]), &model_id()).unwrap();
        second.save(&sample_generation(&["alpha", "beta"]), &model_id()).unwrap();

        // simulate a crash between renames: index from one build, the rest from another
        std::fs::copy(&second.paths().index, &first.paths().index).unwrap();

        assert!(matches!(
            first.try_load(&model_id()),
            Err(StoreError::GenerationMismatch(_))
        ));
        assert!(first.load(&model_id()).is_none());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&sample_generation(&["alpha", "beta"]), &model_id()).unwrap();

        let mut bytes = std::fs::read(&store.paths().documents).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        std::fs::write(&store.paths().documents, bytes).unwrap();

        assert!(matches!(
            store.try_load(&model_id()),
            Err(StoreError::ChecksumMismatch(_))
        ));
        assert!(store.load(&model_id()).is_none());
    }

    #[test]
    fn test_header_corruption_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&sample_generation(&["alpha"]), &model_id()).unwrap();

        let mut bytes = std::fs::read(&store.paths().index).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&store.paths().index, bytes).unwrap();

        assert!(matches!(
            store.try_load(&model_id()),
            Err(StoreError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_truncated_artifact_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.save(&sample_generation(&["alpha"]), &model_id()).unwrap();

        std::fs::write(&store.paths().embeddings, b"DSAG").unwrap();
        assert!(store.load(&model_id()).is_none());
    }

    #[test]
    fn test_failed_save_keeps_previous_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let previous = sample_generation(&["alpha", "beta"]);
        store.save(&previous, &model_id()).unwrap();

        // a directory where the documents temp file should go makes that write fail
        std::fs::create_dir(temp_path(&store.paths().documents)).unwrap();

        let replacement = sample_generation(&["gamma", "delta", "epsilon"]);
        assert!(store.save(&replacement, &model_id()).is_err());

        assert!(!temp_path(&store.paths().index).exists());
        assert!(!temp_path(&store.paths().embeddings).exists());

        let loaded = store.load(&model_id()).unwrap();
        assert_eq!(loaded.id(), previous.id());
        assert_eq!(loaded.documents(), previous.documents());
    }

    #[test]
    fn test_failed_rename_removes_remaining_temporaries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        // the index rename lands, then the embeddings target cannot be replaced
        std::fs::create_dir(&store.paths().embeddings).unwrap();
        std::fs::write(store.paths().embeddings.join("keep"), b"x").unwrap();

        let result = store.save(&sample_generation(&["alpha", "beta"]), &model_id());
        assert!(matches!(result, Err(StoreError::Io { .. })));

        assert!(store.paths().index.is_file());
        assert!(!temp_path(&store.paths().index).exists());
        assert!(!temp_path(&store.paths().embeddings).exists());
        assert!(!temp_path(&store.paths().documents).exists());
        assert!(store.load(&model_id()).is_none());
    }

    #[test]
    fn test_save_into_missing_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(&tmp.path().join("nested").join("dir"));
        store.save(&sample_generation(&["alpha"]), &model_id()).unwrap();
        assert!(store.load(&model_id()).is_some());
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        assert_eq!(
            temp_path(Path::new("/data/documents.bin")),
            PathBuf::from("/data/documents.bin.tmp")
        );
    }
}
