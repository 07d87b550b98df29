//! Text extraction from source documents.
//!
//! Every extractor yields one string per source unit (page, form-feed section or
//! paragraph), trimmed, with empty units dropped. Output order is source order;
//! downstream a document is identified only by its position in this list.

pub mod pdf;
pub mod plain;

use std::path::{Path, PathBuf};

pub use pdf::PdfExtractor;
pub use plain::PlainTextExtractor;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {reason}")]
    Unparseable { path: PathBuf, reason: String },

    #[error("unsupported source format: {0}")]
    Unsupported(PathBuf),
}

/// Pulls ordered plain-text units out of a file.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Vec<String>, ExtractionError>;

    /// Name of this extractor for logging
    fn name(&self) -> &'static str;
}

/// Picks an extractor from the file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceExtractor;

impl SourceExtractor {
    pub fn new() -> Self {
        Self
    }

    fn extractor_for(path: &Path) -> Option<&'static dyn TextExtractor> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())?;

        match ext.as_str() {
            "pdf" => Some(&PdfExtractor),
            "txt" | "text" | "md" => Some(&PlainTextExtractor),
            _ => None,
        }
    }
}

impl TextExtractor for SourceExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let extractor = Self::extractor_for(path)
            .ok_or_else(|| ExtractionError::Unsupported(path.to_path_buf()))?;

        let documents = extractor.extract(path)?;
        log::info!(
            "extractor={} extracted {} documents from {}",
            extractor.name(),
            documents.len(),
            path.display()
        );
        Ok(documents)
    }

    fn name(&self) -> &'static str {
        "source"
    }
}

/// Trim every unit and drop the ones left empty.
pub(crate) fn clean_units<I, S>(units: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    units
        .into_iter()
        .filter_map(|unit| {
            let trimmed = unit.as_ref().trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect()
}

pub(crate) fn read_source(path: &Path) -> Result<Vec<u8>, ExtractionError> {
    std::fs::read(path).map_err(|source| ExtractionError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}
