use std::path::Path;

use super::{clean_units, read_source, ExtractionError, TextExtractor};

/// One document per PDF page.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let bytes = read_source(path)?;

        let pages = pdf_extract::extract_text_from_mem_by_pages(&bytes).map_err(|e| {
            ExtractionError::Unparseable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        log::debug!("{}: {} pages", path.display(), pages.len());

        // image-only pages come back empty and are skipped
        Ok(clean_units(pages))
    }

    fn name(&self) -> &'static str {
        "pdf"
    }
}
