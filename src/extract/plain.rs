use std::path::Path;

use super::{clean_units, read_source, ExtractionError, TextExtractor};

/// Page separator used by text exports of paginated documents.
const FORM_FEED: char = '\x0c';

/// Plain text and markdown sources.
///
/// Units are form-feed separated pages when the file contains any form feed,
/// blank-line separated paragraphs otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    pub fn split_units(text: &str) -> Vec<String> {
        if text.contains(FORM_FEED) {
            return clean_units(text.split(FORM_FEED));
        }

        let mut paragraphs = Vec::new();
        let mut current = String::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    paragraphs.push(std::mem::take(&mut current));
                }
                continue;
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
        if !current.is_empty() {
            paragraphs.push(current);
        }

        clean_units(paragraphs)
    }
}

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let bytes = read_source(path)?;
        let text = String::from_utf8(bytes).map_err(|e| ExtractionError::Unparseable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Self::split_units(&text))
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}
