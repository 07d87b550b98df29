use std::sync::Arc;

use serde::Serialize;

use crate::rag::completion::{CompletionClient, CompletionError};
use crate::rag::prompt::{build_prompt, fallback_answer, join_context, ConversationTurn};
use crate::semantic::{Embedder, EmbeddingError, IndexError, IndexManager};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index search failed: {0}")]
    Index(#[from] IndexError),
}

/// Answer plus the documents it was grounded on, most relevant first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub answer: String,
    pub retrieved: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    pub default_k: usize,
    pub fallback_chars: usize,
}

/// Retrieval-augmented answering over the manager's current generation.
pub struct QueryEngine {
    manager: Arc<IndexManager>,
    /// `None` means local mode
    completion: Option<Arc<dyn CompletionClient>>,
    settings: QuerySettings,
}

impl QueryEngine {
    pub fn new(
        manager: Arc<IndexManager>,
        completion: Option<Arc<dyn CompletionClient>>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            manager,
            completion,
            settings,
        }
    }

    pub fn is_local(&self) -> bool {
        self.completion.is_none()
    }

    /// Answer `query` with the top `k` documents (default when `None`).
    ///
    /// The whole request runs against one generation snapshot, so a rebuild
    /// finishing midway does not change what this call sees.
    pub fn answer(
        &self,
        query: &str,
        history: &[ConversationTurn],
        k: Option<usize>,
    ) -> Result<QueryResult, QueryError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QueryError::InvalidQuery("no query provided".to_string()));
        }

        let k = k.unwrap_or(self.settings.default_k);
        if k == 0 {
            return Err(QueryError::InvalidQuery("k must be positive".to_string()));
        }

        let generation = self.manager.current();
        let embedding = self.manager.embedder().encode_one(query)?;
        let neighbors = generation.index().search(&embedding, k)?;

        let documents = generation.documents();
        let retrieved: Vec<String> = neighbors
            .iter()
            .filter_map(|n| documents.get(n.position).cloned())
            .collect();

        log::debug!(
            "query matched {} documents in generation {}",
            retrieved.len(),
            generation.id()
        );

        let context = join_context(&retrieved);
        let answer = match &self.completion {
            None => fallback_answer(&context, self.settings.fallback_chars),
            Some(client) => client.complete(&build_prompt(history, query, &context))?,
        };

        Ok(QueryResult { answer, retrieved })
    }
}
