//! Retrieval-augmented answering.
//!
//! - `prompt`: conversation turns, prompt layout and the local-mode answer
//! - `completion`: the external completion endpoint
//! - `engine`: retrieval plus answer assembly

pub mod completion;
mod engine;
pub mod prompt;

pub use completion::{
    AnswerField, CompletionClient, CompletionError, CompletionSettings, HttpCompletionClient,
    DEFAULT_ANSWER_FIELDS,
};
pub use engine::{QueryEngine, QueryError, QueryResult, QuerySettings};
pub use prompt::ConversationTurn;
