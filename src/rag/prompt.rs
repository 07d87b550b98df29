use serde::{Deserialize, Serialize};

/// Prefix of every answer produced without a completion endpoint.
pub const FALLBACK_PREFIX: &str = "(Local mode) Based on the document:";

/// One prior exchange supplied by the caller. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    #[serde(alias = "from")]
    pub role: String,
    pub text: String,
}

#[cfg(test)]
impl ConversationTurn {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// Retrieved documents, most relevant first, separated by a blank line.
pub fn join_context(documents: &[String]) -> String {
    documents.join("\n\n")
}

/// Grounded prompt sent to the completion endpoint.
pub fn build_prompt(history: &[ConversationTurn], query: &str, context: &str) -> String {
    let conversation = history
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.text))
        .collect::<Vec<_>>()
        .join("\n");

    format!("Conversation so far:\n{conversation}\nUser: {query}\nContext:\n{context}\nAnswer concisely:")
}

/// Answer used when no completion endpoint is configured.
///
/// `budget` counts characters, not bytes, so the excerpt never splits a
/// multi-byte character.
pub fn fallback_answer(context: &str, budget: usize) -> String {
    let mut excerpt: String = context.chars().take(budget).collect();
    if context.chars().nth(budget).is_some() {
        excerpt.push_str("...");
    }
    format!("{FALLBACK_PREFIX}\n\n{excerpt}")
}
