//! Call to an external chat-completion endpoint.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// The endpoint could not be reached (connect failure, DNS, timeout).
    #[error("completion endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("completion endpoint returned {status}: {detail}")]
    Upstream { status: u16, detail: String },

    #[error("completion endpoint returned a body that is not JSON: {0}")]
    Malformed(String),
}

/// Where to look for the answer text in a completion response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerField {
    /// `choices[0].message.content`
    #[serde(rename = "choices.message")]
    MessageContent,
    /// `choices[0].text`
    #[serde(rename = "choices.text")]
    Text,
    /// top-level `result`
    #[serde(rename = "result")]
    Result,
}

impl FromStr for AnswerField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "choices.message" => Ok(Self::MessageContent),
            "choices.text" => Ok(Self::Text),
            "result" => Ok(Self::Result),
            other => Err(format!(
                "unknown answer field '{other}' (expected choices.message, choices.text or result)"
            )),
        }
    }
}

pub const DEFAULT_ANSWER_FIELDS: [AnswerField; 2] = [AnswerField::MessageContent, AnswerField::Result];

#[derive(Debug, Default, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    text: Option<String>,
}

/// The parts of a completion response the answer can come from.
#[derive(Debug, Default, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    result: Option<String>,
}

impl CompletionResponse {
    /// Parse a success body. Anything that is JSON is accepted; fields of an
    /// unexpected shape count as absent.
    pub fn parse(body: &str) -> Result<Self, CompletionError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| CompletionError::Malformed(e.to_string()))?;

        Ok(serde_json::from_value(value).unwrap_or_else(|e| {
            log::warn!("unexpected completion response shape: {e}");
            Self::default()
        }))
    }

    /// First non-empty field in `order`, or an empty string.
    pub fn answer(&self, order: &[AnswerField]) -> String {
        let first = self.choices.first();
        order
            .iter()
            .find_map(|field| {
                let candidate = match field {
                    AnswerField::MessageContent => first
                        .and_then(|c| c.message.as_ref())
                        .and_then(|m| m.content.as_deref()),
                    AnswerField::Text => first.and_then(|c| c.text.as_deref()),
                    AnswerField::Result => self.result.as_deref(),
                };
                candidate.filter(|s| !s.is_empty())
            })
            .unwrap_or_default()
            .to_string()
    }
}

/// Turns a prompt into answer text.
pub trait CompletionClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// Connection details for the completion endpoint.
#[derive(Clone)]
pub struct CompletionSettings {
    pub url: url::Url,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub answer_fields: Vec<AnswerField>,
}

impl std::fmt::Debug for CompletionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSettings")
            .field("url", &self.url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("answer_fields", &self.answer_fields)
            .finish()
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
}

/// Blocking HTTP client for a chat-completions style endpoint.
///
/// Must be constructed outside of an async runtime.
pub struct HttpCompletionClient {
    client: reqwest::blocking::Client,
    settings: CompletionSettings,
}

impl HttpCompletionClient {
    pub fn new(settings: CompletionSettings) -> Result<Self, CompletionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| CompletionError::Unavailable(e.to_string()))?;

        Ok(Self { client, settings })
    }

    #[cfg(test)]
    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }
}

impl CompletionClient for HttpCompletionClient {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let body = ChatRequest {
            model: &self.settings.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.settings.max_tokens,
        };

        let mut request = self.client.post(self.settings.url.clone()).json(&body);
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| {
            log::warn!("completion request to {} failed: {e}", self.settings.url);
            CompletionError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| CompletionError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            log::warn!("completion endpoint returned {status}");
            return Err(CompletionError::Upstream {
                status: status.as_u16(),
                detail: text,
            });
        }

        let parsed = CompletionResponse::parse(&text)?;
        Ok(parsed.answer(&self.settings.answer_fields))
    }
}
