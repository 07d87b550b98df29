use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::rag::{AnswerField, CompletionSettings, QuerySettings, DEFAULT_ANSWER_FIELDS};
use crate::semantic::{BuildSettings, StorePaths, DEFAULT_MODEL};

const DEFAULT_LISTEN: &str = "0.0.0.0:5000";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 600;
const DEFAULT_K: usize = 3;
const DEFAULT_FALLBACK_CHARS: usize = 800;
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 300;
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;

/// Embedding model and index build settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    pub model: String,

    /// Timeout for model download in seconds
    pub download_timeout_secs: u64,

    /// Documents per encode call during a build
    pub batch_size: usize,

    /// Upper bound for extraction plus encoding
    pub build_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT_SECS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_k: usize,
    /// Characters of context quoted by the local-mode answer
    pub fallback_chars: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: DEFAULT_K,
            fallback_chars: DEFAULT_FALLBACK_CHARS,
        }
    }
}

/// External completion endpoint. Without `api_url` answers are local.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub answer_fields: Vec<AnswerField>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            model: DEFAULT_LLM_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
            answer_fields: DEFAULT_ANSWER_FIELDS.to_vec(),
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("answer_fields", &self.answer_fields)
            .finish()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    /// Data directory holding the model cache; `~/.local/share/docsage` when unset
    pub base_path: Option<PathBuf>,
    pub source_path: PathBuf,
    pub index_path: PathBuf,
    pub embeddings_path: PathBuf,
    pub documents_path: PathBuf,
    pub reindex_secret: Option<String>,
    pub embedding: EmbeddingConfig,
    pub query: QueryConfig,
    pub llm: LlmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            base_path: None,
            source_path: PathBuf::from("document.pdf"),
            index_path: PathBuf::from("index.bin"),
            embeddings_path: PathBuf::from("embeddings.bin"),
            documents_path: PathBuf::from("documents.bin"),
            reindex_secret: None,
            embedding: EmbeddingConfig::default(),
            query: QueryConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field("base_path", &self.base_path)
            .field("source_path", &self.source_path)
            .field("index_path", &self.index_path)
            .field("embeddings_path", &self.embeddings_path)
            .field("documents_path", &self.documents_path)
            .field("reindex_secret", &redact(&self.reindex_secret))
            .field("embedding", &self.embedding)
            .field("query", &self.query)
            .field("llm", &self.llm)
            .finish()
    }
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

impl Config {
    /// Defaults, then the YAML file if given, then the process environment.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Same as `load` with an explicit variable lookup.
    pub fn load_with<F>(config_path: Option<&Path>, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config file {}", path.display()))?;
                serde_yml::from_str::<Self>(&raw)
                    .with_context(|| format!("config file {} is malformed", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // empty variables count as unset
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("DOCSAGE_LISTEN") {
            self.listen = v;
        }
        if let Some(v) = get("DOCSAGE_BASE_PATH") {
            self.base_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DOCSAGE_SOURCE_PATH") {
            self.source_path = PathBuf::from(v);
        }
        if let Some(v) = get("DOCSAGE_INDEX_PATH") {
            self.index_path = PathBuf::from(v);
        }
        if let Some(v) = get("DOCSAGE_EMBEDDINGS_PATH") {
            self.embeddings_path = PathBuf::from(v);
        }
        if let Some(v) = get("DOCSAGE_DOCUMENTS_PATH") {
            self.documents_path = PathBuf::from(v);
        }
        if let Some(v) = get("DOCSAGE_REINDEX_SECRET") {
            self.reindex_secret = Some(v);
        }
        if let Some(v) = get("DOCSAGE_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = get("DOCSAGE_DOWNLOAD_TIMEOUT_SECS") {
            self.embedding.download_timeout_secs = parse_var("DOCSAGE_DOWNLOAD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DOCSAGE_EMBEDDING_BATCH_SIZE") {
            self.embedding.batch_size = parse_var("DOCSAGE_EMBEDDING_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("DOCSAGE_BUILD_TIMEOUT_SECS") {
            self.embedding.build_timeout_secs = parse_var("DOCSAGE_BUILD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DOCSAGE_DEFAULT_K") {
            self.query.default_k = parse_var("DOCSAGE_DEFAULT_K", &v)?;
        }
        if let Some(v) = get("DOCSAGE_FALLBACK_CHARS") {
            self.query.fallback_chars = parse_var("DOCSAGE_FALLBACK_CHARS", &v)?;
        }
        if let Some(v) = get("LLM_API_URL") {
            self.llm.api_url = Some(v);
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_var("LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_var("LLM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("LLM_ANSWER_FIELDS") {
            self.llm.answer_fields = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(AnswerField::from_str)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| anyhow::anyhow!("LLM_ANSWER_FIELDS: {e}"))?;
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(api_url) = &self.llm.api_url {
            url::Url::parse(api_url).with_context(|| format!("llm.api_url '{api_url}' is not a valid URL"))?;
        }
        if self.query.default_k == 0 {
            bail!("query.default_k must be greater than 0");
        }
        if self.query.fallback_chars == 0 {
            bail!("query.fallback_chars must be greater than 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be greater than 0");
        }
        if self.embedding.download_timeout_secs == 0 {
            bail!("embedding.download_timeout_secs must be greater than 0");
        }
        if self.embedding.build_timeout_secs == 0 {
            bail!("embedding.build_timeout_secs must be greater than 0");
        }
        if self.llm.max_tokens == 0 {
            bail!("llm.max_tokens must be greater than 0");
        }
        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be greater than 0");
        }
        if self.llm.answer_fields.is_empty() {
            bail!("llm.answer_fields must name at least one field");
        }
        Ok(())
    }

    /// Data directory, defaulting to `~/.local/share/docsage`.
    pub fn resolve_base_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.base_path {
            return Ok(path.clone());
        }

        let home = my_home()
            .context("could not determine home directory")?
            .context("home directory path is empty")?;
        Ok(home.join(".local").join("share").join("docsage"))
    }

    pub fn store_paths(&self) -> StorePaths {
        StorePaths {
            index: self.index_path.clone(),
            embeddings: self.embeddings_path.clone(),
            documents: self.documents_path.clone(),
        }
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            source: self.source_path.clone(),
            batch_size: self.embedding.batch_size,
            timeout: Duration::from_secs(self.embedding.build_timeout_secs),
        }
    }

    pub fn query_settings(&self) -> QuerySettings {
        QuerySettings {
            default_k: self.query.default_k,
            fallback_chars: self.query.fallback_chars,
        }
    }

    /// Completion endpoint settings, `None` in local mode.
    pub fn completion_settings(&self) -> anyhow::Result<Option<CompletionSettings>> {
        let Some(api_url) = &self.llm.api_url else {
            return Ok(None);
        };

        Ok(Some(CompletionSettings {
            url: url::Url::parse(api_url)?,
            api_key: self.llm.api_key.clone(),
            model: self.llm.model.clone(),
            max_tokens: self.llm.max_tokens,
            timeout: Duration::from_secs(self.llm.timeout_secs),
            answer_fields: self.llm.answer_fields.clone(),
        }))
    }
}

fn parse_var<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{key}='{value}' is invalid: {e}"))
}
