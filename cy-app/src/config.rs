//! Cymbiont configuration loader.

use cy_llm::{
    AnthropicConverter, DEFAULT_LOCAL_BASE_URL, LocalModelConverter, OpenAiConverter, Provider,
    http_client,
};
use cy_queue::{ConverterSet, ModelConfig, ModelTable, QueueSettings};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const OPENAI_FALLBACK_MODEL: &str = "gpt-4o";
pub const ANTHROPIC_FALLBACK_MODEL: &str = "claude-3-5-sonnet-latest";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CymbiontConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub local: LocalConfig,
    /// Extra or overriding entries for the builtin rate-limit table.
    #[serde(default)]
    pub model_table: BTreeMap<String, ModelConfig>,
}

/// Model name per agent role.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_chat_model")]
    pub chat_agent: String,
    #[serde(default = "default_light_model")]
    pub tag_extraction: String,
    #[serde(default = "default_light_model")]
    pub progressive_summary: String,
    #[serde(default = "default_chat_model")]
    pub revision: String,
}

fn default_chat_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_light_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            chat_agent: default_chat_model(),
            tag_extraction: default_light_model(),
            progressive_summary: default_light_model(),
            revision: default_chat_model(),
        }
    }
}

impl ModelsConfig {
    pub fn roles(&self) -> [(&'static str, &str); 4] {
        [
            ("chat_agent", self.chat_agent.as_str()),
            ("tag_extraction", self.tag_extraction.as_str()),
            ("progressive_summary", self.progressive_summary.as_str()),
            ("revision", self.revision.as_str()),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u32,
    #[serde(default = "default_soft_limit_fraction")]
    pub soft_limit_fraction: f64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub strict: bool,
}

fn default_ticks_per_second() -> u32 {
    cy_queue::DEFAULT_TICKS_PER_SECOND
}

fn default_soft_limit_fraction() -> f64 {
    cy_queue::DEFAULT_SOFT_LIMIT_FRACTION
}

fn default_window_secs() -> u64 {
    cy_queue::DEFAULT_TOKEN_WINDOW.as_secs()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: default_ticks_per_second(),
            soft_limit_fraction: default_soft_limit_fraction(),
            window_secs: default_window_secs(),
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_local_base_url() -> String {
    DEFAULT_LOCAL_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: default_local_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl CymbiontConfig {
    /// Load from `path`, or from `~/.cymbiont/config.toml` when none is given.
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = var("CYMBIONT_LOCAL_BASE_URL") {
            self.local.base_url = v;
        }
        if let Some(v) = var("CYMBIONT_CHAT_MODEL") {
            self.models.chat_agent = v;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.queue_settings()
            .validate()
            .map_err(|e| anyhow::anyhow!("queue: {e}"))?;
        for (role, model) in self.models.roles() {
            if model.trim().is_empty() {
                return Err(anyhow::anyhow!("models.{role} is required"));
            }
        }
        if self.local.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("local.request_timeout_secs must be > 0"));
        }
        if self.local.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("local.base_url must not be empty"));
        }
        Ok(())
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            ticks_per_second: self.queue.ticks_per_second,
            soft_limit_fraction: self.queue.soft_limit_fraction,
            token_window: Duration::from_secs(self.queue.window_secs),
            strict: self.queue.strict,
        }
    }

    /// Builtin limits with `[model_table]` entries layered on top.
    pub fn model_table(&self) -> ModelTable {
        let mut table = ModelTable::builtin();
        for (name, config) in &self.model_table {
            table.insert(name.clone(), config.clone());
        }
        table
    }

    fn key_for(&self, provider: Provider) -> Option<&str> {
        let key = match provider {
            Provider::OpenAI => self.keys.openai_api_key.as_deref(),
            Provider::Anthropic => self.keys.anthropic_api_key.as_deref(),
            Provider::Local | Provider::Mock => return Some(""),
        };
        key.filter(|k| !k.trim().is_empty())
    }

    pub fn has_key(&self, provider: Provider) -> bool {
        self.key_for(provider).is_some()
    }

    /// The model to use for `model`: itself when its provider is usable,
    /// otherwise a hosted fallback for whichever key is present.
    pub fn resolve_model(&self, table: &ModelTable, model: &str) -> anyhow::Result<String> {
        let config = table
            .get(model)
            .ok_or_else(|| anyhow::anyhow!("model {model:?} is not in the model table"))?;
        if self.has_key(config.provider) {
            return Ok(model.to_string());
        }
        let fallback = if self.has_key(Provider::OpenAI) {
            OPENAI_FALLBACK_MODEL
        } else if self.has_key(Provider::Anthropic) {
            ANTHROPIC_FALLBACK_MODEL
        } else {
            return Err(anyhow::anyhow!(
                "no {} api key for model {model:?} and no fallback provider configured",
                config.provider
            ));
        };
        tracing::warn!(
            model,
            provider = %config.provider,
            fallback,
            "provider key missing; falling back"
        );
        Ok(fallback.to_string())
    }

    /// Resolved model per role.
    pub fn resolve_roles(&self, table: &ModelTable) -> anyhow::Result<Vec<(&'static str, String)>> {
        self.models
            .roles()
            .into_iter()
            .map(|(role, model)| {
                self.resolve_model(table, model)
                    .map(|resolved| (role, resolved))
                    .map_err(|e| anyhow::anyhow!("models.{role}: {e}"))
            })
            .collect()
    }

    /// Converters for every provider that can be reached with the current keys.
    pub fn converters(&self) -> ConverterSet {
        let http = http_client(Duration::from_secs(self.local.request_timeout_secs));
        let mut set = ConverterSet::new()
            .with(Arc::new(LocalModelConverter::new(http.clone(), &self.local.base_url)));
        if let Some(key) = self.key_for(Provider::OpenAI) {
            set.register(Arc::new(OpenAiConverter::new(http.clone(), key)));
        }
        if let Some(key) = self.key_for(Provider::Anthropic) {
            set.register(Arc::new(AnthropicConverter::new(http, key)));
        }
        set
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".cymbiont").join("config.toml")
}
