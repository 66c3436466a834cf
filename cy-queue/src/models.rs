//! Static per-model rate and token limits.

use crate::error::{QueueError, Result};
use cy_llm::Provider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Token throughput limits. OpenAI meters one combined budget; Anthropic meters
/// input and output separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TokenBudget {
    Combined {
        #[serde(rename = "total_tokens_per_minute")]
        tokens_per_minute: u64,
    },
    Split {
        input_tokens_per_minute: u64,
        output_tokens_per_minute: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawModelConfig")]
pub struct ModelConfig {
    pub provider: Provider,
    pub max_output_tokens: u32,
    pub requests_per_minute: u32,
    #[serde(flatten)]
    pub budget: TokenBudget,
}

impl ModelConfig {
    pub fn combined(
        provider: Provider,
        max_output_tokens: u32,
        requests_per_minute: u32,
        tokens_per_minute: u64,
    ) -> Self {
        Self {
            provider,
            max_output_tokens,
            requests_per_minute,
            budget: TokenBudget::Combined { tokens_per_minute },
        }
    }

    pub fn split(
        provider: Provider,
        max_output_tokens: u32,
        requests_per_minute: u32,
        input_tokens_per_minute: u64,
        output_tokens_per_minute: u64,
    ) -> Self {
        Self {
            provider,
            max_output_tokens,
            requests_per_minute,
            budget: TokenBudget::Split {
                input_tokens_per_minute,
                output_tokens_per_minute,
            },
        }
    }
}

/// Shape of a model entry in config files before its rate-limit fields are checked.
#[derive(Debug, Clone, Deserialize)]
pub struct RawModelConfig {
    pub provider: Provider,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub total_tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub input_tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub output_tokens_per_minute: Option<u64>,
}

impl TryFrom<RawModelConfig> for ModelConfig {
    type Error = QueueError;

    fn try_from(raw: RawModelConfig) -> Result<Self> {
        let requests_per_minute = match raw.requests_per_minute {
            Some(rpm) if rpm > 0 => rpm,
            Some(_) => {
                return Err(QueueError::Config(
                    "requests_per_minute must be > 0".to_string(),
                ));
            }
            None => {
                return Err(QueueError::Config(
                    "requests_per_minute is required".to_string(),
                ));
            }
        };
        if raw.max_output_tokens == 0 {
            return Err(QueueError::Config(
                "max_output_tokens must be > 0".to_string(),
            ));
        }

        let budget = match (
            raw.total_tokens_per_minute,
            raw.input_tokens_per_minute,
            raw.output_tokens_per_minute,
        ) {
            (Some(total), None, None) => TokenBudget::Combined {
                tokens_per_minute: total,
            },
            (None, Some(input), Some(output)) => TokenBudget::Split {
                input_tokens_per_minute: input,
                output_tokens_per_minute: output,
            },
            (Some(_), _, _) => {
                return Err(QueueError::Config(
                    "total_tokens_per_minute cannot be combined with input/output limits"
                        .to_string(),
                ));
            }
            _ => {
                return Err(QueueError::Config(
                    "either total_tokens_per_minute or both input_tokens_per_minute and output_tokens_per_minute are required"
                        .to_string(),
                ));
            }
        };

        let zero_limit = match budget {
            TokenBudget::Combined { tokens_per_minute } => tokens_per_minute == 0,
            TokenBudget::Split {
                input_tokens_per_minute,
                output_tokens_per_minute,
            } => input_tokens_per_minute == 0 || output_tokens_per_minute == 0,
        };
        if zero_limit {
            return Err(QueueError::Config(
                "token limits must be > 0".to_string(),
            ));
        }

        Ok(Self {
            provider: raw.provider,
            max_output_tokens: raw.max_output_tokens,
            requests_per_minute,
            budget,
        })
    }
}

/// Read-only lookup from model name to its limits.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    models: BTreeMap<String, ModelConfig>,
}

impl ModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tier-2 limits for the hosted models, plus a network-free model for dry runs.
    pub fn builtin() -> Self {
        Self::new()
            .with_model(
                "claude-3-5-sonnet-latest",
                ModelConfig::split(Provider::Anthropic, 200_000, 1000, 80_000, 16_000),
            )
            .with_model(
                "claude-3-5-haiku-latest",
                ModelConfig::split(Provider::Anthropic, 200_000, 1000, 100_000, 20_000),
            )
            .with_model(
                "gpt-4o",
                ModelConfig::combined(Provider::OpenAI, 16_384, 5000, 450_000),
            )
            .with_model(
                "gpt-4o-mini",
                ModelConfig::combined(Provider::OpenAI, 16_384, 5000, 2_000_000),
            )
            .with_model(
                "o1-preview",
                ModelConfig::combined(Provider::OpenAI, 16_384, 5000, 450_000),
            )
            .with_model(
                "mock-echo",
                ModelConfig::combined(Provider::Mock, 4096, 2700, 100_000),
            )
    }

    pub fn with_model(mut self, name: impl Into<String>, config: ModelConfig) -> Self {
        self.insert(name, config);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, config: ModelConfig) -> Option<ModelConfig> {
        self.models.insert(name.into(), config)
    }

    pub fn get(&self, model: &str) -> Option<&ModelConfig> {
        self.models.get(model)
    }

    pub fn require(&self, model: &str) -> Result<&ModelConfig> {
        self.get(model)
            .ok_or_else(|| QueueError::UnknownModel(model.to_string()))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModelConfig)> {
        self.models.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_uses_split_budgets_for_anthropic() {
        let table = ModelTable::builtin();
        let sonnet = table.require("claude-3-5-sonnet-latest").unwrap();
        assert_eq!(sonnet.provider, Provider::Anthropic);
        assert!(matches!(sonnet.budget, TokenBudget::Split { .. }));

        let mini = table.require("gpt-4o-mini").unwrap();
        assert_eq!(
            mini.budget,
            TokenBudget::Combined {
                tokens_per_minute: 2_000_000
            }
        );
    }

    #[test]
    fn unknown_model_is_reported_by_name() {
        let err = ModelTable::builtin().require("nonexistent-model").unwrap_err();
        assert!(matches!(err, QueueError::UnknownModel(ref m) if m == "nonexistent-model"));
    }

    #[test]
    fn config_entries_parse_from_toml() {
        let table: BTreeMap<String, ModelConfig> = toml::from_str(
            r#"
            [llama-3]
            provider = "local"
            max_output_tokens = 2048
            requests_per_minute = 60
            total_tokens_per_minute = 40000

            [claude-next]
            provider = "anthropic"
            max_output_tokens = 8192
            requests_per_minute = 50
            input_tokens_per_minute = 40000
            output_tokens_per_minute = 8000
            "#,
        )
        .unwrap();
        assert_eq!(table["llama-3"].provider, Provider::Local);
        assert_eq!(
            table["claude-next"].budget,
            TokenBudget::Split {
                input_tokens_per_minute: 40_000,
                output_tokens_per_minute: 8_000
            }
        );
    }

    #[test]
    fn missing_rate_limit_fields_are_rejected() {
        let missing_rpm: std::result::Result<ModelConfig, _> = toml::from_str(
            "provider = \"openai\"\nmax_output_tokens = 10\ntotal_tokens_per_minute = 5",
        );
        assert!(missing_rpm.unwrap_err().to_string().contains("requests_per_minute"));

        let half_split: std::result::Result<ModelConfig, _> = toml::from_str(
            "provider = \"anthropic\"\nmax_output_tokens = 10\nrequests_per_minute = 5\ninput_tokens_per_minute = 5",
        );
        assert!(half_split.is_err());

        let zero: std::result::Result<ModelConfig, _> = toml::from_str(
            "provider = \"openai\"\nmax_output_tokens = 10\nrequests_per_minute = 5\ntotal_tokens_per_minute = 0",
        );
        assert!(zero.is_err());
    }
}
