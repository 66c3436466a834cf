//! Rolling per-model token usage used to estimate current tokens-per-minute.

use cy_llm::Usage;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TOKEN_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsageSample {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub timestamp: Instant,
}

impl TokenUsageSample {
    pub fn from_usage(usage: &Usage, timestamp: Instant) -> Self {
        Self {
            input_tokens: u64::from(usage.prompt_tokens),
            output_tokens: u64::from(usage.completion_tokens),
            total_tokens: u64::from(usage.total_tokens),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug)]
pub struct TokenHistory {
    window: Duration,
    samples: HashMap<String, VecDeque<TokenUsageSample>>,
}

impl Default for TokenHistory {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_WINDOW)
    }
}

impl TokenHistory {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Multiplier turning a windowed sum into a per-minute rate.
    pub fn per_minute_scale(&self) -> f64 {
        60.0 / self.window.as_secs_f64()
    }

    pub fn record(&mut self, model: &str, sample: TokenUsageSample) {
        self.samples
            .entry(model.to_string())
            .or_default()
            .push_back(sample);
    }

    /// Drop samples older than the window. Must run before [`Self::aggregate`]
    /// in the same tick.
    pub fn prune(&mut self, model: &str, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        if let Some(samples) = self.samples.get_mut(model) {
            samples.retain(|s| s.timestamp >= cutoff);
            if samples.is_empty() {
                self.samples.remove(model);
            }
        }
    }

    pub fn prune_all(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        self.samples.retain(|_, samples| {
            samples.retain(|s| s.timestamp >= cutoff);
            !samples.is_empty()
        });
    }

    pub fn aggregate(&self, model: &str) -> TokenTotals {
        let Some(samples) = self.samples.get(model) else {
            return TokenTotals::default();
        };
        samples.iter().fold(TokenTotals::default(), |acc, s| TokenTotals {
            input_tokens: acc.input_tokens.saturating_add(s.input_tokens),
            output_tokens: acc.output_tokens.saturating_add(s.output_tokens),
            total_tokens: acc.total_tokens.saturating_add(s.total_tokens),
        })
    }

    pub fn sample_count(&self, model: &str) -> usize {
        self.samples.get(model).map(VecDeque::len).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
