//! Cumulative token accounting since process start (or the last reset).

use cy_llm::Usage;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl ModelUsage {
    fn add(&mut self, usage: &Usage) {
        self.calls += 1;
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.total_tokens += u64::from(usage.total_tokens);
    }
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    by_model: BTreeMap<String, ModelUsage>,
}

impl UsageLedger {
    pub fn record(&mut self, model: &str, usage: &Usage) {
        self.by_model.entry(model.to_string()).or_default().add(usage);
    }

    pub fn snapshot(&self) -> BTreeMap<String, ModelUsage> {
        self.by_model.clone()
    }

    pub fn total(&self) -> ModelUsage {
        self.by_model
            .values()
            .fold(ModelUsage::default(), |acc, u| ModelUsage {
                calls: acc.calls + u.calls,
                prompt_tokens: acc.prompt_tokens + u.prompt_tokens,
                completion_tokens: acc.completion_tokens + u.completion_tokens,
                total_tokens: acc.total_tokens + u.total_tokens,
            })
    }

    pub fn clear(&mut self) {
        self.by_model.clear();
    }
}
