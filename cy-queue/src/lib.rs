//! Rate-limited dispatch queue for LLM calls.
//!
//! Every outbound completion goes through [`ApiQueue`]: calls wait in a FIFO,
//! a fixed-tick scheduler releases per-model batches sized by requests-per-minute
//! and eased by recent token usage, and failed calls are re-queued a bounded
//! number of times before their handle resolves with an error.

mod error;
mod executor;
mod handle;
mod history;
mod ledger;
mod models;
mod queue;
mod scheduler;
#[cfg(test)]
mod testing;

pub use error::{QueueError, Result};
pub use executor::{CallAttempt, CallRequest, MAX_ATTEMPTS};
pub use handle::{CallOutcome, ResultHandle};
pub use history::{DEFAULT_TOKEN_WINDOW, TokenHistory, TokenTotals, TokenUsageSample};
pub use ledger::{ModelUsage, UsageLedger};
pub use models::{ModelConfig, ModelTable, RawModelConfig, TokenBudget};
pub use queue::{ApiQueue, ConverterSet};
pub use scheduler::{
    Admission, DEFAULT_SOFT_LIMIT_FRACTION, DEFAULT_TICKS_PER_SECOND, QueueSettings, admission,
    base_batch_limit, budget_factor, interpolation_factor,
};
