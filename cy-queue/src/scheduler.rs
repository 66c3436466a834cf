//! Fixed-tick batch release with RPM quotas and soft-limit token easing.
//!
//! Every tick the scheduler prunes token history, walks the pending FIFO,
//! and releases up to `floor(base_batch_limit * factor)` calls per model,
//! where `factor` drops linearly from 1 at the soft limit to 0 at the hard
//! limit of the model's tokens-per-minute budget.

use crate::error::{QueueError, Result};
use crate::executor::{self, CallAttempt};
use crate::history::{DEFAULT_TOKEN_WINDOW, TokenHistory, TokenTotals};
use crate::ledger::UsageLedger;
use crate::models::{ModelConfig, ModelTable, TokenBudget};
use crate::queue::Shared;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICKS_PER_SECOND: u32 = 15;
pub const DEFAULT_SOFT_LIMIT_FRACTION: f64 = 0.75;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub ticks_per_second: u32,
    /// Share of a token budget at which admission starts easing off.
    pub soft_limit_fraction: f64,
    pub token_window: Duration,
    /// Stop the scheduler on a tick error instead of logging and carrying on.
    pub strict: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            soft_limit_fraction: DEFAULT_SOFT_LIMIT_FRACTION,
            token_window: DEFAULT_TOKEN_WINDOW,
            strict: false,
        }
    }
}

impl QueueSettings {
    pub fn validate(&self) -> Result<()> {
        if self.ticks_per_second == 0 {
            return Err(QueueError::Config("ticks_per_second must be > 0".to_string()));
        }
        if self.tick_interval().is_zero() {
            return Err(QueueError::Config(format!(
                "ticks_per_second={} leaves no time between ticks",
                self.ticks_per_second
            )));
        }
        if !(0.0..1.0).contains(&self.soft_limit_fraction) {
            return Err(QueueError::Config(
                "soft_limit_fraction must be in [0, 1)".to_string(),
            ));
        }
        if self.token_window.is_zero() {
            return Err(QueueError::Config("token window must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.ticks_per_second.max(1)
    }

    pub fn ticks_per_minute(&self) -> u32 {
        self.ticks_per_second.saturating_mul(60)
    }
}

/// Requests-per-minute spread evenly over the ticks in a minute.
pub fn base_batch_limit(requests_per_minute: u32, settings: &QueueSettings) -> usize {
    (requests_per_minute / settings.ticks_per_minute().max(1)) as usize
}

/// 1.0 below the soft limit, falling linearly to 0.0 at `limit`.
pub fn interpolation_factor(tokens_per_minute: f64, limit: f64, soft_limit_fraction: f64) -> f64 {
    let soft = limit * soft_limit_fraction;
    if tokens_per_minute <= soft {
        return 1.0;
    }
    let span = limit - soft;
    if span <= 0.0 {
        return 0.0;
    }
    (1.0 - (tokens_per_minute - soft) / span).clamp(0.0, 1.0)
}

/// Combined budgets use total tokens; split budgets take the tighter of input and output.
pub fn budget_factor(
    budget: &TokenBudget,
    totals: &TokenTotals,
    per_minute_scale: f64,
    soft_limit_fraction: f64,
) -> f64 {
    let rate = |tokens: u64| tokens as f64 * per_minute_scale;
    match *budget {
        TokenBudget::Combined { tokens_per_minute } => interpolation_factor(
            rate(totals.total_tokens),
            tokens_per_minute as f64,
            soft_limit_fraction,
        ),
        TokenBudget::Split {
            input_tokens_per_minute,
            output_tokens_per_minute,
        } => {
            let input = interpolation_factor(
                rate(totals.input_tokens),
                input_tokens_per_minute as f64,
                soft_limit_fraction,
            );
            let output = interpolation_factor(
                rate(totals.output_tokens),
                output_tokens_per_minute as f64,
                soft_limit_fraction,
            );
            input.min(output)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub base_batch_limit: usize,
    /// Estimated total tokens per minute over the current window.
    pub tokens_per_minute: f64,
    pub factor: f64,
    pub allowed: usize,
}

pub fn admission(
    config: &ModelConfig,
    totals: &TokenTotals,
    per_minute_scale: f64,
    settings: &QueueSettings,
) -> Admission {
    let base = base_batch_limit(config.requests_per_minute, settings);
    let factor = budget_factor(
        &config.budget,
        totals,
        per_minute_scale,
        settings.soft_limit_fraction,
    );
    Admission {
        base_batch_limit: base,
        tokens_per_minute: totals.total_tokens as f64 * per_minute_scale,
        factor,
        allowed: (base as f64 * factor).floor() as usize,
    }
}

/// Mutable state shared by the scheduler and executor, always behind one lock.
#[derive(Debug)]
pub(crate) struct SchedulerState {
    pub pending: VecDeque<CallAttempt>,
    pub history: TokenHistory,
    pub ledger: UsageLedger,
}

impl SchedulerState {
    pub(crate) fn new(settings: &QueueSettings) -> Self {
        Self {
            pending: VecDeque::new(),
            history: TokenHistory::new(settings.token_window),
            ledger: UsageLedger::default(),
        }
    }

    /// Split the pending FIFO into calls released this tick and calls that
    /// cannot be scheduled at all. Everything else stays queued in order.
    pub(crate) fn select_batch(
        &mut self,
        now: Instant,
        models: &ModelTable,
        settings: &QueueSettings,
    ) -> TickSelection {
        self.history.prune_all(now);
        let scale = self.history.per_minute_scale();

        let mut quotas: HashMap<String, Option<Admission>> = HashMap::new();
        let mut selection = TickSelection::default();
        let mut kept = VecDeque::with_capacity(self.pending.len());

        for attempt in self.pending.drain(..) {
            let history = &self.history;
            let quota = quotas
                .entry(attempt.call.model.clone())
                .or_insert_with(|| {
                    models.get(&attempt.call.model).map(|config| {
                        admission(config, &history.aggregate(&attempt.call.model), scale, settings)
                    })
                });
            match quota {
                None => selection.unschedulable.push(attempt),
                Some(left) if left.allowed > 0 => {
                    left.allowed -= 1;
                    selection.released.push(attempt);
                }
                Some(_) => kept.push_back(attempt),
            }
        }
        self.pending = kept;

        for (model, quota) in quotas {
            let Some(quota) = quota else { continue };
            let released = selection
                .released
                .iter()
                .filter(|a| a.call.model == model)
                .count();
            if released > 0 || quota.factor < 1.0 {
                selection.models.push(ModelTick {
                    model,
                    released,
                    base_batch_limit: quota.base_batch_limit,
                    tokens_per_minute: quota.tokens_per_minute,
                    factor: quota.factor,
                });
            }
        }
        selection
    }
}

#[derive(Debug, Default)]
pub(crate) struct TickSelection {
    pub released: Vec<CallAttempt>,
    pub unschedulable: Vec<CallAttempt>,
    pub models: Vec<ModelTick>,
}

#[derive(Debug)]
pub(crate) struct ModelTick {
    pub model: String,
    pub released: usize,
    pub base_batch_limit: usize,
    pub tokens_per_minute: f64,
    pub factor: f64,
}

/// One scheduling pass. Returns how many calls were dispatched.
pub(crate) async fn tick(shared: &Arc<Shared>) -> Result<usize> {
    let selection = {
        let mut state = shared.state.lock().await;
        state.select_batch(Instant::now(), &shared.models, &shared.settings)
    };

    for m in &selection.models {
        tracing::debug!(
            model = %m.model,
            released = m.released,
            base_batch_limit = m.base_batch_limit,
            tokens_per_minute = m.tokens_per_minute,
            factor = m.factor,
            "tick admission"
        );
    }

    let dispatched = selection.released.len();
    for attempt in selection.released {
        tokio::spawn(executor::execute(Arc::clone(shared), attempt));
    }

    let Some(first) = selection.unschedulable.first() else {
        return Ok(dispatched);
    };
    let error = QueueError::Scheduler(format!(
        "{} pending call(s) reference model {:?} missing from the model table",
        selection.unschedulable.len(),
        first.call.model
    ));
    for attempt in &selection.unschedulable {
        attempt
            .call
            .slot
            .resolve(Err(QueueError::UnknownModel(attempt.call.model.clone())));
    }
    Err(error)
}

pub(crate) async fn run_scheduler(
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(shared.settings.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                if let Err(error) = tick(&shared).await {
                    tracing::error!(%error, "scheduler tick failed");
                    if shared.settings.strict {
                        return Err(error);
                    }
                }
            }
        }
    }
}
