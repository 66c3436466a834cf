//! Public face of the dispatch queue.
//!
//! Callers only ever enqueue, await handles, and inspect emptiness; the
//! pending FIFO and token history are owned by the scheduler/executor pair.

use crate::error::{QueueError, Result};
use crate::executor::{CallAttempt, CallRequest};
use crate::handle::{ResultHandle, ResultSlot};
use crate::ledger::ModelUsage;
use crate::models::ModelTable;
use crate::scheduler::{self, QueueSettings, SchedulerState};
use chrono::Utc;
use cy_llm::{ChatRequest, MockConverter, MockSpec, Provider, ProviderConverter};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Converters keyed by provider. The mock provider is always present.
#[derive(Clone)]
pub struct ConverterSet {
    by_provider: HashMap<Provider, Arc<dyn ProviderConverter>>,
}

impl Default for ConverterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ConverterSet {
    pub fn new() -> Self {
        let mut by_provider: HashMap<Provider, Arc<dyn ProviderConverter>> = HashMap::new();
        by_provider.insert(Provider::Mock, Arc::new(MockConverter::default()));
        Self { by_provider }
    }

    pub fn with(mut self, converter: Arc<dyn ProviderConverter>) -> Self {
        self.register(converter);
        self
    }

    pub fn register(&mut self, converter: Arc<dyn ProviderConverter>) {
        self.by_provider.insert(converter.provider(), converter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderConverter>> {
        self.by_provider.get(&provider).cloned()
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut out: Vec<Provider> = self.by_provider.keys().copied().collect();
        out.sort_by_key(|p| p.as_str());
        out
    }
}

pub(crate) struct Shared {
    pub models: ModelTable,
    pub converters: ConverterSet,
    pub settings: QueueSettings,
    pub state: Mutex<SchedulerState>,
}

impl Shared {
    pub(crate) fn converter_for(&self, model: &str) -> Result<Arc<dyn ProviderConverter>> {
        let config = self.models.require(model)?;
        self.converters.get(config.provider).ok_or_else(|| {
            QueueError::Config(format!(
                "no {} converter registered for model {model}",
                config.provider
            ))
        })
    }
}

struct Runner {
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

pub struct ApiQueue {
    shared: Arc<Shared>,
    runner: Mutex<Option<Runner>>,
}

impl ApiQueue {
    pub fn new(models: ModelTable, converters: ConverterSet, settings: QueueSettings) -> Result<Self> {
        settings.validate()?;
        let state = SchedulerState::new(&settings);
        Ok(Self {
            shared: Arc::new(Shared {
                models,
                converters,
                settings,
                state: Mutex::new(state),
            }),
            runner: Mutex::new(None),
        })
    }

    pub fn models(&self) -> &ModelTable {
        &self.shared.models
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.shared.settings
    }

    /// Spawn the scheduler loop. No-op if it is already running.
    pub async fn start(&self) {
        let mut runner = self.runner.lock().await;
        if runner.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler::run_scheduler(
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));
        *runner = Some(Runner { shutdown, task });
        tracing::info!(
            ticks_per_second = self.shared.settings.ticks_per_second,
            models = self.shared.models.len(),
            "api queue started"
        );
    }

    /// Stop the scheduler loop and wait for it to exit. No-op if not running.
    ///
    /// In-flight calls finish normally. Calls still pending stay queued and
    /// are picked up again by a later [`Self::start`]; dropping the queue
    /// resolves them with [`QueueError::Abandoned`].
    pub async fn stop(&self) -> Result<()> {
        let Some(runner) = self.runner.lock().await.take() else {
            return Ok(());
        };
        runner.shutdown.cancel();
        let outcome = match runner.task.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => Ok(()),
            Err(error) => Err(QueueError::Scheduler(format!("scheduler task panicked: {error}"))),
        };
        tracing::info!(pending = self.pending_len().await, "api queue stopped");
        outcome
    }

    pub async fn is_running(&self) -> bool {
        self.runner
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Queue a provider call. Fails fast on unknown models or a missing converter.
    pub async fn enqueue(&self, model: &str, payload: ChatRequest) -> Result<ResultHandle> {
        self.shared.converter_for(model)?;
        self.push(model, payload, None).await
    }

    /// Queue a call that is answered by the mock converter instead of the network.
    pub async fn enqueue_mock(
        &self,
        model: &str,
        payload: ChatRequest,
        mock: MockSpec,
    ) -> Result<ResultHandle> {
        self.push(model, payload, Some(mock)).await
    }

    async fn push(
        &self,
        model: &str,
        mut payload: ChatRequest,
        mock: Option<MockSpec>,
    ) -> Result<ResultHandle> {
        let config = self.shared.models.require(model)?;
        match payload.max_output_tokens {
            None => payload.max_output_tokens = Some(config.max_output_tokens),
            Some(requested) if requested > config.max_output_tokens => {
                tracing::warn!(
                    model,
                    requested,
                    ceiling = config.max_output_tokens,
                    "max_output_tokens above model ceiling; clamping"
                );
                payload.max_output_tokens = Some(config.max_output_tokens);
            }
            Some(_) => {}
        }

        let id = Uuid::new_v4();
        let (slot, handle) = ResultSlot::new(id);
        let call = Arc::new(CallRequest {
            id,
            model: model.to_string(),
            payload,
            mock,
            enqueued_at: Utc::now(),
            slot,
        });
        self.shared
            .state
            .lock()
            .await
            .pending
            .push_back(CallAttempt::first(call));
        tracing::debug!(call_id = %id, model, "call enqueued");
        Ok(handle)
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.state.lock().await.pending.is_empty()
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.state.lock().await.pending.len()
    }

    /// Forget all recorded token usage, windowed and cumulative.
    pub async fn clear_token_history(&self) {
        let mut state = self.shared.state.lock().await;
        state.history.clear();
        state.ledger.clear();
    }

    pub async fn usage_totals(&self) -> BTreeMap<String, ModelUsage> {
        self.shared.state.lock().await.ledger.snapshot()
    }

    /// Run one scheduling pass immediately, outside the timer.
    pub async fn tick_now(&self) -> Result<usize> {
        scheduler::tick(&self.shared).await
    }
}

impl Drop for ApiQueue {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.get_mut().as_ref() {
            runner.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        SPLIT_MODEL, ScriptedConverter, TEST_MODEL, request, resolved, test_queue, test_table,
    };
    use std::time::Duration;

    fn light() -> MockSpec {
        MockSpec::echo().with_tokens(1, 1)
    }

    #[tokio::test(start_paused = true)]
    async fn ten_calls_drain_three_per_tick_in_fifo_order() {
        let queue = test_queue(ConverterSet::new());
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(queue.enqueue_mock(TEST_MODEL, request(i), light()).await.unwrap());
        }
        assert_eq!(queue.pending_len().await, 10);

        let tick = queue.settings().tick_interval();
        queue.start().await;
        tokio::time::sleep(tick / 2).await;

        assert_eq!(resolved(&mut handles), 3);
        assert!(handles[..3].iter_mut().all(|h| h.is_resolved()));
        assert_eq!(queue.pending_len().await, 7);

        tokio::time::sleep(tick * 3).await;
        assert_eq!(resolved(&mut handles), 10);
        assert!(queue.is_empty().await);

        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap();
            assert_eq!(response.content, format!("Test message {i}"));
        }
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn per_tick_releases_never_exceed_rpm_share() {
        let queue = test_queue(ConverterSet::new());
        let mut handles = Vec::new();
        for i in 0..30 {
            handles.push(queue.enqueue_mock(TEST_MODEL, request(i), light()).await.unwrap());
        }
        let tick = queue.settings().tick_interval();
        queue.start().await;
        tokio::time::sleep(tick / 2).await;
        for n in 1..=10 {
            assert_eq!(resolved(&mut handles), 3 * n);
            tokio::time::sleep(tick).await;
        }
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn token_pressure_holds_calls_until_window_ages_out() {
        let queue = test_queue(ConverterSet::new());
        let tick = queue.settings().tick_interval();
        let heavy = queue
            .enqueue_mock(TEST_MODEL, request(0), MockSpec::echo().with_tokens(110_000, 0))
            .await
            .unwrap();
        queue.start().await;
        tokio::time::sleep(tick / 2).await;
        heavy.await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=3 {
            handles.push(queue.enqueue_mock(TEST_MODEL, request(i), light()).await.unwrap());
        }
        tokio::time::sleep(tick * 5).await;
        assert_eq!(resolved(&mut handles), 0);
        assert_eq!(queue.pending_len().await, 3);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(resolved(&mut handles), 3);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn soft_limit_shrinks_batches() {
        let queue = test_queue(ConverterSet::new());
        let tick = queue.settings().tick_interval();
        // 82.5% of the 100k budget: factor 0.7, so floor(3 * 0.7) = 2 per tick.
        let heavy = queue
            .enqueue_mock(TEST_MODEL, request(0), MockSpec::echo().with_tokens(82_500, 0))
            .await
            .unwrap();
        queue.start().await;
        tokio::time::sleep(tick / 2).await;
        heavy.await.unwrap();

        let mut handles = Vec::new();
        for i in 1..=6 {
            handles.push(
                queue
                    .enqueue_mock(TEST_MODEL, request(i), MockSpec::echo().with_tokens(1, 0))
                    .await
                    .unwrap(),
            );
        }
        tokio::time::sleep(tick).await;
        assert_eq!(resolved(&mut handles), 2);
        tokio::time::sleep(tick).await;
        assert_eq!(resolved(&mut handles), 4);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_output_budget_blocks_split_model() {
        let queue = test_queue(ConverterSet::new());
        let tick = queue.settings().tick_interval();
        let heavy = queue
            .enqueue_mock(SPLIT_MODEL, request(0), MockSpec::echo().with_tokens(10, 10_000))
            .await
            .unwrap();
        queue.start().await;
        tokio::time::sleep(tick / 2).await;
        heavy.await.unwrap();

        let mut blocked = queue.enqueue_mock(SPLIT_MODEL, request(1), light()).await.unwrap();
        let mut other = queue.enqueue_mock(TEST_MODEL, request(2), light()).await.unwrap();
        tokio::time::sleep(tick * 3).await;
        assert!(!blocked.is_resolved());
        assert!(other.is_resolved());
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_without_queueing() {
        let queue = test_queue(ConverterSet::new());
        let err = queue
            .enqueue("nonexistent-model", request(0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownModel(ref m) if m == "nonexistent-model"));
        let err = queue
            .enqueue_mock("nonexistent-model", request(0), MockSpec::echo())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownModel(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn provider_call_without_converter_is_config_error() {
        let queue = test_queue(ConverterSet::new());
        let err = queue.enqueue(TEST_MODEL, request(0)).await.unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn max_output_tokens_defaults_and_clamps_to_model_ceiling() {
        let scripted = Arc::new(ScriptedConverter::succeeding());
        let queue = test_queue(ConverterSet::new().with(scripted.clone()));
        let a = queue.enqueue(TEST_MODEL, request(0)).await.unwrap();
        let b = queue
            .enqueue(TEST_MODEL, request(1).with_max_output_tokens(50_000))
            .await
            .unwrap();
        let c = queue
            .enqueue(TEST_MODEL, request(2).with_max_output_tokens(256))
            .await
            .unwrap();
        queue.start().await;
        for handle in [a, b, c] {
            handle.await.unwrap();
        }
        let mut seen = scripted.max_tokens_seen();
        seen.sort();
        assert_eq!(seen, vec![Some(256), Some(1024), Some(1024)]);
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent_and_resume_pending() {
        let queue = test_queue(ConverterSet::new());
        queue.stop().await.unwrap();
        queue.start().await;
        queue.start().await;
        assert!(queue.is_running().await);
        queue.stop().await.unwrap();
        queue.stop().await.unwrap();
        assert!(!queue.is_running().await);

        let handle = queue.enqueue_mock(TEST_MODEL, request(0), light()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.pending_len().await, 1);

        queue.start().await;
        assert_eq!(handle.await.unwrap().content, "Test message 0");
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_queue_abandons_pending_handles() {
        let queue = test_queue(ConverterSet::new());
        let handle = queue.enqueue_mock(TEST_MODEL, request(0), light()).await.unwrap();
        drop(queue);
        assert!(matches!(handle.await, Err(QueueError::Abandoned)));
    }

    #[tokio::test]
    async fn tick_now_dispatches_without_the_loop() {
        let queue = test_queue(ConverterSet::new());
        let handle = queue.enqueue_mock(TEST_MODEL, request(7), light()).await.unwrap();
        assert_eq!(queue.tick_now().await.unwrap(), 1);
        assert_eq!(handle.await.unwrap().content, "Test message 7");
        assert!(queue.is_empty().await);
    }

    async fn inject_unroutable(queue: &ApiQueue) -> ResultHandle {
        let id = Uuid::new_v4();
        let (slot, handle) = ResultSlot::new(id);
        let call = Arc::new(CallRequest {
            id,
            model: "ghost-model".to_string(),
            payload: request(0),
            mock: None,
            enqueued_at: Utc::now(),
            slot,
        });
        queue
            .shared
            .state
            .lock()
            .await
            .pending
            .push_back(CallAttempt::first(call));
        handle
    }

    #[tokio::test]
    async fn unroutable_call_fails_the_tick_and_its_handle() {
        let queue = test_queue(ConverterSet::new());
        let handle = inject_unroutable(&queue).await;
        let err = queue.tick_now().await.unwrap_err();
        assert!(matches!(err, QueueError::Scheduler(_)));
        assert!(matches!(handle.await, Err(QueueError::UnknownModel(_))));
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn strict_loop_stops_on_scheduler_error() {
        let settings = QueueSettings {
            strict: true,
            ..QueueSettings::default()
        };
        let queue = ApiQueue::new(test_table(), ConverterSet::new(), settings).unwrap();
        let _handle = inject_unroutable(&queue).await;
        queue.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!queue.is_running().await);
        assert!(matches!(queue.stop().await, Err(QueueError::Scheduler(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn lenient_loop_survives_scheduler_error() {
        let queue = test_queue(ConverterSet::new());
        let _ghost = inject_unroutable(&queue).await;
        queue.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_running().await);

        let handle = queue.enqueue_mock(TEST_MODEL, request(1), light()).await.unwrap();
        assert!(handle.await.is_ok());
        queue.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_history_lifts_token_pressure() {
        let queue = test_queue(ConverterSet::new());
        let tick = queue.settings().tick_interval();
        let heavy = queue
            .enqueue_mock(TEST_MODEL, request(0), MockSpec::echo().with_tokens(110_000, 0))
            .await
            .unwrap();
        queue.start().await;
        heavy.await.unwrap();
        assert_eq!(queue.usage_totals().await[TEST_MODEL].calls, 1);

        let mut waiting = queue.enqueue_mock(TEST_MODEL, request(1), light()).await.unwrap();
        tokio::time::sleep(tick * 3).await;
        assert!(!waiting.is_resolved());

        queue.clear_token_history().await;
        assert!(queue.usage_totals().await.is_empty());
        tokio::time::sleep(tick * 2).await;
        assert!(waiting.is_resolved());
        queue.stop().await.unwrap();
    }

    #[test]
    fn mock_converter_is_always_registered() {
        let set = ConverterSet::new();
        assert_eq!(set.providers(), vec![Provider::Mock]);
        let set = set.with(Arc::new(ScriptedConverter::succeeding()));
        assert!(set.get(Provider::Local).is_some());
    }
}
