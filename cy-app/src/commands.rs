//! Subcommand bodies for the `cymbiont` binary.

use crate::config::CymbiontConfig;
use cy_llm::{ChatMessage, ChatRequest, MockSpec, Provider};
use cy_queue::{ApiQueue, TokenBudget, base_batch_limit};
use std::path::Path;

pub fn models(cfg: &CymbiontConfig) -> anyhow::Result<()> {
    let table = cfg.model_table();
    println!(
        "{:<28} {:<10} {:>6} {:>8}  tokens/min",
        "model", "provider", "rpm", "max_out"
    );
    for (name, config) in table.iter() {
        println!(
            "{:<28} {:<10} {:>6} {:>8}  {}",
            name,
            config.provider.as_str(),
            config.requests_per_minute,
            config.max_output_tokens,
            describe_budget(&config.budget)
        );
    }
    Ok(())
}

fn describe_budget(budget: &TokenBudget) -> String {
    match budget {
        TokenBudget::Combined { tokens_per_minute } => format!("{tokens_per_minute} total"),
        TokenBudget::Split {
            input_tokens_per_minute,
            output_tokens_per_minute,
        } => format!("{input_tokens_per_minute} in / {output_tokens_per_minute} out"),
    }
}

pub async fn ask(
    cfg: &CymbiontConfig,
    prompt: &str,
    model: Option<&str>,
    system: Option<String>,
    mock: bool,
) -> anyhow::Result<()> {
    let table = cfg.model_table();
    let model = match model {
        Some(model) => model.to_string(),
        None if mock => cfg.models.chat_agent.clone(),
        None => cfg.resolve_model(&table, &cfg.models.chat_agent)?,
    };

    let queue = ApiQueue::new(table, cfg.converters(), cfg.queue_settings())?;
    let mut request = ChatRequest::new(vec![ChatMessage::user(prompt)]);
    if let Some(system) = system {
        request = request.with_system(system);
    }

    let handle = if mock {
        queue.enqueue_mock(&model, request, MockSpec::echo()).await?
    } else {
        queue.enqueue(&model, request).await?
    };
    queue.start().await;
    let outcome = handle.await;
    queue.stop().await?;

    let response = outcome?;
    tracing::info!(
        model = %model,
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        "ask complete"
    );
    println!("{}", response.content);
    Ok(())
}

pub async fn burst(cfg: &CymbiontConfig, model: &str, count: usize) -> anyhow::Result<()> {
    let queue = ApiQueue::new(cfg.model_table(), cfg.converters(), cfg.queue_settings())?;
    let config = queue.models().require(model)?;
    let per_tick = base_batch_limit(config.requests_per_minute, queue.settings());
    if per_tick == 0 {
        return Err(anyhow::anyhow!(
            "{model} allows {} rpm, which is less than one call per tick at {} ticks/s",
            config.requests_per_minute,
            queue.settings().ticks_per_second
        ));
    }
    let tick = queue.settings().tick_interval();
    println!("model={model} count={count} base_batch_limit={per_tick} tick={tick:?}");

    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let request = ChatRequest::new(vec![ChatMessage::user(format!("burst call {i}"))]);
        handles.push(queue.enqueue_mock(model, request, MockSpec::echo()).await?);
    }

    queue.start().await;
    tokio::time::sleep(tick / 2).await;
    let mut resolved = 0;
    let mut ticks = 0usize;
    loop {
        let now = handles.iter_mut().map(|h| h.is_resolved()).filter(|r| *r).count();
        println!(
            "tick {ticks:>4}: +{:<4} resolved={now:<6} pending={}",
            now - resolved,
            queue.pending_len().await
        );
        resolved = now;
        ticks += 1;
        if resolved == count {
            break;
        }
        if !queue.is_running().await {
            break;
        }
        tokio::time::sleep(tick).await;
    }
    queue.stop().await?;

    let outcomes = futures_util::future::join_all(handles).await;
    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    let usage = queue.usage_totals().await;
    let total_tokens = usage.get(model).map_or(0, |u| u.total_tokens);
    println!("done: ticks={ticks} ok={} failed={failed} total_tokens={total_tokens}", count - failed);
    Ok(())
}

pub fn doctor(cfg: &CymbiontConfig, path: &Path) -> anyhow::Result<()> {
    let table = cfg.model_table();
    println!("config: {}", path.display());
    for provider in [Provider::OpenAI, Provider::Anthropic] {
        let status = if cfg.has_key(provider) { "key present" } else { "no key" };
        println!("{provider}: {status}");
    }
    println!("local: {}", cfg.local.base_url);
    println!(
        "queue: ticks_per_second={} soft_limit_fraction={} window_secs={} strict={}",
        cfg.queue.ticks_per_second,
        cfg.queue.soft_limit_fraction,
        cfg.queue.window_secs,
        cfg.queue.strict
    );
    for name in cfg.model_table.keys() {
        println!("model_table override: {name}");
    }

    let roles = cfg.resolve_roles(&table)?;
    for (role, model) in &roles {
        println!("{role}: {model}");
    }
    tracing::info!(
        config_path = %path.display(),
        models = table.len(),
        "config ok"
    );
    Ok(())
}
