//! `cymbiont`: inspect the model table and push calls through the dispatch queue.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cymbiont", version, about = "Rate-limited LLM dispatch queue")]
struct Cli {
    /// Config file (default: ~/.cymbiont/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the per-model rate and token limits.
    Models,
    /// Send one prompt through the queue and print the reply.
    Ask {
        prompt: String,
        /// Defaults to the configured chat_agent model.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system: Option<String>,
        /// Answer with the echo mock instead of calling the provider.
        #[arg(long)]
        mock: bool,
    },
    /// Enqueue a burst of mock calls and report releases per tick.
    Burst {
        #[arg(long, default_value = "mock-echo")]
        model: String,
        #[arg(long, default_value_t = 30)]
        count: usize,
    },
    /// Validate config and report which providers are reachable.
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let (cfg, path) = config::CymbiontConfig::load_with_path(cli.config).await?;

    match cli.command {
        Command::Models => commands::models(&cfg),
        Command::Ask {
            prompt,
            model,
            system,
            mock,
        } => commands::ask(&cfg, &prompt, model.as_deref(), system, mock).await,
        Command::Burst { model, count } => commands::burst(&cfg, &model, count).await,
        Command::Doctor => commands::doctor(&cfg, &path),
    }
}

const DEFAULT_LOG_FILTER: &str = "info,cymbiont=debug,cy_app=debug,cy_queue=debug,cy_llm=debug";

/// Shape of log lines on stderr, from `CYMBIONT_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> anyhow::Result<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("compact") => Ok(Self::Compact),
            Some("json") => Ok(Self::Json),
            Some(other) => Err(anyhow::anyhow!(
                "unsupported CYMBIONT_LOG_FORMAT={other:?}; expected json or compact"
            )),
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let format = LogFormat::parse(std::env::var("CYMBIONT_LOG_FORMAT").ok().as_deref())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init(),
    }
    tracing::debug!(?format, "tracing initialized");
    Ok(())
}

/// Route panics through tracing so json logs keep them, then defer to the default hook.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        match info.location() {
            Some(at) => tracing::error!(
                file = at.file(),
                line = at.line(),
                panic = message,
                "panic captured"
            ),
            None => tracing::error!(panic = message, "panic captured"),
        }
        default_hook(info);
    }));
}
