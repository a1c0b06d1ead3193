mod brain;
mod error;
mod executor;
mod eyes;
mod face;
mod hands;
mod orchestrator;
mod session;
mod types;

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use brain::{Brain, HttpModel};
use executor::Executor;
use eyes::ShellEyes;
use face::AgentEvent;
use hands::ShellHands;
use orchestrator::{LoopConfig, run_task};
use session::CancelFlag;

/// Computer-use agent: drives the host mouse and keyboard from a
/// vision-capable model, with a localhost dashboard.
#[derive(Parser, Debug)]
#[command(name = "deskpilot", version)]
struct Cli {
    /// Dashboard port (falls back to the next free port if taken).
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Model name sent to the chat-completions endpoint.
    #[arg(long, env = "DESKPILOT_MODEL", default_value = "gpt-5.2")]
    model: String,

    /// OpenAI-compatible API base URL.
    #[arg(
        long,
        env = "DESKPILOT_API_BASE",
        default_value = "https://api.openai.com/v1"
    )]
    api_base: String,

    /// Maximum turns per task.
    #[arg(long, default_value_t = types::MAX_TURNS_PER_TASK)]
    max_turns: usize,

    /// Milliseconds to let the UI settle before each capture.
    #[arg(long, default_value_t = types::SETTLE_DELAY_MS)]
    settle_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deskpilot=info")),
        )
        .init();

    let cli = Cli::parse();
    let api_key = std::env::var("DESKPILOT_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .map_err(|_| anyhow!("DESKPILOT_API_KEY or OPENAI_API_KEY must be set"))?;

    let cancel = CancelFlag::new();
    let (snap_tx, snap_rx) = watch::channel(None);
    let (mut cmd_rx, event_tx) = face::start_server(cli.port, cancel.clone(), snap_rx).await?;

    let eyes = ShellEyes::new().context("screen capture setup failed")?;
    let hands = ShellHands::new();
    let executor = Executor::new(hands, eyes);
    let model = HttpModel::new(&cli.api_base, &api_key, &cli.model)?;
    let mut brain = Brain::new(model);

    let cfg = LoopConfig {
        max_turns: cli.max_turns,
        settle_delay: Duration::from_millis(cli.settle_ms),
    };

    // First Ctrl-C cancels the running task; the second exits.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interrupts = 0u32;
            while tokio::signal::ctrl_c().await.is_ok() {
                interrupts += 1;
                if interrupts >= 2 {
                    std::process::exit(0);
                }
                info!("interrupt: cancelling current task");
                cancel.set();
            }
        });
    }

    info!("ready, waiting for commands");
    while let Some(command) = cmd_rx.recv().await {
        cancel.clear();
        let outcome = run_task(
            &command,
            &mut brain,
            &executor,
            cancel.clone(),
            &event_tx,
            &snap_tx,
            &cfg,
        )
        .await;
        info!(?outcome, "task finished");
        let _ = event_tx.send(AgentEvent::Ready);
    }

    Ok(())
}
