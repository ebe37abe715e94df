//! Autobot - plays chess on Lichess with a local UCI engine.
//!
//! `autobot run` (the default) seeks games one after another until stopped.
//! The first Ctrl-C finishes the current game before exiting; a second one
//! exits at once. `autobot check-engine <path>` verifies that an engine
//! speaks UCI well enough to be used.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bot::{BotConfig, BotEvent, BotHandle, BotState, ChallengePolicy, TimeControl};
use clap::{Args, Parser, Subcommand};
use engine::{EngineHandle, EngineSpec, EngineTimeouts, SearchLimit, SearchPosition};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

mod config;

#[derive(Parser)]
#[command(name = "autobot", version, about = "Autonomous Lichess bot driven by a UCI engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Seek and play games until stopped.
    Run(RunArgs),
    /// Launch an engine, print what it reports and ask it for one move.
    CheckEngine {
        /// Engine executable.
        path: PathBuf,
        /// Think time for the test move.
        #[arg(long, default_value_t = 1000)]
        movetime_ms: u64,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// JSON config file. Defaults to `AUTOBOT_CONFIG`.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Playing engine executable, overriding the config file.
    #[arg(short, long)]
    engine: Option<PathBuf>,
    /// Time control to seek, e.g. `10+5` or `3 days`.
    #[arg(short, long)]
    time_control: Option<TimeControl>,
    /// Seek rated games.
    #[arg(long)]
    rated: bool,
    /// Accept standard challenges while idle instead of declining them.
    #[arg(long)]
    accept_challenges: bool,
    /// Do not run the evaluation engine.
    #[arg(long)]
    no_evaluation: bool,
}

/// Install the global subscriber. Logs go to stderr and, when
/// `AUTOBOT_LOG_DIR` is set, to a daily file there. The returned guard
/// flushes the file writer on drop.
fn init_logging() -> Option<WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    let (file, guard) = match config::get_log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "autobot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

fn resolve_config(args: &RunArgs) -> anyhow::Result<BotConfig> {
    let path = args.config.clone().or_else(config::get_config_path);
    let mut bot_config = config::load_config(path.as_deref())?;
    config::apply_env(&mut bot_config);

    if let Some(engine) = &args.engine {
        bot_config.engine.spec.path = engine.clone();
    }
    if let Some(tc) = args.time_control {
        bot_config.seek.time_control = tc;
    }
    if args.rated {
        bot_config.seek.rated = true;
    }
    if args.accept_challenges {
        bot_config.challenges.policy = ChallengePolicy::Accept;
    }
    if args.no_evaluation {
        bot_config.evaluation.enabled = false;
    }
    bot_config.validate().context("invalid configuration")?;
    Ok(bot_config)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let bot_config = resolve_config(&args)?;
    let token = config::get_token()
        .context("no API token: set AUTOBOT_TOKEN or LICHESS_API_TOKEN")?;
    let client = lichess::LichessClient::with_base_url(token, config::get_server_url())
        .context("failed to create HTTP client")?;

    tracing::info!(
        engine = %bot_config.engine.spec.path.display(),
        time_control = %bot_config.seek.time_control,
        rated = bot_config.seek.rated,
        evaluation = bot_config.evaluation.enabled,
        "Starting autobot"
    );

    let (handle, mut task) = bot::spawn(Arc::new(client), bot_config)?;
    let reporter = tokio::spawn(report(handle.subscribe()));

    let mut interrupts = 0;
    let result = loop {
        tokio::select! {
            result = &mut task => break result,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupts += 1;
                request_stop(&handle, interrupts).await;
            }
        }
    };
    reporter.abort();

    match result.context("bot task panicked")? {
        Ok(()) => {
            tracing::info!("Autobot stopped");
            Ok(())
        }
        Err(e) => Err(e).context("autobot halted"),
    }
}

async fn request_stop(handle: &BotHandle, interrupts: u32) {
    let sent = if interrupts == 1 {
        tracing::info!("Stopping after the current game, press Ctrl-C again to stop now");
        handle.stop_after_current_game().await
    } else {
        tracing::info!("Stopping now");
        handle.stop_now().await
    };
    if let Err(e) = sent {
        tracing::debug!(error = %e, "Stop request not delivered");
    }
}

/// Render bot events as log lines. Log events are already mirrored to
/// `tracing` by the bot.
async fn report(mut events: broadcast::Receiver<BotEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event reporter lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            BotEvent::PlyAppended { game_id, ply } => {
                tracing::info!(
                    game_id = %game_id,
                    ply = ply.index(),
                    san = %ply.san(),
                    clock_ms = ?ply.clock_ms(),
                    "Move played"
                );
            }
            BotEvent::Evaluation(eval) if eval.is_final => {
                tracing::info!(
                    ply = eval.ply,
                    score = %eval.score.display(),
                    depth = ?eval.depth,
                    line = %eval.best_line.join(" "),
                    "Evaluation"
                );
            }
            BotEvent::StateChanged(state) => report_state(&state),
            BotEvent::Evaluation(_) | BotEvent::CursorMoved { .. } | BotEvent::Log(_) => {}
        }
    }
}

fn report_state(state: &BotState) {
    match state {
        BotState::Playing { session, phase } => tracing::debug!(
            game_id = %session.game_id,
            phase = ?phase,
            "Playing"
        ),
        BotState::GameOver { game_id, result } => {
            tracing::info!(game_id = %game_id, result = ?result, "Game over")
        }
        other => tracing::info!(state = ?other, "Bot state"),
    }
}

async fn check_engine(path: PathBuf, movetime_ms: u64) -> anyhow::Result<()> {
    let spec = EngineSpec::new(path);
    let engine = EngineHandle::start(&spec, "check", EngineTimeouts::default())
        .await
        .with_context(|| format!("engine {} failed to start", spec.path.display()))?;

    println!("Engine:  {}", engine.name());
    if let Some(author) = &engine.identity().author {
        println!("Author:  {author}");
    }
    let common = engine.common_options();
    if !common.is_empty() {
        println!("Options:");
        for option in common {
            println!("  {:<20} {}", option.name, option.kind.type_name());
        }
    }

    let position = SearchPosition::new(chess::STARTING_FEN, Vec::new());
    let limit = SearchLimit::MoveTime(Duration::from_millis(movetime_ms));
    let found = engine.request_move(&position, limit).await;
    engine.stop().await;

    let found = found.context("engine did not produce a move")?;
    println!(
        "Move:    {} ({} ms, score {})",
        chess::format_uci_move(found.best_move),
        found.elapsed.as_millis(),
        found.score.map_or_else(|| "n/a".to_string(), |s| s.display())
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logging();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckEngine { path, movetime_ms }) => check_engine(path, movetime_ms).await,
        Some(Commands::Run(args)) => run(args).await,
        None => run(RunArgs::default()).await,
    }
}
