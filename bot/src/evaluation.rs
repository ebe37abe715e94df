//! Background evaluation of the displayed position.
//!
//! Runs on its own engine process for the lifetime of the bot, independent
//! of games and of whose turn it is.

use std::sync::Arc;
use std::time::Duration;

use chess::{format_fen, format_uci_move, AnalysisScore};
use engine::{EngineHandle, EngineInfo, EvaluationOutcome};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::Instrument;

use crate::config::BotConfig;
use crate::events::{BotEvent, EvaluationResult, EventSink};
use crate::history::{CursorView, DisplayedHistory, SharedHistory};

pub(crate) const EVALUATION_LABEL: &str = "evaluation";

/// Identifies an evaluated position.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PositionKey {
    game_id: Arc<str>,
    ply: usize,
    fen: String,
}

impl PositionKey {
    fn of(view: &CursorView) -> Self {
        Self {
            game_id: view.game_id.clone(),
            ply: view.ply,
            fen: format_fen(&view.board),
        }
    }
}

pub(crate) struct EvaluationTask {
    config: Arc<BotConfig>,
    displayed: DisplayedHistory,
    events: EventSink,
    shutdown: watch::Receiver<bool>,
}

impl EvaluationTask {
    pub fn new(
        config: Arc<BotConfig>,
        displayed: DisplayedHistory,
        events: EventSink,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            displayed,
            events,
            shutdown,
        }
    }

    pub fn spawn(self, engine: EngineHandle) -> JoinHandle<()> {
        tokio::spawn(
            self.run(engine)
                .instrument(tracing::info_span!("evaluation")),
        )
    }

    async fn run(mut self, engine: EngineHandle) {
        tracing::info!(engine = %engine.name(), "Evaluation loop started");
        let mut engine = Some(engine);
        let mut cadence = time::interval(self.config.evaluation.cadence());
        cadence.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut displayed_rx = self.displayed.subscribe();
        let mut last: Option<PositionKey> = None;
        let mut restarted = false;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                _ = cadence.tick() => {}
            }

            let Some(handle) = engine.as_ref() else {
                break;
            };
            let Some(history) = self.displayed.current() else {
                continue;
            };
            let view = history.cursor_view();
            let key = PositionKey::of(&view);
            if last.as_ref() == Some(&key) {
                continue;
            }

            let side = view.board.side_to_move();
            if let Some(score) = AnalysisScore::terminal(&view.board) {
                self.publish(&view, score.to_white_pov(side), Vec::new(), None, true);
                last = Some(key);
                continue;
            }

            displayed_rx.borrow_and_update();
            let result = self
                .evaluate(handle, &history, &view, &key, &mut displayed_rx)
                .await;

            match result {
                Ok(outcome) => {
                    restarted = false;
                    if let Some(score) = outcome.score {
                        let line = outcome.pv.iter().map(|mv| format_uci_move(*mv)).collect();
                        self.publish(&view, score.to_white_pov(side), line, outcome.depth, true);
                    }
                    last = Some(key);
                }
                Err(e) if e.needs_restart() && !restarted => {
                    self.events.warn("Restarting evaluation engine", &e);
                    restarted = true;
                    last = None;
                    if let Some(old) = engine.take() {
                        old.stop().await;
                    }
                    match EngineHandle::start(
                        self.config.evaluation_spec(),
                        EVALUATION_LABEL,
                        self.config.engine_timeouts,
                    )
                    .await
                    {
                        Ok(fresh) => engine = Some(fresh),
                        Err(e) => self.events.error("Evaluation disabled", &e),
                    }
                }
                Err(e) => {
                    self.events.error("Evaluation disabled", &e);
                    break;
                }
            }
        }

        if let Some(engine) = engine {
            engine.stop().await;
        }
        tracing::info!("Evaluation loop exited");
    }

    async fn evaluate(
        &self,
        engine: &EngineHandle,
        history: &SharedHistory,
        view: &CursorView,
        key: &PositionKey,
        displayed_rx: &mut watch::Receiver<Option<SharedHistory>>,
    ) -> Result<EvaluationOutcome, engine::EngineError> {
        let side = view.board.side_to_move();
        let publish_interval = self.config.evaluation.publish_interval();
        let mut last_publish: Option<Instant> = None;
        let mut shutdown = self.shutdown.clone();

        let cancelled = superseded(
            history,
            key,
            displayed_rx,
            &mut shutdown,
            self.config.evaluation.cadence(),
        );
        let on_progress = |info: &EngineInfo| {
            let Some(score) = info.score else {
                return;
            };
            if last_publish.is_some_and(|at| at.elapsed() < publish_interval) {
                return;
            }
            last_publish = Some(Instant::now());
            let line = info.pv.iter().map(|mv| format_uci_move(*mv)).collect();
            self.publish(view, score.to_white_pov(side), line, info.depth, false);
        };

        engine
            .request_evaluation(&view.search_position(), cancelled, on_progress)
            .await
    }

    fn publish(
        &self,
        view: &CursorView,
        score: AnalysisScore,
        best_line: Vec<String>,
        depth: Option<u8>,
        is_final: bool,
    ) {
        self.events.emit(BotEvent::Evaluation(EvaluationResult {
            game_id: Some(view.game_id.to_string()),
            ply: view.ply,
            score,
            best_line,
            depth,
            is_final,
        }));
    }
}

/// Resolves once the evaluated position is no longer the displayed one, or
/// on shutdown.
async fn superseded(
    history: &SharedHistory,
    key: &PositionKey,
    displayed_rx: &mut watch::Receiver<Option<SharedHistory>>,
    shutdown: &mut watch::Receiver<bool>,
    poll: Duration,
) {
    loop {
        tokio::select! {
            _ = displayed_rx.changed() => return,
            _ = shutdown.changed() => return,
            _ = time::sleep(poll) => {
                if PositionKey::of(&history.cursor_view()) != *key {
                    return;
                }
            }
        }
    }
}
