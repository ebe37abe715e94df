use std::sync::Arc;

use engine::{EngineError, EngineHandle};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::Instrument;

use super::turn::{TurnOutcome, TurnRequest, TurnResult, TurnTask, PLAYING_LABEL};
use super::{ControllerState, EndReason, GameResult, Session, SessionOutcome, SessionStatus};
use crate::config::{Backoff, BotConfig};
use crate::events::{BotEvent, BotState, EventSink, Severity};
use crate::history::{DisplayedHistory, SharedHistory};
use crate::service::{
    AccountInfo, EventStream, GameEvent, GameFull, GameService, GameStart, GameState,
    ServiceError,
};
use crate::timing::MovePlan;

type End = (GameResult, EndReason);

/// Collaborators a controller borrows from the supervisor.
#[derive(Clone)]
pub(crate) struct GameContext {
    pub service: Arc<dyn GameService>,
    pub config: Arc<BotConfig>,
    pub account: AccountInfo,
    pub events: EventSink,
    pub displayed: DisplayedHistory,
}

/// Play one game to the end. Returns the outcome together with the playing
/// engine when it is still running and should be reused.
pub(crate) async fn run_game(
    ctx: GameContext,
    start: GameStart,
    engine: Option<EngineHandle>,
) -> (SessionOutcome, Option<EngineHandle>) {
    let span = tracing::info_span!("game", id = %start.game_id);
    let mut controller = Controller::new(ctx, start, engine);
    let (result, reason) = controller.run().instrument(span.clone()).await;
    controller.finish(result, reason).instrument(span).await
}

struct Controller {
    ctx: GameContext,
    session: Session,
    phase: ControllerState,
    initial_fen: String,
    history: Option<SharedHistory>,
    /// `None` while a turn task holds the engine.
    engine: Option<EngineHandle>,
    turn: Option<TurnTask>,
    /// History length the last move was requested for. Guards against a
    /// second request for the same turn.
    requested_for: Option<usize>,
    /// History length of the last move the server refused. A second refusal
    /// at the same length resigns.
    rejected_at: Option<usize>,
    game_over: watch::Sender<bool>,
    rejoins_left: u32,
    backoff: Backoff,
}

impl Controller {
    fn new(ctx: GameContext, start: GameStart, engine: Option<EngineHandle>) -> Self {
        let (game_over, _) = watch::channel(false);
        let rejoins_left = ctx.config.reconnect.game_rejoin_attempts;
        let backoff = ctx.config.reconnect.backoff();
        Self {
            session: Session {
                game_id: start.game_id,
                opponent: start.opponent,
                color: start.color,
                speed: start.speed,
                rated: start.rated,
                status: SessionStatus::Seeking,
            },
            ctx,
            phase: ControllerState::AwaitingFirstState,
            initial_fen: "startpos".to_string(),
            history: None,
            engine,
            turn: None,
            requested_for: None,
            rejected_at: None,
            game_over,
            rejoins_left,
            backoff,
        }
    }

    async fn run(&mut self) -> End {
        tracing::info!(opponent = ?self.session.opponent, color = ?self.session.color, "Game started");
        self.publish_phase();

        if let Err(e) = self.prepare_engine().await {
            self.ctx.events.error("Playing engine unavailable, resigning", &e);
            self.resign().await;
            return (GameResult::Loss, EndReason::Resigned);
        }

        let mut stream = match self.join().await {
            Some(stream) => stream,
            None => return (GameResult::Unknown, EndReason::StreamEnded),
        };
        let idle = self.ctx.config.reconnect.idle_timeout();

        loop {
            tokio::select! {
                biased;

                outcome = next_turn(&mut self.turn) => {
                    self.turn = None;
                    if let Some(end) = self.on_turn_outcome(outcome, &mut stream).await {
                        return end;
                    }
                }

                item = tokio::time::timeout(idle, stream.next()) => {
                    let end = match item {
                        Ok(Some(Ok(event))) => self.on_event(event),
                        Ok(Some(Err(ServiceError::Protocol(msg)))) => {
                            self.ctx.events.warn("Dropped malformed game event", msg);
                            None
                        }
                        Ok(Some(Err(e))) => {
                            self.ctx.events.warn("Game stream failed", &e);
                            self.reconnect(&mut stream).await
                        }
                        Ok(None) => {
                            tracing::info!("Game stream closed");
                            Some((GameResult::Unknown, EndReason::StreamEnded))
                        }
                        Err(_) => {
                            self.ctx.events.warn("Game stream idle", format!("no data for {idle:?}"));
                            self.reconnect(&mut stream).await
                        }
                    };
                    if let Some(end) = end {
                        return end;
                    }
                }
            }
        }
    }

    async fn finish(
        mut self,
        result: GameResult,
        reason: EndReason,
    ) -> (SessionOutcome, Option<EngineHandle>) {
        self.game_over.send_replace(true);
        if let Some(mut turn) = self.turn.take() {
            let outcome = turn.join().await;
            self.engine = outcome.engine.or(self.engine.take());
        }
        if self.ctx.config.engine.fresh_process_per_game {
            if let Some(engine) = self.engine.take() {
                engine.stop().await;
            }
        }

        self.session.status = SessionStatus::Finished;
        self.set_phase(ControllerState::Finished);
        self.ctx.events.info(format!(
            "Game {} finished: {result:?} ({reason:?})",
            self.session.game_id
        ));

        let outcome = SessionOutcome {
            session: self.session.clone(),
            result,
            reason,
            history: self.history.as_ref().map(SharedHistory::snapshot),
        };
        (outcome, self.engine.take())
    }

    /// Make sure a playing engine is running and reset for a new game,
    /// replacing a broken process once.
    async fn prepare_engine(&mut self) -> Result<(), EngineError> {
        let config = &self.ctx.config;
        let mut last_err = EngineError::NotRunning;
        for _ in 0..2 {
            let engine = match self.engine.take() {
                Some(engine) => engine,
                None => match EngineHandle::start(
                    &config.engine.spec,
                    PLAYING_LABEL,
                    config.engine_timeouts,
                )
                .await
                {
                    Ok(engine) => engine,
                    Err(e) => {
                        self.ctx.events.warn("Playing engine failed to start", &e);
                        last_err = e;
                        continue;
                    }
                },
            };
            match engine.new_game().await {
                Ok(()) => {
                    self.engine = Some(engine);
                    return Ok(());
                }
                Err(e) => {
                    self.ctx.events.warn("Playing engine not ready", &e);
                    engine.stop().await;
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn join(&mut self) -> Option<EventStream<GameEvent>> {
        match self.ctx.service.stream_game_state(&self.session.game_id).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                self.ctx.events.warn("Could not open game stream", &e);
                self.rejoin().await
            }
        }
    }

    /// Reopen the game stream with backoff. The server replays the full game
    /// on every join.
    async fn rejoin(&mut self) -> Option<EventStream<GameEvent>> {
        while self.rejoins_left > 0 {
            self.rejoins_left -= 1;
            let delay = self.backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, left = self.rejoins_left, "Rejoining game");
            tokio::time::sleep(delay).await;
            match self.ctx.service.stream_game_state(&self.session.game_id).await {
                Ok(stream) => return Some(stream),
                Err(e) if e.is_auth() => {
                    self.ctx.events.error("Game stream rejected credentials", &e);
                    return None;
                }
                Err(e) => self.ctx.events.warn("Rejoin failed", &e),
            }
        }
        self.ctx.events.log(
            Severity::Error,
            "Gave up rejoining game",
            Some(self.session.game_id.clone()),
        );
        None
    }

    async fn reconnect(&mut self, stream: &mut EventStream<GameEvent>) -> Option<End> {
        match self.rejoin().await {
            Some(fresh) => {
                *stream = fresh;
                None
            }
            None => Some((GameResult::Unknown, EndReason::StreamEnded)),
        }
    }

    /// Replace the stream to get an authoritative full state.
    async fn refetch(&mut self, stream: &mut EventStream<GameEvent>) -> Option<End> {
        match self.ctx.service.stream_game_state(&self.session.game_id).await {
            Ok(fresh) => {
                *stream = fresh;
                None
            }
            Err(e) => {
                self.ctx.events.warn("Refetch failed", &e);
                self.reconnect(stream).await
            }
        }
    }

    fn on_event(&mut self, event: GameEvent) -> Option<End> {
        match event {
            GameEvent::Full(full) => self.on_full(full),
            GameEvent::State(state) => {
                if self.history.is_none() {
                    tracing::warn!("Game state before game description, ignored");
                    return None;
                }
                self.on_state(&state)
            }
            GameEvent::ChatLine { username, text } => {
                self.ctx
                    .events
                    .log(Severity::Debug, format!("{username}: {text}"), None);
                None
            }
            GameEvent::OpponentGone { gone } => {
                let message = if gone {
                    "Opponent left the game"
                } else {
                    "Opponent is back"
                };
                self.ctx.events.info(message);
                None
            }
            GameEvent::KeepAlive => None,
        }
    }

    fn on_full(&mut self, full: GameFull) -> Option<End> {
        self.rejoins_left = self.ctx.config.reconnect.game_rejoin_attempts;
        self.backoff.reset();

        if self.session.color.is_none() {
            self.session.color = self.our_side(&full);
        }
        if self.session.opponent.is_none() {
            self.session.opponent = match self.session.color {
                Some(chess::PlayerSide::White) => Some(full.black.name.clone()),
                Some(chess::PlayerSide::Black) => Some(full.white.name.clone()),
                None => None,
            };
        }
        self.session.rated = full.rated;
        if full.speed.is_some() {
            self.session.speed = full.speed.clone();
        }
        if self.session.color.is_none() {
            return Some((
                GameResult::Unknown,
                EndReason::Abandoned("cannot tell which side we play".into()),
            ));
        }

        if self.history.is_none() {
            match SharedHistory::new(
                &self.session.game_id,
                &full.initial_fen,
                self.ctx.config.follow_live,
            ) {
                Ok(history) => {
                    self.initial_fen = full.initial_fen.clone();
                    self.ctx.displayed.show(history.clone());
                    self.history = Some(history);
                }
                Err(e) => {
                    return Some((
                        GameResult::Unknown,
                        EndReason::Abandoned(format!("bad initial position: {e}")),
                    ))
                }
            }
        }
        self.session.status = SessionStatus::Active;
        self.publish_phase();
        self.on_state(&full.state)
    }

    fn our_side(&self, full: &GameFull) -> Option<chess::PlayerSide> {
        let is_us = |player: &crate::service::PlayerInfo| {
            player
                .id
                .as_deref()
                .is_some_and(|id| id.eq_ignore_ascii_case(&self.ctx.account.id))
                || player.name.eq_ignore_ascii_case(&self.ctx.account.username)
        };
        if is_us(&full.white) {
            Some(chess::PlayerSide::White)
        } else if is_us(&full.black) {
            Some(chess::PlayerSide::Black)
        } else {
            None
        }
    }

    fn on_state(&mut self, state: &GameState) -> Option<End> {
        if state.status.is_aborted() {
            return Some((GameResult::Aborted, EndReason::GameOver(state.status)));
        }
        let history = self.history.clone()?;
        let cursor_before = history.cursor();

        match history.sync(&state.moves, state.white_time_ms, state.black_time_ms) {
            Ok(plies) => {
                for ply in plies {
                    self.ctx.events.emit(BotEvent::PlyAppended {
                        game_id: self.session.game_id.clone(),
                        ply,
                    });
                }
            }
            Err(e) => {
                self.ctx.events.error("Move history out of sync with server", &e);
                self.rebuild_history(state);
            }
        }

        if let Some(history) = &self.history {
            let (cursor, len) = (history.cursor(), history.len());
            if cursor != cursor_before {
                self.ctx
                    .events
                    .emit(BotEvent::CursorMoved { index: cursor, len });
            }
        }

        if !state.status.is_ongoing() {
            let result = GameResult::decide(state.status, state.winner, self.session.color);
            return Some((result, EndReason::GameOver(state.status)));
        }
        self.maybe_start_turn(state);
        None
    }

    /// Start over from the server's move list.
    fn rebuild_history(&mut self, state: &GameState) {
        let rebuilt = SharedHistory::new(
            &self.session.game_id,
            &self.initial_fen,
            self.ctx.config.follow_live,
        )
        .map_err(|e| e.to_string())
        .and_then(|history| {
            history
                .sync(&state.moves, state.white_time_ms, state.black_time_ms)
                .map(|plies| (history, plies))
                .map_err(|e| e.to_string())
        });
        match rebuilt {
            Ok((history, plies)) => {
                self.ctx.displayed.show(history.clone());
                self.history = Some(history);
                self.requested_for = None;
                for ply in plies {
                    self.ctx.events.emit(BotEvent::PlyAppended {
                        game_id: self.session.game_id.clone(),
                        ply,
                    });
                }
            }
            Err(e) => self
                .ctx
                .events
                .error("Server move list is not playable, event dropped", e),
        }
    }

    fn maybe_start_turn(&mut self, state: &GameState) {
        let (Some(history), Some(color)) = (&self.history, self.session.color) else {
            return;
        };
        let live = history.live_view();
        if live.board.status() != cozy_chess::GameStatus::Ongoing || live.side_to_move != color {
            self.set_phase(ControllerState::WaitingOpponent);
            return;
        }
        self.set_phase(ControllerState::OwnTurnPending);

        if self.turn.is_some() || self.requested_for == Some(live.len) {
            tracing::debug!(ply = live.len + 1, "Move already requested");
            return;
        }

        let config = &self.ctx.config;
        let plan = MovePlan::new(
            live.len + 1,
            &config.timing,
            state.clock_for(color),
            config.engine.single_node,
            &mut rand::thread_rng(),
        );
        tracing::debug!(ply = live.len + 1, limit = ?plan.limit, pace = ?plan.pace, "Requesting move");

        let request = TurnRequest {
            service: self.ctx.service.clone(),
            events: self.ctx.events.clone(),
            game_id: self.session.game_id.clone(),
            ply_count: live.len,
            position: live.position,
            board: live.board,
            plan,
            engine_spec: config.engine.spec.clone(),
            timeouts: config.engine_timeouts,
            game_over: self.game_over.subscribe(),
        };
        self.requested_for = Some(live.len);
        self.turn = Some(TurnTask::spawn(request, self.engine.take()));
    }

    async fn on_turn_outcome(
        &mut self,
        outcome: TurnOutcome,
        stream: &mut EventStream<GameEvent>,
    ) -> Option<End> {
        if let Some(engine) = outcome.engine {
            self.engine = Some(engine);
        }
        match outcome.result {
            TurnResult::Submitted(uci) => {
                tracing::info!(ply = outcome.ply_count + 1, mv = %uci, "Move submitted");
                let unchanged = self
                    .history
                    .as_ref()
                    .is_some_and(|h| h.len() == outcome.ply_count);
                if unchanged && self.phase == ControllerState::OwnTurnPending {
                    self.set_phase(ControllerState::WaitingOpponent);
                }
                None
            }
            TurnResult::Rejected(reason) if self.rejected_at == Some(outcome.ply_count) => {
                self.ctx
                    .events
                    .error("Resigning: server rejected our move again", reason);
                self.resign().await;
                Some((GameResult::Loss, EndReason::Resigned))
            }
            TurnResult::Rejected(reason) => {
                self.ctx
                    .events
                    .warn("Server rejected our move, refetching game state", reason);
                self.rejected_at = Some(outcome.ply_count);
                self.requested_for = None;
                self.refetch(stream).await
            }
            TurnResult::SubmitFailed(e) => {
                self.ctx.events.error("Move submission failed", &e);
                self.requested_for = None;
                self.refetch(stream).await
            }
            TurnResult::NotYourTurn => {
                tracing::warn!(ply = outcome.ply_count + 1, "Server says it is not our turn");
                None
            }
            TurnResult::Abandoned => None,
            TurnResult::EngineFailed(e) => {
                self.ctx.events.error("Resigning: engine failed twice", &e);
                self.resign().await;
                Some((GameResult::Loss, EndReason::Resigned))
            }
        }
    }

    async fn resign(&self) {
        match self.ctx.service.resign(&self.session.game_id).await {
            Ok(()) => tracing::info!("Resigned"),
            Err(e) => self.ctx.events.warn("Resignation failed", &e),
        }
    }

    fn set_phase(&mut self, phase: ControllerState) {
        if self.phase != phase {
            self.phase = phase;
            self.publish_phase();
        }
    }

    fn publish_phase(&self) {
        self.ctx.events.set_state(BotState::Playing {
            session: self.session.clone(),
            phase: self.phase,
        });
    }
}

async fn next_turn(turn: &mut Option<TurnTask>) -> TurnOutcome {
    match turn {
        Some(task) => task.join().await,
        None => std::future::pending().await,
    }
}

