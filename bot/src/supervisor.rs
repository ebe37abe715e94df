//! Top-level bot loop: seek, play one game at a time, repeat until stopped.

use std::sync::Arc;
use std::time::Duration;

use engine::EngineHandle;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::{Backoff, BotConfig, ChallengePolicy};
use crate::consumer::{ConsumerMessage, EventConsumer};
use crate::error::{BotError, ConfigError};
use crate::evaluation::{EvaluationTask, EVALUATION_LABEL};
use crate::events::{BotState, EventSink};
use crate::handle::{BotHandle, SupervisorCommand};
use crate::history::DisplayedHistory;
use crate::service::{
    AccountEvent, AccountInfo, Challenge, DeclineReason, GameService, GameStart, ServiceError,
};
use crate::session::{run_game, GameContext, GameResult, SessionOutcome, PLAYING_LABEL};

const COMMAND_CAPACITY: usize = 16;
const CONSUMER_CAPACITY: usize = 64;

type GameTask = JoinHandle<(SessionOutcome, Option<EngineHandle>)>;

/// Validate `config` and start the bot. The returned task resolves when the
/// bot stops: `Ok` after a stop command, `Err` when it had to halt.
pub fn spawn(
    service: Arc<dyn GameService>,
    config: BotConfig,
) -> Result<(BotHandle, JoinHandle<Result<(), BotError>>), ConfigError> {
    config.validate()?;

    let events = EventSink::new();
    let displayed = DisplayedHistory::new();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (shutdown, _) = watch::channel(false);
    let config = Arc::new(config);

    let supervisor = Supervisor {
        seek_backoff: config.reconnect.backoff(),
        service,
        config,
        events: events.clone(),
        displayed: displayed.clone(),
        cmd_rx,
        shutdown,
        stop_after_game: false,
        engine: None,
        active: None,
        seek: None,
        reseek_at: None,
        evaluation: None,
        consumer: None,
    };
    let task = tokio::spawn(supervisor.run().instrument(tracing::info_span!("supervisor")));
    Ok((BotHandle::new(cmd_tx, events, displayed), task))
}

struct ActiveGame {
    game_id: String,
    task: GameTask,
}

struct Supervisor {
    service: Arc<dyn GameService>,
    config: Arc<BotConfig>,
    events: EventSink,
    displayed: DisplayedHistory,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    shutdown: watch::Sender<bool>,
    stop_after_game: bool,
    /// The playing engine between games.
    engine: Option<EngineHandle>,
    active: Option<ActiveGame>,
    seek: Option<JoinHandle<Result<(), ServiceError>>>,
    reseek_at: Option<Instant>,
    seek_backoff: Backoff,
    evaluation: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

enum Step {
    Continue,
    Stop,
}

impl Supervisor {
    async fn run(mut self) -> Result<(), BotError> {
        self.events.set_state(BotState::Starting);
        let result = self.run_inner().await;
        self.events.set_state(BotState::Stopping);
        self.teardown().await;
        match &result {
            Ok(()) => self.events.set_state(BotState::Stopped),
            Err(e) => {
                self.events.error("Bot halted", e);
                self.events.set_state(BotState::Failed(e.to_string()));
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<(), BotError> {
        let Some(account) = self.authenticate().await? else {
            return Ok(());
        };
        self.events
            .info(format!("Logged in as {} ({})", account.username, account.id));

        if !self.config.engine.fresh_process_per_game {
            self.engine = Some(self.start_playing_engine().await?);
        }
        self.start_evaluation().await;

        let (consumer_tx, mut consumer_rx) = mpsc::channel(CONSUMER_CAPACITY);
        let consumer = EventConsumer::new(
            self.service.clone(),
            self.config.reconnect.clone(),
            self.events.clone(),
            consumer_tx,
            self.shutdown.subscribe(),
        );
        self.consumer = Some(consumer.spawn());

        self.start_seek();

        loop {
            let step = tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => self.on_command(cmd),

                done = join_game(&mut self.active) => self.on_game_done(done),

                msg = consumer_rx.recv() => match msg {
                    Some(ConsumerMessage::Event(event)) => {
                        self.on_account_event(event, &account);
                        Step::Continue
                    }
                    Some(ConsumerMessage::AuthFailed(reason)) => return Err(BotError::Auth(reason)),
                    None => {
                        return Err(BotError::Internal("account stream consumer exited".into()))
                    }
                },

                result = join_seek(&mut self.seek) => {
                    self.seek = None;
                    self.on_seek_done(result)?;
                    Step::Continue
                }

                _ = sleep_until(self.reseek_at), if self.active.is_none() => {
                    self.reseek_at = None;
                    self.start_seek();
                    Step::Continue
                }
            };
            if let Step::Stop = step {
                return Ok(());
            }
        }
    }

    /// `None` when a stop command arrived first.
    async fn authenticate(&mut self) -> Result<Option<AccountInfo>, BotError> {
        let mut backoff = self.config.reconnect.backoff();
        loop {
            let result = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    tracing::info!(?cmd, "Stopped before login");
                    return Ok(None);
                }
                result = self.service.validate_credential() => result,
            };
            match result {
                Ok(account) => return Ok(Some(account)),
                Err(e) if e.is_auth() => return Err(BotError::Auth(e.to_string())),
                Err(e) => {
                    let delay = backoff.next_delay();
                    self.events
                        .warn("Login failed, retrying", format!("{e} (retry in {delay:?})"));
                    tokio::select! {
                        biased;
                        cmd = self.cmd_rx.recv() => {
                            tracing::info!(?cmd, "Stopped before login");
                            return Ok(None);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn start_playing_engine(&self) -> Result<EngineHandle, BotError> {
        let spec = &self.config.engine.spec;
        let timeouts = self.config.engine_timeouts;
        match EngineHandle::start(spec, PLAYING_LABEL, timeouts).await {
            Ok(engine) => Ok(engine),
            Err(e) => {
                self.events.warn("Playing engine failed to start, retrying", &e);
                EngineHandle::start(spec, PLAYING_LABEL, timeouts)
                    .await
                    .map_err(BotError::Engine)
            }
        }
    }

    async fn start_evaluation(&mut self) {
        if !self.config.evaluation.enabled {
            return;
        }
        let spec = self.config.evaluation_spec();
        let engine = match EngineHandle::start(spec, EVALUATION_LABEL, self.config.engine_timeouts).await {
            Ok(engine) => engine,
            Err(e) => {
                self.events
                    .warn("Evaluation engine failed to start, evaluation disabled", &e);
                return;
            }
        };
        let task = EvaluationTask::new(
            self.config.clone(),
            self.displayed.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        );
        self.evaluation = Some(task.spawn(engine));
    }

    fn on_command(&mut self, cmd: Option<SupervisorCommand>) -> Step {
        match cmd {
            Some(SupervisorCommand::StopNow) | None => {
                self.events.info("Stopping now");
                Step::Stop
            }
            Some(SupervisorCommand::StopAfterGame) => {
                self.stop_after_game = true;
                self.cancel_seek();
                match &self.active {
                    Some(game) => {
                        self.events
                            .info(format!("Stopping after game {} ends", game.game_id));
                        Step::Continue
                    }
                    None => {
                        self.events.info("Stopping, no game in progress");
                        Step::Stop
                    }
                }
            }
        }
    }

    fn on_account_event(&mut self, event: AccountEvent, account: &AccountInfo) {
        match event {
            AccountEvent::GameStart(start) => self.on_game_start(start, account),
            AccountEvent::GameFinish(finish) => {
                self.events.info(format!(
                    "Server reports game {} finished: {}",
                    finish.game_id, finish.status
                ));
            }
            AccountEvent::Challenge(challenge) => self.on_challenge(challenge),
            AccountEvent::KeepAlive => {}
        }
    }

    fn on_game_start(&mut self, start: GameStart, account: &AccountInfo) {
        if let Some(active) = &self.active {
            if active.game_id == start.game_id {
                tracing::debug!(game_id = %start.game_id, "Duplicate game start ignored");
            } else {
                self.events.warn(
                    "Ignoring game start while another game is in progress",
                    format!("new {}, active {}", start.game_id, active.game_id),
                );
            }
            return;
        }
        if self.stop_after_game {
            self.events.warn("Ignoring game start, stop requested", &start.game_id);
            return;
        }

        self.cancel_seek();
        self.reseek_at = None;
        self.seek_backoff.reset();
        self.events.info(format!(
            "Game {} started against {}",
            start.game_id,
            start.opponent.as_deref().unwrap_or("unknown opponent")
        ));

        let ctx = GameContext {
            service: self.service.clone(),
            config: self.config.clone(),
            account: account.clone(),
            events: self.events.clone(),
            displayed: self.displayed.clone(),
        };
        let game_id = start.game_id.clone();
        let task = tokio::spawn(run_game(ctx, start, self.engine.take()));
        self.active = Some(ActiveGame { game_id, task });
    }

    fn on_challenge(&mut self, challenge: Challenge) {
        let decision = if self.active.is_some() || self.stop_after_game {
            Err(DeclineReason::Later)
        } else {
            match self.config.challenges.policy {
                ChallengePolicy::Decline => Err(DeclineReason::Generic),
                ChallengePolicy::Accept if challenge.variant != "standard" => {
                    Err(DeclineReason::Variant)
                }
                ChallengePolicy::Accept => Ok(()),
            }
        };

        let service = self.service.clone();
        let events = self.events.clone();
        let from = challenge.challenger.clone().unwrap_or_default();
        match decision {
            Ok(()) => {
                self.cancel_seek();
                self.reseek_at = Some(Instant::now() + self.restart_after());
                events.info(format!("Accepting challenge {} from {from}", challenge.id));
                tokio::spawn(async move {
                    if let Err(e) = service.accept_challenge(&challenge.id).await {
                        events.warn("Could not accept challenge", &e);
                    }
                });
            }
            Err(reason) => {
                events.info(format!(
                    "Declining challenge {} from {from} ({})",
                    challenge.id,
                    reason.as_str()
                ));
                tokio::spawn(async move {
                    if let Err(e) = service.decline_challenge(&challenge.id, reason).await {
                        events.warn("Could not decline challenge", &e);
                    }
                });
            }
        }
    }

    fn on_game_done(
        &mut self,
        done: Result<(SessionOutcome, Option<EngineHandle>), JoinError>,
    ) -> Step {
        let game_id = self
            .active
            .take()
            .map(|game| game.game_id)
            .unwrap_or_default();
        let result = match done {
            Ok((outcome, engine)) => {
                self.engine = engine;
                outcome.result
            }
            Err(e) => {
                self.events.error("Game task failed", &e);
                GameResult::Unknown
            }
        };
        self.events.set_state(BotState::GameOver { game_id, result });

        if self.stop_after_game {
            self.events.info("Game over, stopping as requested");
            return Step::Stop;
        }
        self.reseek_at = Some(Instant::now() + self.config.between_games_delay());
        Step::Continue
    }

    fn on_seek_done(
        &mut self,
        result: Result<Result<(), ServiceError>, JoinError>,
    ) -> Result<(), BotError> {
        match result {
            Ok(Ok(())) => {
                tracing::debug!("Seek closed");
                self.seek_backoff.reset();
                self.reseek_at = Some(Instant::now() + self.restart_after());
            }
            Ok(Err(e)) if e.is_auth() => return Err(BotError::Auth(e.to_string())),
            Ok(Err(e)) => {
                let delay = self.seek_backoff.next_delay();
                self.events
                    .warn("Seek failed", format!("{e} (retry in {delay:?})"));
                self.reseek_at = Some(Instant::now() + delay);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                self.events.error("Seek task failed", &e);
                self.reseek_at = Some(Instant::now() + self.seek_backoff.next_delay());
            }
        }
        Ok(())
    }

    fn start_seek(&mut self) {
        if self.stop_after_game || self.active.is_some() || self.seek.is_some() {
            return;
        }
        let request = self.config.seek_request();
        self.events.set_state(BotState::Seeking);
        self.events.info(format!(
            "Seeking {} {} game",
            request.time_control,
            if request.rated { "rated" } else { "casual" }
        ));
        let service = self.service.clone();
        self.seek = Some(tokio::spawn(async move {
            service.create_seek(&request).await
        }));
    }

    fn cancel_seek(&mut self) {
        if let Some(seek) = self.seek.take() {
            seek.abort();
        }
    }

    fn restart_after(&self) -> Duration {
        Duration::from_millis(self.config.seek.restart_after_ms)
    }

    async fn teardown(&mut self) {
        self.shutdown.send_replace(true);
        self.cancel_seek();

        if let Some(game) = self.active.take() {
            self.events
                .warn("Abandoning game in progress", &game.game_id);
            game.task.abort();
            let _ = game.task.await;
        }
        if let Some(engine) = self.engine.take() {
            engine.stop().await;
        }

        let grace = self.teardown_grace();
        for task in [self.evaluation.take(), self.consumer.take()]
            .into_iter()
            .flatten()
        {
            let mut task = task;
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("Background task did not exit in time");
                task.abort();
            }
        }
    }

    fn teardown_grace(&self) -> Duration {
        let timeouts = self.config.engine_timeouts;
        timeouts.drain() + timeouts.stop_grace() + Duration::from_secs(1)
    }
}

async fn join_game(
    active: &mut Option<ActiveGame>,
) -> Result<(SessionOutcome, Option<EngineHandle>), JoinError> {
    match active {
        Some(game) => (&mut game.task).await,
        None => std::future::pending().await,
    }
}

async fn join_seek(
    seek: &mut Option<JoinHandle<Result<(), ServiceError>>>,
) -> Result<Result<(), ServiceError>, JoinError> {
    match seek {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
