use chess::{CursorMove, MoveHistory};
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::BotError;
use crate::events::{BotEvent, BotState, EventSink};
use crate::history::DisplayedHistory;

#[derive(Debug)]
pub(crate) enum SupervisorCommand {
    StopNow,
    StopAfterGame,
}

/// Cheap, cloneable handle to a running bot.
#[derive(Clone)]
pub struct BotHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    events: EventSink,
    displayed: DisplayedHistory,
}

impl BotHandle {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<SupervisorCommand>,
        events: EventSink,
        displayed: DisplayedHistory,
    ) -> Self {
        Self {
            cmd_tx,
            events,
            displayed,
        }
    }

    /// Tear down immediately, abandoning a game in progress.
    pub async fn stop_now(&self) -> Result<(), BotError> {
        self.send(SupervisorCommand::StopNow).await
    }

    /// Stop seeking and stop once the current game, if any, has ended.
    pub async fn stop_after_current_game(&self) -> Result<(), BotError> {
        self.send(SupervisorCommand::StopAfterGame).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> BotState {
        self.events.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<BotState> {
        self.events.watch_state()
    }

    /// Move the cursor of the displayed game. `None` before the first game.
    pub fn navigate(&self, nav: CursorMove) -> Option<(usize, usize)> {
        let (index, len) = self.displayed.navigate(nav)?;
        self.events.emit(BotEvent::CursorMoved { index, len });
        Some((index, len))
    }

    /// Copy of the displayed game's history.
    pub fn displayed_history(&self) -> Option<MoveHistory> {
        self.displayed.current().map(|history| history.snapshot())
    }

    async fn send(&self, cmd: SupervisorCommand) -> Result<(), BotError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| BotError::Internal("Supervisor closed".into()))
    }
}
