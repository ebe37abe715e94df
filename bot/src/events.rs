use chess::{AnalysisScore, Ply};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::session::{ControllerState, GameResult, Session};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Evaluation of the displayed position.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    /// Game the evaluated history belongs to.
    pub game_id: Option<String>,
    /// Ply index of the evaluated position (0 is the start position).
    pub ply: usize,
    /// From White's point of view.
    pub score: AnalysisScore,
    /// Standard UCI notation.
    pub best_line: Vec<String>,
    pub depth: Option<u8>,
    /// False for progress published while the search is still running.
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BotState {
    Starting,
    Seeking,
    Playing {
        session: Session,
        phase: ControllerState,
    },
    GameOver {
        game_id: String,
        result: GameResult,
    },
    Stopping,
    Stopped,
    /// Halted until restarted: bad credentials or an engine that cannot run.
    Failed(String),
}

impl BotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub severity: Severity,
    pub message: String,
    pub details: Option<String>,
}

/// Events broadcast to the UI and storage collaborators.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum BotEvent {
    PlyAppended { game_id: String, ply: Ply },
    /// The displayed position changed.
    CursorMoved { index: usize, len: usize },
    Evaluation(EvaluationResult),
    StateChanged(BotState),
    Log(LogEvent),
}

/// Publishing side of the event stream. Cloned into every task.
#[derive(Clone)]
pub struct EventSink {
    events: broadcast::Sender<BotEvent>,
    state: watch::Sender<BotState>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(BotState::Starting);
        Self { events, state }
    }

    /// Nobody listening is fine; events are fire-and-forget.
    pub fn emit(&self, event: BotEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_state(&self, state: BotState) {
        tracing::debug!(?state, "Bot state changed");
        self.state.send_replace(state.clone());
        self.emit(BotEvent::StateChanged(state));
    }

    pub fn state(&self) -> BotState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<BotState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.events.subscribe()
    }

    /// Log through `tracing` and forward to subscribers.
    pub fn log(&self, severity: Severity, message: impl Into<String>, details: Option<String>) {
        let message = message.into();
        match severity {
            Severity::Debug => tracing::debug!(details = ?details, "{message}"),
            Severity::Info => tracing::info!(details = ?details, "{message}"),
            Severity::Warning => tracing::warn!(details = ?details, "{message}"),
            Severity::Error => tracing::error!(details = ?details, "{message}"),
        }
        self.emit(BotEvent::Log(LogEvent {
            severity,
            message,
            details,
        }));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Severity::Info, message, None);
    }

    pub fn warn(&self, message: impl Into<String>, details: impl ToString) {
        self.log(Severity::Warning, message, Some(details.to_string()));
    }

    pub fn error(&self, message: impl Into<String>, details: impl ToString) {
        self.log(Severity::Error, message, Some(details.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_mirrored_to_subscribers() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        let watch = sink.watch_state();

        sink.set_state(BotState::Seeking);

        assert_eq!(*watch.borrow(), BotState::Seeking);
        assert!(matches!(
            rx.try_recv(),
            Ok(BotEvent::StateChanged(BotState::Seeking))
        ));
    }

    #[test]
    fn test_log_carries_details() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.warn("Engine restarted", "timed out after 3s");
        match rx.try_recv() {
            Ok(BotEvent::Log(event)) => {
                assert_eq!(event.severity, Severity::Warning);
                assert_eq!(event.details.as_deref(), Some("timed out after 3s"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventSink::new().info("nobody is listening");
    }
}
