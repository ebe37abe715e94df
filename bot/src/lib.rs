//! Orchestration core of an autonomous chess bot.
//!
//! The [`supervisor`] seeks games on a [`GameService`], plays them one at a
//! time with a UCI engine and evaluates the displayed position on a second
//! engine. Observers follow along through [`BotHandle`].

pub mod config;
mod consumer;
pub mod error;
mod evaluation;
pub mod events;
pub mod handle;
pub mod history;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod timing;

#[cfg(test)]
mod testing;

pub use config::{BotConfig, ChallengePolicy};
pub use error::{BotError, ConfigError};
pub use events::{BotEvent, BotState, EvaluationResult, EventSink, LogEvent, Severity};
pub use handle::BotHandle;
pub use history::{DisplayedHistory, SharedHistory, SyncError};
pub use service::{
    AccountEvent, AccountInfo, Challenge, DeclineReason, EventStream, GameEvent, GameFinish,
    GameFull, GameService, GameStart, GameState, GameStatus, PlayerInfo, SeekColor, SeekRequest,
    ServiceError, TimeControl,
};
pub use session::{ControllerState, EndReason, GameResult, Session, SessionOutcome, SessionStatus};
pub use supervisor::spawn;
pub use timing::{allot, MovePlan, TimingConfig, TimingRange};
