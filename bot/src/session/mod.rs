//! One game from start to finish.

mod controller;
mod turn;

use chess::{MoveHistory, PlayerSide};
use serde::Serialize;

use crate::service::GameStatus;

pub(crate) use controller::{run_game, GameContext};
pub(crate) use turn::PLAYING_LABEL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Seeking,
    Active,
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub game_id: String,
    pub opponent: Option<String>,
    /// `None` until the game description names our side.
    pub color: Option<PlayerSide>,
    pub speed: Option<String>,
    pub rated: bool,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    AwaitingFirstState,
    OwnTurnPending,
    WaitingOpponent,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GameResult {
    Win,
    Loss,
    Draw,
    /// Aborted or never started; not counted.
    Aborted,
    Unknown,
}

impl GameResult {
    pub fn decide(status: GameStatus, winner: Option<PlayerSide>, color: Option<PlayerSide>) -> Self {
        if status.is_aborted() {
            return Self::Aborted;
        }
        match (winner, color) {
            (Some(winner), Some(color)) if winner == color => Self::Win,
            (Some(_), Some(_)) => Self::Loss,
            (Some(_), None) => Self::Unknown,
            (None, _) if status.is_ongoing() || status == GameStatus::UnknownFinish => {
                Self::Unknown
            }
            (None, _) => Self::Draw,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// The server reported a final status.
    GameOver(GameStatus),
    /// We resigned after the engine could not produce a move.
    Resigned,
    /// The game stream closed or could not be rejoined.
    StreamEnded,
    /// The game could not be played at all.
    Abandoned(String),
}

/// What a finished controller hands back.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: Session,
    pub result: GameResult,
    pub reason: EndReason,
    /// Read-only copy for post-game browsing.
    pub history: Option<MoveHistory>,
}
