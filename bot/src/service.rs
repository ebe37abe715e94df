//! Contract of the remote game service.
//!
//! Only the fields the bot consumes are modelled. Implementations translate
//! their wire format into these types.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use chess::PlayerSide;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<T, ServiceError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("move rejected: {0}")]
    InvalidMove(String),
    #[error("not your turn: {0}")]
    NotYourTurn(String),
    #[error("unexpected data from server: {0}")]
    Protocol(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl ServiceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Transport failures worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait GameService: Send + Sync + 'static {
    async fn validate_credential(&self) -> Result<AccountInfo, ServiceError>;

    /// Infinite stream of account notifications. Ends or fails on disconnect;
    /// call again to reconnect.
    async fn stream_account_events(&self) -> Result<EventStream<AccountEvent>, ServiceError>;

    /// Post a seek. Resolves once the seek closes, which for real-time games
    /// means an opponent was found.
    async fn create_seek(&self, seek: &SeekRequest) -> Result<(), ServiceError>;

    /// Finite stream of one game's state. Ends when the game is over; call
    /// again to rejoin.
    async fn stream_game_state(&self, game_id: &str) -> Result<EventStream<GameEvent>, ServiceError>;

    /// Play `uci` (standard UCI notation) in `game_id`.
    async fn submit_move(&self, game_id: &str, uci: &str) -> Result<(), ServiceError>;

    async fn resign(&self, game_id: &str) -> Result<(), ServiceError>;

    async fn decline_challenge(
        &self,
        challenge_id: &str,
        reason: DeclineReason,
    ) -> Result<(), ServiceError>;

    async fn accept_challenge(&self, challenge_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccountEvent {
    GameStart(GameStart),
    GameFinish(GameFinish),
    Challenge(Challenge),
    /// Empty line sent to hold the connection open.
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameStart {
    pub game_id: String,
    pub color: Option<PlayerSide>,
    pub opponent: Option<String>,
    pub speed: Option<String>,
    pub rated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameFinish {
    pub game_id: String,
    pub status: GameStatus,
    pub winner: Option<PlayerSide>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub id: String,
    pub challenger: Option<String>,
    pub variant: String,
    pub speed: Option<String>,
    pub rated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// Complete game description, sent first on every (re)join.
    Full(GameFull),
    /// Move list and clocks after a move or status change.
    State(GameState),
    ChatLine { username: String, text: String },
    OpponentGone { gone: bool },
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameFull {
    pub id: String,
    pub white: PlayerInfo,
    pub black: PlayerInfo,
    /// `startpos` or a FEN.
    pub initial_fen: String,
    pub rated: bool,
    pub speed: Option<String>,
    pub state: GameState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerInfo {
    pub id: Option<String>,
    pub name: String,
    pub rating: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameState {
    /// Every move since the initial position, standard UCI notation.
    pub moves: Vec<String>,
    pub white_time_ms: Option<u64>,
    pub black_time_ms: Option<u64>,
    pub status: GameStatus,
    pub winner: Option<PlayerSide>,
}

impl GameState {
    pub fn clock_for(&self, side: PlayerSide) -> Option<u64> {
        match side {
            PlayerSide::White => self.white_time_ms,
            PlayerSide::Black => self.black_time_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameStatus {
    Created,
    Started,
    Aborted,
    NoStart,
    Mate,
    Resign,
    Stalemate,
    Timeout,
    Draw,
    OutOfTime,
    Cheat,
    VariantEnd,
    UnknownFinish,
}

impl GameStatus {
    /// Status names as the server spells them. Unrecognised names are
    /// treated as an unknown finish.
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "started" => Self::Started,
            "aborted" => Self::Aborted,
            "noStart" => Self::NoStart,
            "mate" => Self::Mate,
            "resign" => Self::Resign,
            "stalemate" => Self::Stalemate,
            "timeout" => Self::Timeout,
            "draw" => Self::Draw,
            "outoftime" => Self::OutOfTime,
            "cheat" => Self::Cheat,
            "variantEnd" => Self::VariantEnd,
            _ => Self::UnknownFinish,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Aborted => "aborted",
            Self::NoStart => "noStart",
            Self::Mate => "mate",
            Self::Resign => "resign",
            Self::Stalemate => "stalemate",
            Self::Timeout => "timeout",
            Self::Draw => "draw",
            Self::OutOfTime => "outoftime",
            Self::Cheat => "cheat",
            Self::VariantEnd => "variantEnd",
            Self::UnknownFinish => "unknownFinish",
        }
    }

    pub fn is_ongoing(&self) -> bool {
        matches!(self, Self::Created | Self::Started)
    }

    /// The game ended without counting: nobody moved in time, or it was
    /// aborted.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted | Self::NoStart)
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    Generic,
    Later,
    Variant,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Later => "later",
            Self::Variant => "variant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeekRequest {
    pub time_control: TimeControl,
    pub rated: bool,
    pub color: SeekColor,
    pub variant: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeekColor {
    #[default]
    Random,
    White,
    Black,
}

impl SeekColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::White => "white",
            Self::Black => "black",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Rapid,
    Classical,
    Correspondence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    RealTime { minutes: u32, increment_secs: u32 },
    Correspondence { days: u32 },
}

/// A seekable time control, written `minutes+increment` or `N day(s)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeControl {
    clock: Clock,
}

impl TimeControl {
    /// Time controls offered for board play.
    pub const CATALOGUE: &'static [&'static str] = &[
        "15+10", "10+5", "10+0", "15+0", "30+0", "30+20", "45+45", "1 day", "3 days", "7 days",
    ];

    pub fn realtime(minutes: u32, increment_secs: u32) -> Self {
        Self {
            clock: Clock::RealTime {
                minutes,
                increment_secs,
            },
        }
    }

    pub fn correspondence(days: u32) -> Self {
        Self {
            clock: Clock::Correspondence { days },
        }
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Speed class from the estimated game duration (initial time plus 40
    /// increments). Faster than rapid is `None`.
    pub fn speed(&self) -> Option<Speed> {
        match self.clock {
            Clock::Correspondence { .. } => Some(Speed::Correspondence),
            Clock::RealTime {
                minutes,
                increment_secs,
            } => {
                let estimate = u64::from(minutes) * 60 + u64::from(increment_secs) * 40;
                match estimate {
                    0..=479 => None,
                    480..=1499 => Some(Speed::Rapid),
                    _ => Some(Speed::Classical),
                }
            }
        }
    }
}

impl Default for TimeControl {
    fn default() -> Self {
        Self::realtime(10, 5)
    }
}

impl std::str::FromStr for TimeControl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidTimeControl(s.to_string());
        if let Some((minutes, increment)) = s.split_once('+') {
            let minutes = minutes.trim().parse().map_err(|_| invalid())?;
            let increment = increment.trim().parse().map_err(|_| invalid())?;
            let tc = Self::realtime(minutes, increment);
            return match tc.speed() {
                Some(_) => Ok(tc),
                None => Err(ConfigError::TooFast(s.to_string())),
            };
        }
        let days = s
            .strip_suffix("days")
            .or_else(|| s.strip_suffix("day"))
            .ok_or_else(invalid)?;
        match days.trim().parse() {
            Ok(days) if days > 0 => Ok(Self::correspondence(days)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for TimeControl {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeControl> for String {
    fn from(tc: TimeControl) -> Self {
        tc.to_string()
    }
}

impl fmt::Display for TimeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.clock {
            Clock::RealTime {
                minutes,
                increment_secs,
            } => write!(f, "{minutes}+{increment_secs}"),
            Clock::Correspondence { days: 1 } => f.write_str("1 day"),
            Clock::Correspondence { days } => write!(f, "{days} days"),
        }
    }
}
