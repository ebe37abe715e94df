//! UCI engine process adapter.
//!
//! [`EngineHandle`] owns one engine subprocess. Requests are serialized
//! through the handle: the UCI protocol is stateful and single-threaded, so
//! concurrent callers queue instead of interleaving.

pub mod error;
pub mod handle;
pub mod options;
mod process;
pub mod uci;

#[cfg(all(unix, any(test, feature = "mock")))]
pub mod testing;

use std::path::PathBuf;
use std::time::Duration;

use chess::AnalysisScore;
use cozy_chess::Move;
use serde::{Deserialize, Serialize};

pub use error::EngineError;
pub use handle::EngineHandle;
pub use options::{OptionError, OptionKind, OptionSchema, OptionSpec, OptionValue};
pub use uci::{UciError, UciMessage};

/// How to launch an engine and which options to request from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Requested option values, validated against the engine's advertised
    /// schema during the handshake.
    pub options: std::collections::BTreeMap<String, String>,
}

impl EngineSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }
}

/// Bounded waits for every protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTimeouts {
    /// `uci` -> `uciok` and `isready` -> `readyok` during launch.
    pub handshake_ms: u64,
    /// Added to a timed move budget before the request is declared hung.
    pub move_grace_ms: u64,
    /// Whole-request limit for single-node searches.
    pub single_node_ms: u64,
    /// Upper bound on one evaluation search before it is stopped.
    pub evaluation_max_ms: u64,
    /// `stop` -> `bestmove` while draining a cancelled search.
    pub drain_ms: u64,
    /// `quit` -> process exit before the process is killed.
    pub stop_grace_ms: u64,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            handshake_ms: 10_000,
            move_grace_ms: 5_000,
            single_node_ms: 10_000,
            evaluation_max_ms: 60_000,
            drain_ms: 2_000,
            stop_grace_ms: 1_000,
        }
    }
}

impl EngineTimeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn evaluation_max(&self) -> Duration {
        Duration::from_millis(self.evaluation_max_ms)
    }

    /// Total wait for a move request under `limit`.
    pub fn move_deadline(&self, limit: SearchLimit) -> Duration {
        match limit {
            SearchLimit::MoveTime(budget) => budget + Duration::from_millis(self.move_grace_ms),
            SearchLimit::SingleNode => Duration::from_millis(self.single_node_ms),
        }
    }
}

/// Position to search: a start FEN plus the moves played from it, so the
/// engine sees repetition history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPosition {
    pub start_fen: String,
    /// Standard UCI notation.
    pub moves: Vec<String>,
}

impl SearchPosition {
    pub fn new(start_fen: impl Into<String>, moves: Vec<String>) -> Self {
        Self {
            start_fen: start_fen.into(),
            moves,
        }
    }

    pub fn to_uci_command(&self) -> String {
        let mut cmd = if self.start_fen == chess::STARTING_FEN {
            "position startpos".to_string()
        } else {
            format!("position fen {}", self.start_fen)
        };
        if !self.moves.is_empty() {
            cmd.push_str(" moves");
            for mv in &self.moves {
                cmd.push(' ');
                cmd.push_str(mv);
            }
        }
        cmd
    }
}

/// Search mode for a move request.
///
/// Single-node is a distinct mode rather than a zero budget: several
/// engines read `movetime 0` as "think forever".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchLimit {
    MoveTime(Duration),
    SingleNode,
}

impl SearchLimit {
    pub fn to_go_command(&self) -> String {
        match self {
            Self::MoveTime(budget) => format!("go movetime {}", budget.as_millis().max(1)),
            Self::SingleNode => "go nodes 1".to_string(),
        }
    }
}

/// Lifecycle of an engine process as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Starting,
    Ready,
    Busy,
    Faulted,
    Stopped,
}

/// Engine analysis information
#[derive(Debug, Clone, Default)]
pub struct EngineInfo {
    pub depth: Option<u8>,
    pub seldepth: Option<u8>,
    pub time_ms: Option<u64>,
    pub nodes: Option<u64>,
    /// From the side to move's point of view.
    pub score: Option<AnalysisScore>,
    pub pv: Vec<Move>, // Principal variation
    pub multipv: Option<u8>,
    pub currmove: Option<Move>,
    pub hashfull: Option<u16>,
    pub nps: Option<u64>,
}

/// Answer to a move request. Moves are in standard UCI notation.
#[derive(Debug, Clone)]
pub struct MoveResult {
    pub best_move: Move,
    pub ponder: Option<Move>,
    pub score: Option<AnalysisScore>,
    pub depth: Option<u8>,
    pub pv: Vec<Move>,
    pub elapsed: Duration,
}

/// Latest figures of an evaluation search when it ended.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    /// From the side to move's point of view.
    pub score: Option<AnalysisScore>,
    pub depth: Option<u8>,
    pub pv: Vec<Move>,
    /// True when the engine finished on its own rather than being stopped.
    pub completed: bool,
}

/// `id name` / `id author` reported during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineIdentity {
    pub name: Option<String>,
    pub author: Option<String>,
}
