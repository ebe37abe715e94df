//! Evaluation score shared by the engine adapter and the bot.

use cozy_chess::{Board, Color, GameStatus};
use serde::{Deserialize, Serialize};

/// Engine evaluation score.
///
/// Centipawns: positive = side-to-move is better.
/// Mate: positive N = side-to-move mates in N moves,
/// negative N = side-to-move gets mated in N moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisScore {
    Centipawns(i32),
    Mate(i32),
}

impl AnalysisScore {
    pub fn display(&self) -> String {
        match self {
            Self::Centipawns(cp) => format!("{:+.2}", *cp as f64 / 100.0),
            Self::Mate(m) => {
                if *m > 0 {
                    format!("+M{}", m)
                } else {
                    format!("-M{}", m.abs())
                }
            }
        }
    }

    /// Negate the score (flip perspective).
    pub fn negate(&self) -> Self {
        match self {
            Self::Centipawns(cp) => Self::Centipawns(-cp),
            Self::Mate(m) => Self::Mate(-m),
        }
    }

    /// Re-express a side-to-move score from White's point of view.
    pub fn to_white_pov(self, side_to_move: Color) -> Self {
        match side_to_move {
            Color::White => self,
            Color::Black => self.negate(),
        }
    }

    /// Score of a finished position without consulting an engine, from the
    /// side-to-move's point of view. `None` while the game is ongoing.
    pub fn terminal(board: &Board) -> Option<Self> {
        match board.status() {
            GameStatus::Won => Some(Self::Mate(0)),
            GameStatus::Drawn => Some(Self::Centipawns(0)),
            GameStatus::Ongoing => None,
        }
    }
}

impl std::fmt::Display for AnalysisScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}
