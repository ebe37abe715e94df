//! Move history with precomputed position snapshots and a display cursor.
//!
//! Plies are append-only. Each ply stores the board reached after it, so any
//! index can be displayed without replaying moves. The cursor is independent
//! of appends: a viewer reviewing ply 12 stays on ply 12 while new plies
//! arrive. "Live" means `cursor == len`.

use std::time::SystemTime;

use cozy_chess::{Board, Move};

use crate::converters::parse_uci_move;
use crate::fen::{format_fen, parse_fen, FenError};
use crate::san::format_san;
use crate::types::PlayerSide;
use crate::uci::{convert_uci_castling_to_cozy, format_uci_move, legal_moves, to_standard_uci};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("Invalid move notation: {0}")]
    InvalidNotation(String),
    #[error("Illegal move {uci} at ply {ply}")]
    IllegalMove { ply: usize, uci: String },
    #[error(transparent)]
    Fen(#[from] FenError),
}

/// One half-move. Immutable once built.
#[derive(Debug, Clone)]
pub struct Ply {
    index: usize,
    mv: Move,
    uci: String,
    san: String,
    position: Board,
    clock_ms: Option<u64>,
    timestamp: SystemTime,
}

impl Ply {
    /// 1-based sequence index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The move in cozy_chess (king-takes-rook castling) notation.
    pub fn board_move(&self) -> Move {
        self.mv
    }

    /// The move in standard UCI notation.
    pub fn uci(&self) -> &str {
        &self.uci
    }

    pub fn san(&self) -> &str {
        &self.san
    }

    /// Board reached after this ply.
    pub fn position(&self) -> &Board {
        &self.position
    }

    /// Clock remaining for the side that just moved, when known.
    pub fn clock_ms(&self) -> Option<u64> {
        self.clock_ms
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn mover(&self) -> PlayerSide {
        PlayerSide::from(!self.position.side_to_move())
    }
}

/// Cursor navigation requests. All of them clamp into `[0, len]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    Delta(i64),
    To(usize),
    ToStart,
    ToLive,
}

#[derive(Debug, Clone)]
pub struct MoveHistory {
    start: Board,
    start_fen: String,
    plies: Vec<Ply>,
    cursor: usize,
}

impl Default for MoveHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl MoveHistory {
    /// History starting from the standard initial position.
    pub fn new() -> Self {
        let start = Board::default();
        Self {
            start_fen: format_fen(&start),
            start,
            plies: Vec::new(),
            cursor: 0,
        }
    }

    pub fn from_fen(fen: &str) -> Result<Self, HistoryError> {
        let start = parse_fen(fen)?;
        Ok(Self {
            start_fen: format_fen(&start),
            start,
            plies: Vec::new(),
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.plies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plies.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_live(&self) -> bool {
        self.cursor == self.plies.len()
    }

    pub fn start_fen(&self) -> &str {
        &self.start_fen
    }

    pub fn plies(&self) -> &[Ply] {
        &self.plies
    }

    /// Ply by 1-based index.
    pub fn ply(&self, index: usize) -> Option<&Ply> {
        index.checked_sub(1).and_then(|i| self.plies.get(i))
    }

    pub fn last(&self) -> Option<&Ply> {
        self.plies.last()
    }

    /// Board after `index` plies; index 0 is the starting position.
    pub fn position_at(&self, index: usize) -> Option<&Board> {
        match index {
            0 => Some(&self.start),
            i => self.plies.get(i - 1).map(|p| &p.position),
        }
    }

    pub fn live_position(&self) -> &Board {
        self.plies.last().map_or(&self.start, |p| &p.position)
    }

    pub fn cursor_position(&self) -> &Board {
        self.position_at(self.cursor).unwrap_or(&self.start)
    }

    pub fn side_to_move(&self) -> PlayerSide {
        PlayerSide::from(self.live_position().side_to_move())
    }

    /// Standard-UCI moves of plies `1..=upto` (clamped to the history length).
    pub fn uci_moves(&self, upto: usize) -> Vec<String> {
        self.plies
            .iter()
            .take(upto)
            .map(|p| p.uci.clone())
            .collect()
    }

    /// Build the next ply from a standard-UCI move played on the live position.
    pub fn next_ply(&self, uci: &str, clock_ms: Option<u64>) -> Result<Ply, HistoryError> {
        let index = self.plies.len() + 1;
        let board = self.live_position();

        let parsed =
            parse_uci_move(uci).map_err(|_| HistoryError::InvalidNotation(uci.to_string()))?;
        let mv = convert_uci_castling_to_cozy(parsed, &legal_moves(board));
        if !board.is_legal(mv) {
            return Err(HistoryError::IllegalMove {
                ply: index,
                uci: uci.to_string(),
            });
        }

        let san = format_san(board, mv);
        let uci = format_uci_move(to_standard_uci(board, mv));
        let mut position = board.clone();
        position.play_unchecked(mv);

        Ok(Ply {
            index,
            mv,
            uci,
            san,
            position,
            clock_ms,
            timestamp: SystemTime::now(),
        })
    }

    /// Append a ply built by [`MoveHistory::next_ply`]. Never moves the cursor.
    pub fn append(&mut self, ply: Ply) {
        debug_assert_eq!(ply.index, self.plies.len() + 1, "ply appended out of order");
        self.plies.push(ply);
    }

    /// Parse, validate and append in one step.
    pub fn push_uci(&mut self, uci: &str, clock_ms: Option<u64>) -> Result<&Ply, HistoryError> {
        let ply = self.next_ply(uci, clock_ms)?;
        self.append(ply);
        Ok(&self.plies[self.plies.len() - 1])
    }

    /// Move the display cursor, clamped into `[0, len]`. Returns the new cursor.
    pub fn move_cursor(&mut self, nav: CursorMove) -> usize {
        let len = self.plies.len();
        self.cursor = match nav {
            CursorMove::ToStart => 0,
            CursorMove::ToLive => len,
            CursorMove::To(index) => index.min(len),
            CursorMove::Delta(delta) => {
                let target = (self.cursor as i64).saturating_add(delta);
                target.clamp(0, len as i64) as usize
            }
        };
        self.cursor
    }
}
