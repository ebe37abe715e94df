//! Move history shared between the game controller, the evaluation loop and
//! viewer navigation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chess::{CursorMove, HistoryError, MoveHistory, PlayerSide, Ply, STARTING_FEN};
use cozy_chess::Board;
use engine::SearchPosition;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("server move {theirs} at ply {ply} differs from recorded {ours}")]
    Diverged {
        ply: usize,
        ours: String,
        theirs: String,
    },
    #[error(transparent)]
    Illegal(#[from] HistoryError),
}

/// Snapshot of the displayed position.
#[derive(Debug, Clone)]
pub struct CursorView {
    pub game_id: Arc<str>,
    pub ply: usize,
    pub start_fen: String,
    pub moves: Vec<String>,
    pub board: Board,
}

impl CursorView {
    pub fn search_position(&self) -> SearchPosition {
        SearchPosition::new(self.start_fen.clone(), self.moves.clone())
    }
}

/// Snapshot of the newest position.
#[derive(Debug, Clone)]
pub struct LiveView {
    pub len: usize,
    pub side_to_move: PlayerSide,
    pub board: Board,
    pub position: SearchPosition,
}

/// One game's [`MoveHistory`] behind a mutex. Every method takes the lock
/// once, so appends and cursor moves are atomic with respect to each other.
#[derive(Debug, Clone)]
pub struct SharedHistory {
    game_id: Arc<str>,
    inner: Arc<Mutex<MoveHistory>>,
    follow_live: bool,
}

impl SharedHistory {
    /// `initial_fen` is a FEN or `startpos`.
    pub fn new(game_id: &str, initial_fen: &str, follow_live: bool) -> Result<Self, HistoryError> {
        let history = match initial_fen.trim() {
            "" | "startpos" => MoveHistory::new(),
            fen if fen == STARTING_FEN => MoveHistory::new(),
            fen => MoveHistory::from_fen(fen)?,
        };
        Ok(Self {
            game_id: game_id.into(),
            inner: Arc::new(Mutex::new(history)),
            follow_live,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MoveHistory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.lock().cursor()
    }

    pub fn is_live(&self) -> bool {
        self.lock().is_live()
    }

    /// Bring the history up to the server's full move list. Moves already
    /// recorded are skipped after checking they match; a shorter list is a
    /// stale replay and changes nothing. The newest appended ply gets the
    /// mover's clock.
    pub fn sync(
        &self,
        moves: &[String],
        white_ms: Option<u64>,
        black_ms: Option<u64>,
    ) -> Result<Vec<Ply>, SyncError> {
        let mut history = self.lock();
        let known = history.len();

        for (i, theirs) in moves.iter().take(known).enumerate() {
            if let Some(ours) = history.ply(i + 1) {
                if ours.uci() != theirs {
                    return Err(SyncError::Diverged {
                        ply: i + 1,
                        ours: ours.uci().to_string(),
                        theirs: theirs.clone(),
                    });
                }
            }
        }
        if moves.len() <= known {
            return Ok(Vec::new());
        }

        let was_live = history.is_live();
        let last = moves.len();
        let mut appended = Vec::with_capacity(last - known);
        for (i, uci) in moves.iter().enumerate().skip(known) {
            let clock = if i + 1 == last {
                match history.side_to_move() {
                    PlayerSide::White => white_ms,
                    PlayerSide::Black => black_ms,
                }
            } else {
                None
            };
            let ply = history.next_ply(uci, clock)?;
            history.append(ply.clone());
            appended.push(ply);
        }

        if was_live && self.follow_live {
            history.move_cursor(CursorMove::ToLive);
        }
        Ok(appended)
    }

    /// Returns `(cursor, len)` after the move.
    pub fn navigate(&self, nav: CursorMove) -> (usize, usize) {
        let mut history = self.lock();
        let cursor = history.move_cursor(nav);
        (cursor, history.len())
    }

    pub fn cursor_view(&self) -> CursorView {
        let history = self.lock();
        let ply = history.cursor();
        CursorView {
            game_id: self.game_id.clone(),
            ply,
            start_fen: history.start_fen().to_string(),
            moves: history.uci_moves(ply),
            board: history.cursor_position().clone(),
        }
    }

    pub fn live_view(&self) -> LiveView {
        let history = self.lock();
        let len = history.len();
        LiveView {
            len,
            side_to_move: history.side_to_move(),
            board: history.live_position().clone(),
            position: SearchPosition::new(history.start_fen(), history.uci_moves(len)),
        }
    }

    /// Detached copy for post-game browsing.
    pub fn snapshot(&self) -> MoveHistory {
        self.lock().clone()
    }
}

/// The history viewers navigate: the active game's, or the last finished
/// game's until the next game starts.
#[derive(Clone)]
pub struct DisplayedHistory {
    tx: Arc<watch::Sender<Option<SharedHistory>>>,
}

impl Default for DisplayedHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayedHistory {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn show(&self, history: SharedHistory) {
        self.tx.send_replace(Some(history));
    }

    pub fn current(&self) -> Option<SharedHistory> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SharedHistory>> {
        self.tx.subscribe()
    }

    pub fn navigate(&self, nav: CursorMove) -> Option<(usize, usize)> {
        self.current().map(|history| history.navigate(nav))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moves(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_duplicate_state_appends_nothing() {
        let history = SharedHistory::new("g1", "startpos", true).unwrap();
        let state = moves(&["e2e4", "e7e5"]);

        assert_eq!(history.sync(&state, Some(60_000), Some(59_000)).unwrap().len(), 2);
        assert!(history.sync(&state, Some(60_000), Some(59_000)).unwrap().is_empty());
        assert!(history.sync(&moves(&["e2e4"]), None, None).unwrap().is_empty());
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_clock_goes_to_last_mover() {
        let history = SharedHistory::new("g1", "startpos", true).unwrap();
        let plies = history
            .sync(&moves(&["e2e4", "e7e5", "g1f3"]), Some(50_000), Some(40_000))
            .unwrap();
        assert_eq!(plies[0].clock_ms(), None);
        assert_eq!(plies[2].clock_ms(), Some(50_000));
        assert_eq!(plies[2].index(), 3);
    }

    #[test]
    fn test_follow_live_keeps_reviewer_in_place() {
        let history = SharedHistory::new("g1", "startpos", true).unwrap();
        history.sync(&moves(&["e2e4"]), None, None).unwrap();
        assert_eq!(history.cursor(), 1);

        history.navigate(CursorMove::ToStart);
        history.sync(&moves(&["e2e4", "e7e5"]), None, None).unwrap();
        assert_eq!(history.cursor(), 0);
        assert_eq!(history.cursor_view().ply, 0);

        let fixed = SharedHistory::new("g2", "startpos", false).unwrap();
        fixed.sync(&moves(&["d2d4"]), None, None).unwrap();
        assert_eq!(fixed.cursor(), 0);
    }

    #[test]
    fn test_divergence_is_reported() {
        let history = SharedHistory::new("g1", "startpos", true).unwrap();
        history.sync(&moves(&["e2e4"]), None, None).unwrap();
        assert!(matches!(
            history.sync(&moves(&["d2d4", "d7d5"]), None, None),
            Err(SyncError::Diverged { ply: 1, .. })
        ));
        assert!(matches!(
            history.sync(&moves(&["e2e4", "e2e4"]), None, None),
            Err(SyncError::Illegal(_))
        ));
    }

    #[test]
    fn test_custom_start_position() {
        let fen = "4k3/8/8/8/8/8/4P3/4K3 w - - 0 1";
        let history = SharedHistory::new("g1", fen, true).unwrap();
        history.sync(&moves(&["e2e4"]), None, None).unwrap();
        let live = history.live_view();
        assert_eq!(live.side_to_move, PlayerSide::Black);
        assert_eq!(live.position.start_fen, fen);
        assert!(live.position.to_uci_command().ends_with("moves e2e4"));
    }

    #[test]
    fn test_concurrent_append_and_navigate() {
        let history = SharedHistory::new("g1", "startpos", true).unwrap();
        let line = moves(&[
            "e2e4", "e7e5", "g1f3", "b8c6", "f1b5", "a7a6", "b5a4", "g8f6", "e1g1", "f8e7",
        ]);

        let reader = {
            let history = history.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let nav = if i % 2 == 0 {
                        CursorMove::Delta(-3)
                    } else {
                        CursorMove::ToLive
                    };
                    let (cursor, len) = history.navigate(nav);
                    assert!(cursor <= len);
                    let view = history.cursor_view();
                    assert_eq!(view.moves.len(), view.ply);
                }
            })
        };
        for n in 1..=line.len() {
            history.sync(&line[..n], None, None).unwrap();
        }
        reader.join().unwrap();
        assert_eq!(history.len(), line.len());
    }

    #[test]
    fn test_displayed_history_navigation() {
        let displayed = DisplayedHistory::new();
        assert_eq!(displayed.navigate(CursorMove::ToStart), None);

        let history = SharedHistory::new("g1", "startpos", true).unwrap();
        history.sync(&moves(&["e2e4", "e7e5"]), None, None).unwrap();
        displayed.show(history);
        assert_eq!(displayed.navigate(CursorMove::Delta(-1)), Some((1, 2)));
        assert_eq!(displayed.navigate(CursorMove::Delta(10)), Some((2, 2)));
    }
}
