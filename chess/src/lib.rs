pub mod analysis;
pub mod converters;
pub mod fen;
pub mod history;
pub mod san;
pub mod types;
pub mod uci;

pub use analysis::AnalysisScore;
pub use converters::*;
pub use fen::{format_fen, parse_fen, FenError, STARTING_FEN};
pub use history::{CursorMove, HistoryError, MoveHistory, Ply};
pub use san::format_san;
pub use types::PlayerSide;
pub use uci::{convert_uci_castling_to_cozy, format_uci_move, legal_moves, to_standard_uci};
