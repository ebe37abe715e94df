//! UCI (Universal Chess Interface) utilities

use cozy_chess::{Board, File, Move, Piece, Rank, Square};

use crate::converters::{format_piece, format_square};

/// Convert UCI castling notation to cozy_chess notation
///
/// UCI uses standard notation (king moves 2 squares): e1g1, e1c1, e8g8, e8c8
/// cozy_chess uses king-to-rook notation: e1h1, e1a1, e8h8, e8a8
///
/// This function checks if the move is a castling move and converts it to the
/// appropriate cozy_chess format by finding the matching legal move.
pub fn convert_uci_castling_to_cozy(mv: Move, legal_moves: &[Move]) -> Move {
    let is_rank_1_or_8 = matches!(mv.from.rank(), Rank::First | Rank::Eighth);
    let is_e_file = matches!(mv.from.file(), File::E);
    let is_g_or_c_file = matches!(mv.to.file(), File::G | File::C);

    if is_rank_1_or_8 && is_e_file && is_g_or_c_file && mv.promotion.is_none() {
        let target_square = match (mv.from.rank(), mv.to.file()) {
            (Rank::First, File::G) => Square::new(File::H, Rank::First),
            (Rank::First, File::C) => Square::new(File::A, Rank::First),
            (Rank::Eighth, File::G) => Square::new(File::H, Rank::Eighth),
            (Rank::Eighth, File::C) => Square::new(File::A, Rank::Eighth),
            _ => return mv,
        };

        let converted = Move {
            from: mv.from,
            to: target_square,
            promotion: None,
        };

        if legal_moves.contains(&converted) {
            return converted;
        }
    }

    mv
}

/// Convert a cozy_chess move (king-takes-rook castling) back to standard UCI
/// notation for a board where `mv` is legal.
pub fn to_standard_uci(board: &Board, mv: Move) -> Move {
    let side = board.side_to_move();
    let is_castle = board.piece_on(mv.from) == Some(Piece::King)
        && board.color_on(mv.to) == Some(side)
        && board.piece_on(mv.to) == Some(Piece::Rook);

    if !is_castle {
        return mv;
    }

    let file = if mv.to.file() as usize > mv.from.file() as usize {
        File::G
    } else {
        File::C
    };
    Move {
        from: mv.from,
        to: Square::new(file, mv.from.rank()),
        promotion: None,
    }
}

/// All legal moves in cozy_chess notation.
pub fn legal_moves(board: &Board) -> Vec<Move> {
    let mut moves = Vec::new();
    board.generate_moves(|mvs| {
        moves.extend(mvs);
        false
    });
    moves
}

/// Format a move in UCI notation (e.g., "e2e4", "e7e8q")
pub fn format_uci_move(mv: Move) -> String {
    let mut s = format!("{}{}", format_square(mv.from), format_square(mv.to));
    if let Some(promo) = mv.promotion {
        s.push(format_piece(promo));
    }
    s
}
