use cozy_chess::{Board, GameStatus, Move, Piece};

use crate::converters::{file_char, format_piece_upper, format_square, rank_char};
use crate::uci::legal_moves;

/// Format a legal move (cozy_chess notation) as SAN, including check and
/// mate suffixes.
pub fn format_san(board: &Board, mv: Move) -> String {
    let Some(piece) = board.piece_on(mv.from) else {
        return format_square(mv.to);
    };

    let mut san = String::new();
    let side = board.side_to_move();

    if piece == Piece::King && board.color_on(mv.to) == Some(side) {
        san.push_str(if mv.to.file() as usize > mv.from.file() as usize {
            "O-O"
        } else {
            "O-O-O"
        });
    } else {
        let is_capture = board.color_on(mv.to) == Some(!side)
            || (piece == Piece::Pawn && mv.from.file() != mv.to.file());

        if piece == Piece::Pawn {
            if is_capture {
                san.push(file_char(mv.from.file()));
            }
        } else {
            san.push(format_piece_upper(piece));
            san.push_str(&disambiguation(board, mv, piece));
        }

        if is_capture {
            san.push('x');
        }
        san.push_str(&format_square(mv.to));

        if let Some(promo) = mv.promotion {
            san.push('=');
            san.push(format_piece_upper(promo));
        }
    }

    let mut after = board.clone();
    after.play_unchecked(mv);
    if after.status() == GameStatus::Won {
        san.push('#');
    } else if !after.checkers().is_empty() {
        san.push('+');
    }

    san
}

/// File, rank or full square of the origin when another piece of the same
/// kind could also reach the destination.
fn disambiguation(board: &Board, mv: Move, piece: Piece) -> String {
    let rivals: Vec<Move> = legal_moves(board)
        .into_iter()
        .filter(|other| {
            other.to == mv.to && other.from != mv.from && board.piece_on(other.from) == Some(piece)
        })
        .collect();

    if rivals.is_empty() {
        return String::new();
    }

    let same_file = rivals.iter().any(|r| r.from.file() == mv.from.file());
    let same_rank = rivals.iter().any(|r| r.from.rank() == mv.from.rank());

    if !same_file {
        file_char(mv.from.file()).to_string()
    } else if !same_rank {
        rank_char(mv.from.rank()).to_string()
    } else {
        format_square(mv.from)
    }
}
