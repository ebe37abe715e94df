//! Conversions between cozy-chess types and their text forms.

use cozy_chess::{File, Move, Piece, Rank, Square};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotationError {
    #[error("Invalid move: {0}")]
    InvalidMove(String),
    #[error("Invalid square: {0}")]
    InvalidSquare(String),
    #[error("Invalid promotion: {0}")]
    InvalidPromotion(String),
}

/// Parse UCI move format (e2e4, e7e8q).
///
/// The result is in UCI notation; castling still needs
/// [`crate::convert_uci_castling_to_cozy`] before it can be played on a board.
pub fn parse_uci_move(s: &str) -> Result<Move, NotationError> {
    if !s.is_ascii() || !(4..=5).contains(&s.len()) {
        return Err(NotationError::InvalidMove(s.to_string()));
    }

    let from = parse_square(&s[0..2])?;
    let to = parse_square(&s[2..4])?;

    let promotion = match s.get(4..5) {
        Some(p) => Some(match p {
            "q" => Piece::Queen,
            "r" => Piece::Rook,
            "b" => Piece::Bishop,
            "n" => Piece::Knight,
            _ => return Err(NotationError::InvalidPromotion(s.to_string())),
        }),
        None => None,
    };

    Ok(Move {
        from,
        to,
        promotion,
    })
}

pub fn parse_square(s: &str) -> Result<Square, NotationError> {
    let mut chars = s.chars();
    let (Some(f), Some(r), None) = (chars.next(), chars.next(), chars.next()) else {
        return Err(NotationError::InvalidSquare(s.to_string()));
    };

    let file = match f {
        'a' => File::A,
        'b' => File::B,
        'c' => File::C,
        'd' => File::D,
        'e' => File::E,
        'f' => File::F,
        'g' => File::G,
        'h' => File::H,
        _ => return Err(NotationError::InvalidSquare(s.to_string())),
    };

    let rank = match r {
        '1' => Rank::First,
        '2' => Rank::Second,
        '3' => Rank::Third,
        '4' => Rank::Fourth,
        '5' => Rank::Fifth,
        '6' => Rank::Sixth,
        '7' => Rank::Seventh,
        '8' => Rank::Eighth,
        _ => return Err(NotationError::InvalidSquare(s.to_string())),
    };

    Ok(Square::new(file, rank))
}

pub fn format_square(sq: Square) -> String {
    format!("{}{}", file_char(sq.file()), rank_char(sq.rank()))
}

pub fn file_char(file: File) -> char {
    match file {
        File::A => 'a',
        File::B => 'b',
        File::C => 'c',
        File::D => 'd',
        File::E => 'e',
        File::F => 'f',
        File::G => 'g',
        File::H => 'h',
    }
}

pub fn rank_char(rank: Rank) -> char {
    match rank {
        Rank::First => '1',
        Rank::Second => '2',
        Rank::Third => '3',
        Rank::Fourth => '4',
        Rank::Fifth => '5',
        Rank::Sixth => '6',
        Rank::Seventh => '7',
        Rank::Eighth => '8',
    }
}

/// Lowercase piece letter as used in UCI promotions.
pub fn format_piece(piece: Piece) -> char {
    match piece {
        Piece::Pawn => 'p',
        Piece::Knight => 'n',
        Piece::Bishop => 'b',
        Piece::Rook => 'r',
        Piece::Queen => 'q',
        Piece::King => 'k',
    }
}

pub fn format_piece_upper(piece: Piece) -> char {
    format_piece(piece).to_ascii_uppercase()
}
