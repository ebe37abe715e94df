pub mod parser;

pub use parser::{parse_uci_message, UciMessage};

#[derive(Debug, thiserror::Error)]
pub enum UciError {
    #[error("Malformed UCI message: {0}")]
    MalformedMessage(String),
    #[error("Unknown UCI message: {0}")]
    UnknownMessage(String),
    #[error("Invalid move in engine output: {0}")]
    InvalidMove(#[from] chess::NotationError),
}
