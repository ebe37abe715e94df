//! Lichess Board API implementation of [`bot::GameService`].

pub mod client;
pub mod wire;

pub use client::{LichessClient, LICHESS_URL};
