//! Producing and submitting one own move.

use std::sync::Arc;
use std::time::Duration;

use chess::{convert_uci_castling_to_cozy, format_uci_move, legal_moves};
use cozy_chess::Board;
use engine::{EngineError, EngineHandle, EngineSpec, EngineTimeouts, Readiness, SearchPosition};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::EventSink;
use crate::service::{GameService, ServiceError};
use crate::timing::MovePlan;

const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(500);

pub(crate) const PLAYING_LABEL: &str = "playing";

/// Everything a turn needs, detached from the controller so the turn can
/// run as its own task.
pub(super) struct TurnRequest {
    pub service: Arc<dyn GameService>,
    pub events: EventSink,
    pub game_id: String,
    /// History length the move is computed for.
    pub ply_count: usize,
    pub position: SearchPosition,
    pub board: Board,
    pub plan: MovePlan,
    pub engine_spec: EngineSpec,
    pub timeouts: EngineTimeouts,
    pub game_over: watch::Receiver<bool>,
}

#[derive(Debug)]
pub(super) enum TurnResult {
    Submitted(String),
    /// The server refused the move: our board is out of date.
    Rejected(String),
    NotYourTurn,
    /// The game ended while the move was being paced.
    Abandoned,
    SubmitFailed(ServiceError),
    /// No usable move even after one engine restart.
    EngineFailed(EngineError),
}

pub(super) struct TurnOutcome {
    pub ply_count: usize,
    /// The playing engine, if it is still usable.
    pub engine: Option<EngineHandle>,
    pub result: TurnResult,
}

/// A spawned turn. Dropping it aborts the task, which kills an engine it
/// still holds.
pub(super) struct TurnTask {
    ply_count: usize,
    handle: JoinHandle<TurnOutcome>,
}

impl TurnTask {
    pub fn spawn(request: TurnRequest, engine: Option<EngineHandle>) -> Self {
        let ply_count = request.ply_count;
        Self {
            ply_count,
            handle: tokio::spawn(play_turn(request, engine)),
        }
    }

    pub async fn join(&mut self) -> TurnOutcome {
        match (&mut self.handle).await {
            Ok(outcome) => outcome,
            Err(e) => TurnOutcome {
                ply_count: self.ply_count,
                engine: None,
                result: TurnResult::EngineFailed(EngineError::Protocol(format!(
                    "turn task failed: {e}"
                ))),
            },
        }
    }
}

impl Drop for TurnTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn play_turn(request: TurnRequest, engine: Option<EngineHandle>) -> TurnOutcome {
    let started = Instant::now();
    let ply_count = request.ply_count;

    let (engine, uci) = match search(&request, engine).await {
        Ok(found) => found,
        Err((engine, e)) => {
            return TurnOutcome {
                ply_count,
                engine,
                result: TurnResult::EngineFailed(e),
            }
        }
    };

    if let Some(pace) = request.plan.pace {
        let remaining = pace.saturating_sub(started.elapsed());
        let mut game_over = request.game_over.clone();
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            Ok(_) = game_over.wait_for(|over| *over) => {
                return TurnOutcome { ply_count, engine: Some(engine), result: TurnResult::Abandoned };
            }
        }
    }

    let result = submit(&request, &uci).await;
    TurnOutcome {
        ply_count,
        engine: Some(engine),
        result,
    }
}

type SearchFailure = (Option<EngineHandle>, EngineError);

/// Ask the engine for a move, replacing a hung or crashed process once.
async fn search(
    request: &TurnRequest,
    engine: Option<EngineHandle>,
) -> Result<(EngineHandle, String), SearchFailure> {
    let mut engine = match engine {
        Some(engine) => engine,
        None => start_engine(request).await.map_err(|e| (None, e))?,
    };
    let mut restarted = false;

    loop {
        let err = match engine.request_move(&request.position, request.plan.limit).await {
            Ok(found) => match legal_uci(&request.board, found.best_move) {
                Some(uci) => {
                    tracing::info!(
                        ply = request.ply_count + 1,
                        mv = %uci,
                        score = ?found.score,
                        depth = ?found.depth,
                        elapsed_ms = found.elapsed.as_millis() as u64,
                        "Engine chose move"
                    );
                    return Ok((engine, uci));
                }
                None => EngineError::Protocol(format!(
                    "illegal move {}",
                    format_uci_move(found.best_move)
                )),
            },
            Err(e) => e,
        };

        if restarted || !err.needs_restart() {
            request.events.error("Engine could not produce a move", &err);
            return Err((usable(engine).await, err));
        }

        request.events.warn("Restarting playing engine", &err);
        engine.stop().await;
        engine = start_engine(request).await.map_err(|e| (None, e))?;
        restarted = true;
    }
}

async fn start_engine(request: &TurnRequest) -> Result<EngineHandle, EngineError> {
    let engine = EngineHandle::start(&request.engine_spec, PLAYING_LABEL, request.timeouts).await?;
    engine.new_game().await?;
    Ok(engine)
}

/// Keep the handle only while its process can take another request.
async fn usable(engine: EngineHandle) -> Option<EngineHandle> {
    if engine.readiness() == Readiness::Ready {
        Some(engine)
    } else {
        engine.stop().await;
        None
    }
}

/// Standard UCI text of `mv` when it is legal on `board`.
fn legal_uci(board: &Board, mv: cozy_chess::Move) -> Option<String> {
    let board_move = convert_uci_castling_to_cozy(mv, &legal_moves(board));
    board.is_legal(board_move).then(|| format_uci_move(mv))
}

async fn submit(request: &TurnRequest, uci: &str) -> TurnResult {
    let mut retried = false;
    loop {
        match request.service.submit_move(&request.game_id, uci).await {
            Ok(()) => return TurnResult::Submitted(uci.to_string()),
            Err(e) if e.is_transient() && !retried => {
                request.events.warn("Move submission failed, retrying", &e);
                retried = true;
                tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
            }
            Err(ServiceError::InvalidMove(reason)) => return TurnResult::Rejected(reason),
            Err(ServiceError::NotYourTurn(_)) => return TurnResult::NotYourTurn,
            Err(e) => return TurnResult::SubmitFailed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_uci_accepts_standard_castling() {
        let board: Board = "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 0 1".parse().unwrap();
        let castle = chess::parse_uci_move("e1g1").unwrap();
        assert_eq!(legal_uci(&board, castle).as_deref(), Some("e1g1"));

        let illegal = chess::parse_uci_move("e1e3").unwrap();
        assert_eq!(legal_uci(&board, illegal), None);
    }
}
