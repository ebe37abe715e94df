//! Scripted GameService for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chess::PlayerSide;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::service::*;

pub type Feed<T> = mpsc::UnboundedSender<Result<T, ServiceError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    ValidateCredential,
    StreamAccountEvents,
    CreateSeek(SeekRequest),
    StreamGameState(String),
    SubmitMove { game_id: String, uci: String },
    Resign(String),
    DeclineChallenge { id: String, reason: DeclineReason },
    AcceptChallenge(String),
}

/// Streams are scripted per connection: every call to a streaming method
/// takes the next queued connection, or fails with a network error when
/// none is left. Dropping a connection's sender ends that stream.
pub struct MockService {
    account: AccountInfo,
    call_log: Mutex<Vec<MockCall>>,
    credential_error: Mutex<Option<ServiceError>>,
    account_streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<AccountEvent, ServiceError>>>>,
    game_streams: Mutex<HashMap<String, VecDeque<mpsc::UnboundedReceiver<Result<GameEvent, ServiceError>>>>>,
    submit_results: Mutex<VecDeque<Result<(), ServiceError>>>,
    seek_completes: Mutex<bool>,
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockService {
    pub fn new() -> Self {
        Self {
            account: AccountInfo {
                id: "mockbot".into(),
                username: "MockBot".into(),
            },
            call_log: Mutex::new(Vec::new()),
            credential_error: Mutex::new(None),
            account_streams: Mutex::new(VecDeque::new()),
            game_streams: Mutex::new(HashMap::new()),
            submit_results: Mutex::new(VecDeque::new()),
            seek_completes: Mutex::new(false),
        }
    }

    pub fn account(&self) -> &AccountInfo {
        &self.account
    }

    pub fn reject_credentials(&self) {
        *self.credential_error.lock().unwrap() = Some(ServiceError::Auth("bad token".into()));
    }

    /// Make seeks resolve at once instead of staying open.
    pub fn complete_seeks(&self) {
        *self.seek_completes.lock().unwrap() = true;
    }

    pub fn account_connection(&self) -> Feed<AccountEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.account_streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn game_connection(&self, game_id: &str) -> Feed<GameEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.game_streams
            .lock()
            .unwrap()
            .entry(game_id.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    /// Result of the next submission; submissions succeed when none is queued.
    pub fn push_submit_result(&self, result: Result<(), ServiceError>) {
        self.submit_results.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.call_log.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// Poll the call log until `pred` matches a call.
    pub async fn wait_for(&self, timeout: Duration, pred: impl Fn(&MockCall) -> bool) -> MockCall {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(call) = self.calls().into_iter().find(|c| pred(c)) {
                return call;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "call not seen within {timeout:?}; calls: {:?}",
                self.calls()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn record(&self, call: MockCall) {
        self.call_log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GameService for MockService {
    async fn validate_credential(&self) -> Result<AccountInfo, ServiceError> {
        self.record(MockCall::ValidateCredential);
        match self.credential_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(self.account.clone()),
        }
    }

    async fn stream_account_events(&self) -> Result<EventStream<AccountEvent>, ServiceError> {
        self.record(MockCall::StreamAccountEvents);
        match self.account_streams.lock().unwrap().pop_front() {
            Some(rx) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            None => Err(ServiceError::Network("no account connection scripted".into())),
        }
    }

    async fn create_seek(&self, seek: &SeekRequest) -> Result<(), ServiceError> {
        self.record(MockCall::CreateSeek(seek.clone()));
        let completes = *self.seek_completes.lock().unwrap();
        if !completes {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn stream_game_state(&self, game_id: &str) -> Result<EventStream<GameEvent>, ServiceError> {
        self.record(MockCall::StreamGameState(game_id.to_string()));
        let next = self
            .game_streams
            .lock()
            .unwrap()
            .get_mut(game_id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(rx) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            None => Err(ServiceError::Network(format!("no stream scripted for {game_id}"))),
        }
    }

    async fn submit_move(&self, game_id: &str, uci: &str) -> Result<(), ServiceError> {
        self.record(MockCall::SubmitMove {
            game_id: game_id.to_string(),
            uci: uci.to_string(),
        });
        self.submit_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn resign(&self, game_id: &str) -> Result<(), ServiceError> {
        self.record(MockCall::Resign(game_id.to_string()));
        Ok(())
    }

    async fn decline_challenge(
        &self,
        challenge_id: &str,
        reason: DeclineReason,
    ) -> Result<(), ServiceError> {
        self.record(MockCall::DeclineChallenge {
            id: challenge_id.to_string(),
            reason,
        });
        Ok(())
    }

    async fn accept_challenge(&self, challenge_id: &str) -> Result<(), ServiceError> {
        self.record(MockCall::AcceptChallenge(challenge_id.to_string()));
        Ok(())
    }
}

pub fn game_start(game_id: &str, color: PlayerSide) -> GameStart {
    GameStart {
        game_id: game_id.to_string(),
        color: Some(color),
        opponent: Some("maia1".into()),
        speed: Some("rapid".into()),
        rated: false,
    }
}

pub fn game_state(moves: &[&str], status: GameStatus, winner: Option<PlayerSide>) -> GameState {
    GameState {
        moves: moves.iter().map(|s| s.to_string()).collect(),
        white_time_ms: Some(600_000),
        black_time_ms: Some(600_000),
        status,
        winner,
    }
}

/// Full game description with the mock account playing `color`.
pub fn game_full(game_id: &str, color: PlayerSide, state: GameState) -> GameFull {
    let us = PlayerInfo {
        id: Some("mockbot".into()),
        name: "MockBot".into(),
        rating: Some(1500),
    };
    let them = PlayerInfo {
        id: Some("maia1".into()),
        name: "maia1".into(),
        rating: Some(1500),
    };
    let (white, black) = match color {
        PlayerSide::White => (us, them),
        PlayerSide::Black => (them, us),
    };
    GameFull {
        id: game_id.to_string(),
        white,
        black,
        initial_fen: "startpos".into(),
        rated: false,
        speed: Some("rapid".into()),
        state,
    }
}
