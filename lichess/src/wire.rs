//! Board API payloads and their translation into the bot's event types.
//!
//! Only the fields the bot consumes are decoded; everything else the server
//! sends is ignored.

use bot::{
    AccountEvent, AccountInfo, Challenge, GameEvent, GameFinish, GameFull, GameStart, GameState,
    GameStatus, PlayerInfo, ServiceError,
};
use chess::PlayerSide;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct AccountPayload {
    pub id: String,
    pub username: String,
}

impl From<AccountPayload> for AccountInfo {
    fn from(p: AccountPayload) -> Self {
        Self {
            id: p.id,
            username: p.username,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum AccountLine {
    GameStart { game: GameRef },
    GameFinish { game: GameRef },
    Challenge { challenge: ChallengePayload },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameRef {
    game_id: String,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    opponent: Option<Opponent>,
    #[serde(default)]
    speed: Option<String>,
    #[serde(default)]
    rated: bool,
    #[serde(default)]
    status: Option<StatusPayload>,
    #[serde(default)]
    winner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Opponent {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    ai: Option<u8>,
}

/// `{"id": 30, "name": "mate"}` in account events, a bare name elsewhere.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusPayload {
    Named { name: String },
    Bare(String),
}

impl StatusPayload {
    fn status(&self) -> GameStatus {
        match self {
            Self::Named { name } | Self::Bare(name) => GameStatus::parse(name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChallengePayload {
    id: String,
    #[serde(default)]
    challenger: Option<ChallengerPayload>,
    #[serde(default)]
    variant: Option<VariantPayload>,
    #[serde(default)]
    speed: Option<String>,
    #[serde(default)]
    rated: bool,
}

#[derive(Debug, Deserialize)]
struct ChallengerPayload {
    #[serde(alias = "username")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct VariantPayload {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum GameLine {
    GameFull(Box<GameFullPayload>),
    GameState(StatePayload),
    ChatLine { username: String, text: String },
    OpponentGone { gone: bool },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GameFullPayload {
    id: String,
    #[serde(default)]
    rated: bool,
    #[serde(default)]
    speed: Option<String>,
    #[serde(default)]
    white: PlayerPayload,
    #[serde(default)]
    black: PlayerPayload,
    #[serde(default = "startpos")]
    initial_fen: String,
    state: StatePayload,
}

fn startpos() -> String {
    "startpos".into()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    rating: Option<u32>,
    #[serde(default)]
    ai_level: Option<u8>,
}

impl From<PlayerPayload> for PlayerInfo {
    fn from(p: PlayerPayload) -> Self {
        let name = match (p.name, p.ai_level) {
            (Some(name), _) => name,
            (None, Some(level)) => format!("Stockfish level {level}"),
            (None, None) => String::new(),
        };
        Self {
            id: p.id,
            name,
            rating: p.rating,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatePayload {
    #[serde(default)]
    moves: String,
    #[serde(default)]
    wtime: Option<u64>,
    #[serde(default)]
    btime: Option<u64>,
    status: String,
    #[serde(default)]
    winner: Option<String>,
}

impl From<StatePayload> for GameState {
    fn from(p: StatePayload) -> Self {
        Self {
            moves: p.moves.split_whitespace().map(str::to_string).collect(),
            white_time_ms: p.wtime,
            black_time_ms: p.btime,
            status: GameStatus::parse(&p.status),
            winner: p.winner.as_deref().and_then(PlayerSide::parse),
        }
    }
}

fn malformed(line: &str, err: serde_json::Error) -> ServiceError {
    let shown: String = line.chars().take(120).collect();
    ServiceError::Protocol(format!("{err}: {shown}"))
}

/// Decode one line of the account event stream. Blank lines are keepalives;
/// event types the bot does not handle decode to `None`.
pub fn parse_account_line(line: &str) -> Result<Option<AccountEvent>, ServiceError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Some(AccountEvent::KeepAlive));
    }
    let parsed: AccountLine = serde_json::from_str(line).map_err(|e| malformed(line, e))?;
    Ok(match parsed {
        AccountLine::GameStart { game } => Some(AccountEvent::GameStart(GameStart {
            color: game.color.as_deref().and_then(PlayerSide::parse),
            opponent: game.opponent.and_then(|o| match (o.username, o.ai) {
                (Some(name), _) => Some(name),
                (None, Some(level)) => Some(format!("Stockfish level {level}")),
                (None, None) => None,
            }),
            speed: game.speed,
            rated: game.rated,
            game_id: game.game_id,
        })),
        AccountLine::GameFinish { game } => Some(AccountEvent::GameFinish(GameFinish {
            status: game
                .status
                .as_ref()
                .map_or(GameStatus::UnknownFinish, StatusPayload::status),
            winner: game.winner.as_deref().and_then(PlayerSide::parse),
            game_id: game.game_id,
        })),
        AccountLine::Challenge { challenge } => Some(AccountEvent::Challenge(Challenge {
            id: challenge.id,
            challenger: challenge.challenger.map(|c| c.name),
            variant: challenge
                .variant
                .map_or_else(|| "standard".to_string(), |v| v.key),
            speed: challenge.speed,
            rated: challenge.rated,
        })),
        AccountLine::Other => {
            tracing::trace!(line, "Unhandled account event");
            None
        }
    })
}

/// Decode one line of a game stream.
pub fn parse_game_line(line: &str) -> Result<Option<GameEvent>, ServiceError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Some(GameEvent::KeepAlive));
    }
    let parsed: GameLine = serde_json::from_str(line).map_err(|e| malformed(line, e))?;
    Ok(match parsed {
        GameLine::GameFull(full) => {
            let full = *full;
            Some(GameEvent::Full(GameFull {
                id: full.id,
                white: full.white.into(),
                black: full.black.into(),
                initial_fen: full.initial_fen,
                rated: full.rated,
                speed: full.speed,
                state: full.state.into(),
            }))
        }
        GameLine::GameState(state) => Some(GameEvent::State(state.into())),
        GameLine::ChatLine { username, text } => Some(GameEvent::ChatLine { username, text }),
        GameLine::OpponentGone { gone } => Some(GameEvent::OpponentGone { gone }),
        GameLine::Other => {
            tracing::trace!(line, "Unhandled game event");
            None
        }
    })
}

/// Splits a byte stream into lines. A line may arrive across several
/// chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Complete lines found after appending `chunk`, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.pending))
            .trim()
            .to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_start() {
        let line = r#"{"type":"gameStart","game":{"fullId":"abcdefgh1234","gameId":"abcdefgh","fen":"rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1","color":"black","lastMove":"","source":"lobby","variant":{"key":"standard","name":"Standard"},"speed":"rapid","perf":"rapid","rated":true,"hasMoved":false,"opponent":{"id":"maia1","username":"maia1","rating":1540},"isMyTurn":false,"secondsLeft":600}}"#;
        let event = parse_account_line(line).unwrap().unwrap();
        assert_eq!(
            event,
            AccountEvent::GameStart(GameStart {
                game_id: "abcdefgh".into(),
                color: Some(PlayerSide::Black),
                opponent: Some("maia1".into()),
                speed: Some("rapid".into()),
                rated: true,
            })
        );
    }

    #[test]
    fn test_game_finish_and_challenge() {
        let finish = r#"{"type":"gameFinish","game":{"gameId":"abcdefgh","color":"white","status":{"id":31,"name":"resign"},"winner":"black","opponent":{"username":"maia1"}}}"#;
        match parse_account_line(finish).unwrap().unwrap() {
            AccountEvent::GameFinish(f) => {
                assert_eq!(f.status, GameStatus::Resign);
                assert_eq!(f.winner, Some(PlayerSide::Black));
            }
            other => panic!("unexpected {other:?}"),
        }

        let challenge = r#"{"type":"challenge","challenge":{"id":"ch1","url":"https://lichess.org/ch1","status":"created","challenger":{"id":"bob","name":"Bob","rating":1700},"destUser":{"id":"mockbot","name":"MockBot"},"variant":{"key":"chess960","name":"Chess960"},"rated":false,"speed":"classical"}}"#;
        assert_eq!(
            parse_account_line(challenge).unwrap().unwrap(),
            AccountEvent::Challenge(Challenge {
                id: "ch1".into(),
                challenger: Some("Bob".into()),
                variant: "chess960".into(),
                speed: Some("classical".into()),
                rated: false,
            })
        );
    }

    #[test]
    fn test_keepalive_and_unknown_types() {
        assert_eq!(parse_account_line("").unwrap(), Some(AccountEvent::KeepAlive));
        assert_eq!(parse_game_line("  ").unwrap(), Some(GameEvent::KeepAlive));
        assert_eq!(
            parse_account_line(r#"{"type":"challengeCanceled","challenge":{"id":"x"}}"#).unwrap(),
            None
        );
        assert!(matches!(
            parse_game_line("{not json"),
            Err(ServiceError::Protocol(_))
        ));
    }

    #[test]
    fn test_game_full() {
        let line = r#"{"type":"gameFull","id":"abcdefgh","rated":false,"variant":{"key":"standard"},"clock":{"initial":600000,"increment":5000},"speed":"rapid","createdAt":1700000000000,"white":{"id":"mockbot","name":"MockBot","rating":1500},"black":{"aiLevel":3},"initialFen":"startpos","state":{"type":"gameState","moves":"e2e4 e7e5 g1f3","wtime":598000,"btime":600000,"winc":5000,"binc":5000,"status":"started"}}"#;
        let Some(GameEvent::Full(full)) = parse_game_line(line).unwrap() else {
            panic!("expected gameFull");
        };
        assert_eq!(full.id, "abcdefgh");
        assert_eq!(full.white.id.as_deref(), Some("mockbot"));
        assert_eq!(full.black.name, "Stockfish level 3");
        assert_eq!(full.initial_fen, "startpos");
        assert_eq!(full.state.moves, vec!["e2e4", "e7e5", "g1f3"]);
        assert_eq!(full.state.clock_for(PlayerSide::White), Some(598_000));
        assert_eq!(full.state.status, GameStatus::Started);
    }

    #[test]
    fn test_game_state_and_chat() {
        let line = r#"{"type":"gameState","moves":"","wtime":600000,"btime":600000,"winc":0,"binc":0,"status":"outoftime","winner":"white"}"#;
        assert_eq!(
            parse_game_line(line).unwrap(),
            Some(GameEvent::State(GameState {
                moves: Vec::new(),
                white_time_ms: Some(600_000),
                black_time_ms: Some(600_000),
                status: GameStatus::OutOfTime,
                winner: Some(PlayerSide::White),
            }))
        );
        let chat = r#"{"type":"chatLine","room":"player","username":"maia1","text":"gl hf"}"#;
        assert_eq!(
            parse_game_line(chat).unwrap(),
            Some(GameEvent::ChatLine {
                username: "maia1".into(),
                text: "gl hf".into()
            })
        );
        let gone = r#"{"type":"opponentGone","gone":true,"claimWinInSeconds":30}"#;
        assert_eq!(
            parse_game_line(gone).unwrap(),
            Some(GameEvent::OpponentGone { gone: true })
        );
    }

    #[test]
    fn test_line_buffer_joins_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(br#"{"type":"game"#).is_empty());
        assert_eq!(buf.push(b"State\"}\n\n{\"a\""), vec![r#"{"type":"gameState"}"#, ""]);
        assert_eq!(buf.push(b":1}\r\n"), vec![r#"{"a":1}"#]);
        assert_eq!(buf.finish(), None);

        buf.push(b"tail");
        assert_eq!(buf.finish().as_deref(), Some("tail"));
    }
}
