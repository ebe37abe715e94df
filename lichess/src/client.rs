use std::time::Duration;

use async_trait::async_trait;
use bot::service::Clock;
use bot::{
    AccountEvent, AccountInfo, DeclineReason, EventStream, GameEvent, GameService, SeekRequest,
    ServiceError,
};
use futures::{Stream, StreamExt};
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::wire::{parse_account_line, parse_game_line, AccountPayload, LineBuffer};

pub const LICHESS_URL: &str = "https://lichess.org";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Limit for requests that answer at once. Streams and seeks have none: the
/// bot watches them for silence itself.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const NDJSON: &str = "application/x-ndjson";

/// Board API client authenticated with a personal access token.
#[derive(Clone)]
pub struct LichessClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl LichessClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ServiceError> {
        Self::with_base_url(token, LICHESS_URL)
    }

    /// Client for another server speaking the same API.
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("autobot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    /// Send a request that answers at once and expect a success status.
    async fn call(&self, request: RequestBuilder) -> Result<Response, ServiceError> {
        let response = request
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        check(response).await
    }

    async fn open_stream(&self, path: &str) -> Result<Response, ServiceError> {
        tracing::debug!(path, "Opening stream");
        let response = self
            .get(path)
            .header(reqwest::header::ACCEPT, NDJSON)
            .send()
            .await
            .map_err(transport)?;
        check(response).await
    }
}

#[async_trait]
impl GameService for LichessClient {
    async fn validate_credential(&self) -> Result<AccountInfo, ServiceError> {
        let response = self.call(self.get("/api/account")).await?;
        let account: AccountPayload = response
            .json()
            .await
            .map_err(|e| ServiceError::Protocol(e.to_string()))?;
        Ok(account.into())
    }

    async fn stream_account_events(&self) -> Result<EventStream<AccountEvent>, ServiceError> {
        let response = self.open_stream("/api/stream/event").await?;
        Ok(decode(response, parse_account_line))
    }

    async fn create_seek(&self, seek: &SeekRequest) -> Result<(), ServiceError> {
        let mut form = vec![
            ("rated", seek.rated.to_string()),
            ("variant", seek.variant.clone()),
            ("color", seek.color.as_str().to_string()),
        ];
        let realtime = match seek.time_control.clock() {
            Clock::RealTime {
                minutes,
                increment_secs,
            } => {
                form.push(("time", minutes.to_string()));
                form.push(("increment", increment_secs.to_string()));
                true
            }
            Clock::Correspondence { days } => {
                form.push(("days", days.to_string()));
                false
            }
        };

        if !realtime {
            self.call(self.post("/api/board/seek").form(&form)).await?;
            return Ok(());
        }

        // The server holds a real-time seek open until it is matched; closing
        // the connection cancels it.
        let response = self
            .post("/api/board/seek")
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        let mut body = check(response).await?.bytes_stream();
        while let Some(chunk) = body.next().await {
            chunk.map_err(transport)?;
        }
        Ok(())
    }

    async fn stream_game_state(&self, game_id: &str) -> Result<EventStream<GameEvent>, ServiceError> {
        let response = self
            .open_stream(&format!("/api/board/game/stream/{game_id}"))
            .await?;
        Ok(decode(response, parse_game_line))
    }

    async fn submit_move(&self, game_id: &str, uci: &str) -> Result<(), ServiceError> {
        let request = self.post(&format!("/api/board/game/{game_id}/move/{uci}"));
        match self.call(request).await {
            Ok(_) => Ok(()),
            Err(ServiceError::Http { status: 400, body }) => Err(move_refusal(body)),
            Err(e) => Err(e),
        }
    }

    async fn resign(&self, game_id: &str) -> Result<(), ServiceError> {
        self.call(self.post(&format!("/api/board/game/{game_id}/resign")))
            .await
            .map(drop)
    }

    async fn decline_challenge(
        &self,
        challenge_id: &str,
        reason: DeclineReason,
    ) -> Result<(), ServiceError> {
        let request = self
            .post(&format!("/api/challenge/{challenge_id}/decline"))
            .form(&[("reason", reason.as_str())]);
        self.call(request).await.map(drop)
    }

    async fn accept_challenge(&self, challenge_id: &str) -> Result<(), ServiceError> {
        self.call(self.post(&format!("/api/challenge/{challenge_id}/accept")))
            .await
            .map(drop)
    }
}

fn transport(err: reqwest::Error) -> ServiceError {
    ServiceError::Network(err.to_string())
}

async fn check(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body))
}

fn status_error(status: StatusCode, body: String) -> ServiceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Auth(body),
        _ => ServiceError::Http {
            status: status.as_u16(),
            body,
        },
    }
}

/// Tell a move played out of turn from an illegal one.
fn move_refusal(body: String) -> ServiceError {
    if body.to_ascii_lowercase().contains("not your turn") {
        ServiceError::NotYourTurn(body)
    } else {
        ServiceError::InvalidMove(body)
    }
}

/// Turn an NDJSON response into decoded events. Lines that decode to
/// nothing are skipped; a transport error ends the stream after being
/// reported.
fn decode<T, F>(response: Response, parse: F) -> EventStream<T>
where
    T: Send + 'static,
    F: Fn(&str) -> Result<Option<T>, ServiceError> + Send + 'static,
{
    let lines = ndjson_lines(response);
    Box::pin(lines.filter_map(move |line| {
        let item = match line {
            Ok(line) => parse(&line).transpose(),
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(item)
    }))
}

fn ndjson_lines(response: Response) -> impl Stream<Item = Result<String, ServiceError>> + Send {
    async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut buffer = LineBuffer::default();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    for line in buffer.push(&chunk) {
                        yield Ok(line);
                    }
                }
                Err(e) => {
                    yield Err(transport(e));
                    return;
                }
            }
        }
        if let Some(line) = buffer.finish() {
            yield Ok(line);
        }
        tracing::debug!("Stream closed by server");
    }
}
