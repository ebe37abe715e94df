//! Account event stream consumer.
//!
//! Keeps one connection to the account stream open, reconnecting with
//! backoff, and forwards notifications to the supervisor. Only bad
//! credentials or shutdown end it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{Backoff, ReconnectConfig};
use crate::events::EventSink;
use crate::service::{AccountEvent, EventStream, GameService, ServiceError};

#[derive(Debug)]
pub(crate) enum ConsumerMessage {
    Event(AccountEvent),
    AuthFailed(String),
}

enum Flow {
    Reconnect(String),
    Stop,
}

pub(crate) struct EventConsumer {
    service: Arc<dyn GameService>,
    reconnect: ReconnectConfig,
    events: EventSink,
    tx: mpsc::Sender<ConsumerMessage>,
    shutdown: watch::Receiver<bool>,
}

impl EventConsumer {
    pub fn new(
        service: Arc<dyn GameService>,
        reconnect: ReconnectConfig,
        events: EventSink,
        tx: mpsc::Sender<ConsumerMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            reconnect,
            events,
            tx,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().instrument(tracing::info_span!("account_stream")))
    }

    async fn run(mut self) {
        let mut backoff = self.reconnect.backoff();
        loop {
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                result = self.service.stream_account_events() => result,
            };

            let reason = match connected {
                Ok(stream) => {
                    tracing::info!("Account stream connected");
                    match self.consume(stream, &mut backoff).await {
                        Flow::Reconnect(reason) => reason,
                        Flow::Stop => break,
                    }
                }
                Err(e) if e.is_auth() => {
                    self.events.error("Account stream rejected credentials", &e);
                    let _ = self.tx.send(ConsumerMessage::AuthFailed(e.to_string())).await;
                    break;
                }
                Err(e) => e.to_string(),
            };

            let delay = backoff.next_delay();
            self.events.warn(
                "Account stream disconnected, reconnecting",
                format!("{reason} (retry in {delay:?})"),
            );
            if !self.pause(delay).await {
                break;
            }
        }
        tracing::info!("Account stream consumer exited");
    }

    async fn consume(
        &mut self,
        mut stream: EventStream<AccountEvent>,
        backoff: &mut Backoff,
    ) -> Flow {
        let idle = self.reconnect.idle_timeout();
        let mut received = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => return Flow::Stop,
                item = tokio::time::timeout(idle, stream.next()) => item,
            };
            match item {
                Ok(Some(Ok(event))) => {
                    if !received {
                        received = true;
                        backoff.reset();
                    }
                    if matches!(event, AccountEvent::KeepAlive) {
                        continue;
                    }
                    if !self.forward(ConsumerMessage::Event(event)).await {
                        return Flow::Stop;
                    }
                }
                Ok(Some(Err(ServiceError::Protocol(msg)))) => {
                    self.events.warn("Dropped malformed account event", msg);
                }
                Ok(Some(Err(e))) if e.is_auth() => {
                    self.events.error("Account stream rejected credentials", &e);
                    let _ = self.tx.send(ConsumerMessage::AuthFailed(e.to_string())).await;
                    return Flow::Stop;
                }
                Ok(Some(Err(e))) => return Flow::Reconnect(e.to_string()),
                Ok(None) => return Flow::Reconnect("stream closed by server".into()),
                Err(_) => return Flow::Reconnect(format!("no data for {idle:?}")),
            }
        }
    }

    /// False once the supervisor is gone.
    async fn forward(&self, message: ConsumerMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// False when shutdown arrived during the pause.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|stop| *stop) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
