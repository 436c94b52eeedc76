//! Persistent WebSocket connection to one rendezvous relay
//!
//! A `RelayConnection` owns a background task that keeps a socket to its
//! endpoint alive for as long as the handle exists. Closed sockets and failed
//! connects are retried after an exponentially growing delay; a successful open
//! resets the delay. Sends are best effort: anything submitted while the socket
//! is not open is dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::RetryPolicy;
use crate::types::RelayEndpoint;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport state of a relay socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Queryable status of a relay connection
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub endpoint: RelayEndpoint,
    pub state: ConnectionState,
    /// Backoff for the next reconnect: `base * 2^consecutive_failures`, back to
    /// base once a socket opens
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    pub attempts: u64,
    /// Closes since the last successful open. A socket the relay drops after
    /// opening counts as one, like a failed connect.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub messages_in: u64,
    pub messages_out: u64,
    pub last_transition: DateTime<Utc>,
}

impl RelayStatus {
    fn new(endpoint: RelayEndpoint, base: Duration) -> Self {
        Self {
            endpoint,
            state: ConnectionState::Connecting,
            retry_delay: base,
            attempts: 0,
            consecutive_failures: 0,
            last_error: None,
            messages_in: 0,
            messages_out: 0,
            last_transition: Utc::now(),
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        self.state = state;
        self.last_transition = Utc::now();
    }
}

/// Notification emitted by a relay connection task
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub endpoint: RelayEndpoint,
    pub kind: RelayEventKind,
}

#[derive(Debug, Clone)]
pub enum RelayEventKind {
    Opened,
    Closed { error: Option<String> },
    /// One inbound text frame, in arrival order
    Message(String),
}

/// Read-only view of a relay connection's status, shareable across tasks
#[derive(Debug, Clone)]
pub struct RelayMonitor {
    status: Arc<RwLock<RelayStatus>>,
}

impl RelayMonitor {
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        self.status.read().clone()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.read().state
    }
}

/// Handle to one relay socket. Dropping it stops the connection task.
pub struct RelayConnection {
    endpoint: RelayEndpoint,
    status: Arc<RwLock<RelayStatus>>,
    outbound: mpsc::UnboundedSender<String>,
    cancel_token: CancellationToken,
}

impl RelayConnection {
    /// Start connecting to `endpoint`. Must be called inside a tokio runtime.
    ///
    /// Transitions and inbound frames are reported on `events`.
    pub fn open(
        endpoint: RelayEndpoint,
        policy: RetryPolicy,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        let status = Arc::new(RwLock::new(RelayStatus::new(endpoint.clone(), policy.base)));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let task = ConnectionTask {
            endpoint: endpoint.clone(),
            policy,
            status: status.clone(),
            outbound_rx,
            events,
            cancel_token: cancel_token.clone(),
        };
        tokio::spawn(task.run());

        Self {
            endpoint,
            status,
            outbound,
            cancel_token,
        }
    }

    #[must_use]
    pub const fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.read().state
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        self.status.read().retry_delay
    }

    #[must_use]
    pub fn status(&self) -> RelayStatus {
        self.status.read().clone()
    }

    #[must_use]
    pub fn monitor(&self) -> RelayMonitor {
        RelayMonitor {
            status: self.status.clone(),
        }
    }

    /// Queue a text frame if the socket is open. Returns whether it was accepted.
    pub fn send(&self, text: impl Into<String>) -> bool {
        if self.cancel_token.is_cancelled() || self.state() != ConnectionState::Open {
            return false;
        }
        self.outbound.send(text.into()).is_ok()
    }

    /// Stop the connection task. Frames already accepted are flushed first.
    pub fn close(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!(endpoint = %self.endpoint, "Closing relay connection");
            self.cancel_token.cancel();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Why a connected socket stopped
enum SocketExit {
    Cancelled,
    Closed(Option<String>),
}

struct ConnectionTask {
    endpoint: RelayEndpoint,
    policy: RetryPolicy,
    status: Arc<RwLock<RelayStatus>>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<RelayEvent>,
    cancel_token: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.policy.base, self.policy.max);

        loop {
            {
                let mut status = self.status.write();
                status.attempts += 1;
                status.transition(ConnectionState::Connecting);
            }
            debug!(endpoint = %self.endpoint, "Connecting to relay");

            let attempt = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                result = timeout(self.policy.connect_timeout, connect_async(self.endpoint.as_str())) => result,
            };

            let error = match attempt {
                Ok(Ok((socket, _response))) => {
                    backoff.reset();
                    // Anything queued while closed is stale by now
                    while self.outbound_rx.try_recv().is_ok() {}
                    {
                        let mut status = self.status.write();
                        status.retry_delay = backoff.current();
                        status.consecutive_failures = 0;
                        status.last_error = None;
                        status.transition(ConnectionState::Open);
                    }
                    info!(endpoint = %self.endpoint, "Relay connection open");
                    self.emit(RelayEventKind::Opened);

                    match self.pump(socket).await {
                        SocketExit::Cancelled => break,
                        SocketExit::Closed(reason) => reason,
                    }
                }
                Ok(Err(e)) => Some(format!("connect failed: {e}")),
                Err(_) => Some(format!(
                    "connect timed out after {}ms",
                    self.policy.connect_timeout.as_millis()
                )),
            };

            let delay = backoff.next_delay();
            {
                let mut status = self.status.write();
                status.retry_delay = backoff.current();
                status.consecutive_failures = backoff.failures();
                if error.is_some() {
                    status.last_error.clone_from(&error);
                }
                status.transition(ConnectionState::Closed);
            }
            warn!(
                endpoint = %self.endpoint,
                error = error.as_deref().unwrap_or("closed by relay"),
                retry_in_ms = delay.as_millis() as u64,
                "Relay connection closed, reconnecting after backoff"
            );
            self.emit(RelayEventKind::Closed { error });

            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.status.write().transition(ConnectionState::Closed);
        debug!(endpoint = %self.endpoint, "Relay connection task stopped");
    }

    async fn pump(&mut self, socket: Socket) -> SocketExit {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    while let Ok(text) = self.outbound_rx.try_recv() {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return SocketExit::Cancelled;
                }
                Some(text) = self.outbound_rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        return SocketExit::Closed(Some(format!("send failed: {e}")));
                    }
                    self.status.write().messages_out += 1;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.status.write().messages_in += 1;
                        self.emit(RelayEventKind::Message(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            self.status.write().messages_in += 1;
                            self.emit(RelayEventKind::Message(text));
                        }
                        Err(_) => {
                            warn!(endpoint = %self.endpoint, len = bytes.len(), "Dropping non UTF-8 binary frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return SocketExit::Closed(frame.map(|f| format!("closed by relay: {} {}", f.code, f.reason.as_str())));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SocketExit::Closed(Some(format!("read failed: {e}"))),
                    None => return SocketExit::Closed(None),
                },
            }
        }
    }

    fn emit(&self, kind: RelayEventKind) {
        // The owning session may already be gone while the task winds down
        let _ = self.events.send(RelayEvent {
            endpoint: self.endpoint.clone(),
            kind,
        });
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_endpoint() -> RelayEndpoint {
        // Port 9 (discard) is not expected to accept WebSocket upgrades
        RelayEndpoint::parse("ws://127.0.0.1:9").unwrap()
    }

    #[tokio::test]
    async fn test_send_is_dropped_while_not_open() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            base: Duration::from_secs(60),
            max: None,
            connect_timeout: Duration::from_millis(200),
        };
        let relay = RelayConnection::open(closed_endpoint(), policy, tx);

        assert_ne!(relay.state(), ConnectionState::Open);
        assert!(!relay.send("hello"));
        relay.close();
        assert!(relay.is_closed());
    }

    #[tokio::test]
    async fn test_failed_connect_is_recorded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            base: Duration::from_secs(60),
            max: None,
            connect_timeout: Duration::from_millis(500),
        };
        let relay = RelayConnection::open(closed_endpoint(), policy, tx);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.kind, RelayEventKind::Closed { error: Some(_) }));

        let status = relay.status();
        assert_eq!(status.state, ConnectionState::Closed);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.retry_delay, Duration::from_secs(120));
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = RelayConnection::open(closed_endpoint(), RetryPolicy::default(), tx);
        relay.close();
        relay.close();
        assert!(relay.is_closed());
        assert!(!relay.send("late"));
    }
}
