//! Minimal in-process relay for integration tests.
//!
//! Speaks the relay frame protocol: remembers subscriptions per connection and
//! forwards `publish` frames as `message` frames to the other subscribers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pyramid_core::{RelayFrame, SignalConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

struct Client {
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<String>,
}

type Clients = Arc<Mutex<HashMap<u64, Client>>>;

pub struct TestRelay {
    pub port: u16,
    cancel: CancellationToken,
}

impl TestRelay {
    pub async fn start() -> Self {
        Self::start_on(free_port().await).await
    }

    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let cancel = CancellationToken::new();
        let clients: Clients = Arc::new(Mutex::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(0));

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    () = accept_cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(_) => continue,
                    },
                };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(serve_client(id, stream, clients.clone(), accept_cancel.clone()));
            }
        });

        Self { port, cancel }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Drop the listener and every open connection
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_client(
    id: u64,
    stream: tokio::net::TcpStream,
    clients: Clients,
    cancel: CancellationToken,
) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    clients.lock().insert(
        id,
        Client {
            topics: HashSet::new(),
            tx,
        },
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(text) = rx.recv() => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => route(id, text.as_str(), &clients),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    clients.lock().remove(&id);
}

fn route(id: u64, text: &str, clients: &Clients) {
    let Ok(frame) = RelayFrame::decode(text) else {
        return;
    };
    let mut clients = clients.lock();
    match frame {
        RelayFrame::Subscribe { topic } => {
            if let Some(client) = clients.get_mut(&id) {
                client.topics.insert(topic);
            }
        }
        RelayFrame::Unsubscribe { topic } => {
            if let Some(client) = clients.get_mut(&id) {
                client.topics.remove(&topic);
            }
        }
        RelayFrame::Publish { topic, message } => {
            let Ok(out) = (RelayFrame::Message {
                topic: topic.clone(),
                message,
            })
            .encode() else {
                return;
            };
            for (other, client) in clients.iter() {
                if *other != id && client.topics.contains(&topic) {
                    let _ = client.tx.send(out.clone());
                }
            }
        }
        RelayFrame::Message { .. } | RelayFrame::Notice { .. } => {}
    }
}

pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Signal settings tuned for fast tests against one local relay
pub fn signal_config(relay_url: &str) -> SignalConfig {
    SignalConfig {
        relay_urls: vec![relay_url.to_string()],
        retry_base_ms: 100,
        connect_timeout_ms: 1000,
        announce_interval_ms: 200,
        peer_timeout_ms: 5000,
        ..SignalConfig::default()
    }
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
