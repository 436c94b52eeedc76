//! Shared fixtures: a real relay on a free local port and fast signal settings.

#![allow(dead_code)]

use std::time::Duration;

use pyramid_core::{PyramidConfig, RelayServerConfig};
use pyramid_relay::RelayServer;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct RunningRelay {
    pub url: String,
    shutdown: CancellationToken,
}

impl Drop for RunningRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_relay() -> RunningRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    tokio::spawn(RelayServer::new(RelayServerConfig::default()).serve(listener, shutdown.clone()));
    RunningRelay { url, shutdown }
}

pub fn config(relay: &RunningRelay) -> PyramidConfig {
    let mut config = PyramidConfig::default();
    config.signal.relay_urls = vec![relay.url.clone()];
    config.signal.retry_base_ms = 100;
    config.signal.connect_timeout_ms = 1000;
    config.signal.announce_interval_ms = 200;
    config.hierarchy.fetch_timeout_ms = 500;
    config
}

/// Poll `condition` until it holds or ten seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
