use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::RelayEndpoint;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidConfig {
    pub signal: SignalConfig,
    pub hierarchy: HierarchyConfig,
    pub relay_server: RelayServerConfig,
    pub logging: LoggingConfig,
}

/// Rendezvous signaling settings used by every room session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Namespace prefixed to every room topic
    pub app_id: String,
    pub relay_urls: Vec<String>,
    /// Number of relays each room announces on, 0 means all of them
    pub relay_redundancy: usize,
    pub retry_base_ms: u64,
    /// Upper bound for the reconnect delay, unbounded when unset
    pub retry_max_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub announce_interval_ms: u64,
    pub peer_timeout_ms: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            app_id: "pyramid-stream".to_string(),
            relay_urls: vec!["ws://localhost:10547".to_string()],
            relay_redundancy: 0,
            retry_base_ms: 3333,
            retry_max_ms: None,
            connect_timeout_ms: 10_000,
            announce_interval_ms: 5333,
            peer_timeout_ms: 20_000,
        }
    }
}

impl SignalConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            max: self.retry_max_ms.map(Duration::from_millis),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    #[must_use]
    pub const fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    #[must_use]
    pub const fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Relays a room should use.
    ///
    /// All configured URLs, or `relay_redundancy` of them picked by a shuffle
    /// seeded from the app id so every client of the same app picks the same set.
    pub fn relay_endpoints(&self) -> Result<Vec<RelayEndpoint>> {
        if self.relay_urls.is_empty() {
            return Err(Error::InvalidInput("no relay urls configured".to_string()));
        }

        let urls = if self.relay_redundancy > 0 && self.relay_redundancy < self.relay_urls.len() {
            let mut shuffled = seeded_shuffle(&self.relay_urls, str_to_num(&self.app_id));
            shuffled.truncate(self.relay_redundancy);
            shuffled
        } else {
            self.relay_urls.clone()
        };

        urls.iter().map(|url| RelayEndpoint::parse(url)).collect()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.app_id.is_empty() {
            errors.push("signal.app_id must not be empty".to_string());
        }
        if self.relay_urls.is_empty() {
            errors.push("signal.relay_urls must list at least one relay".to_string());
        }
        for url in &self.relay_urls {
            if let Err(e) = RelayEndpoint::parse(url) {
                errors.push(format!("signal.relay_urls: {e}"));
            }
        }
        if self.retry_base_ms == 0 {
            errors.push("signal.retry_base_ms must be positive".to_string());
        }
        if let Some(max) = self.retry_max_ms {
            if max < self.retry_base_ms {
                errors.push("signal.retry_max_ms must not be below retry_base_ms".to_string());
            }
        }
        if self.announce_interval_ms == 0 {
            errors.push("signal.announce_interval_ms must be positive".to_string());
        }
        if self.peer_timeout_ms <= self.announce_interval_ms {
            errors.push("signal.peer_timeout_ms must exceed announce_interval_ms".to_string());
        }
        errors
    }
}

/// Reconnect behaviour of a single relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SignalConfig::default().retry_policy()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// How long a descriptor fetch may wait before it counts as a miss
    pub fetch_timeout_ms: u64,
    pub max_chain_hops: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 5000,
            max_chain_hops: 10,
        }
    }
}

impl HierarchyConfig {
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    pub bind_addr: String,
    pub max_message_size: usize,
    pub max_topics_per_connection: usize,
    /// Frames buffered per connection before new ones are dropped
    pub outbound_buffer: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:10547".to_string(),
            max_message_size: 64 * 1024,
            max_topics_per_connection: 32,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl PyramidConfig {
    /// Load configuration from an optional file and the environment.
    ///
    /// Priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PYRAMID_SIGNAL__APP_ID, PYRAMID_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("PYRAMID")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("signal.relay_urls")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = self.signal.validate();

        if self.hierarchy.max_chain_hops == 0 {
            errors.push("hierarchy.max_chain_hops must be positive".to_string());
        }
        if self.hierarchy.fetch_timeout_ms == 0 {
            errors.push("hierarchy.fetch_timeout_ms must be positive".to_string());
        }
        if self.relay_server.outbound_buffer == 0 {
            errors.push("relay_server.outbound_buffer must be positive".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn str_to_num(value: &str) -> u64 {
    const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;
    value.encode_utf16().map(u64::from).sum::<u64>() % MAX_SAFE_INTEGER
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn seeded_shuffle(items: &[String], seed: u64) -> Vec<String> {
    let mut out = items.to_vec();
    let mut seed = seed as f64;
    let mut rand = move || {
        let x = seed.sin() * 10_000.0;
        seed += 1.0;
        x - x.floor()
    };

    let mut i = out.len();
    while i > 0 {
        let j = (rand() * i as f64).floor() as usize;
        i -= 1;
        out.swap(i, j);
    }
    out
}
