//! Client configuration.
//!
//! Configuration is plain JSON with camelCase keys; every field has a
//! default so a partial document is enough:
//!
//! ```json
//! {
//!   "relays": [{ "url": "wss://relay.damus.io" }, { "url": "wss://nos.lol", "write": false }],
//!   "connection": { "maxReconnectAttempts": 5 },
//!   "cache": { "expirationSecs": 600 }
//! }
//! ```

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// One configured relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub url: String,

    /// Queries and subscriptions are issued to this relay
    #[serde(default = "default_true")]
    pub read: bool,

    /// Published events are sent to this relay
    #[serde(default = "default_true")]
    pub write: bool,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            read: true,
            write: true,
        }
    }

    pub fn read_only(url: impl Into<String>) -> Self {
        Self {
            write: false,
            ..Self::new(url)
        }
    }

    pub fn write_only(url: impl Into<String>) -> Self {
        Self {
            read: false,
            ..Self::new(url)
        }
    }
}

impl From<&str> for RelayConfig {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for RelayConfig {
    fn from(url: String) -> Self {
        Self::new(url)
    }
}

/// Connection supervision settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Bound on a single connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Fixed delay before an automatic reconnect
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Retry timers scheduled per relay before automatic retry is suspended
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Live subscription settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    /// Maximum authors/ids per filter sent to a relay
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Default EOSE deadline; none means wait indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eose_timeout_ms: Option<u64>,

    /// Issue active subscriptions to relays that (re)connect later
    #[serde(default = "default_true")]
    pub reissue_on_reconnect: bool,

    /// Most recent event ids remembered per subscription for dedup
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl SubscriptionConfig {
    pub fn eose_timeout(&self) -> Option<Duration> {
        self.eose_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            eose_timeout_ms: None,
            reissue_on_reconnect: true,
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

/// One-shot query settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_query_timeout_ms(),
            batch_size: default_batch_size(),
        }
    }
}

/// Metadata cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Records older than this are stale
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,

    /// Consecutive failed fetches before a key is marked unavailable
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,

    /// Debounce window collecting keys into one batch query
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Keys per batch query
    #[serde(default = "default_batch_size")]
    pub max_batch_size: usize,

    /// Timeout of each batch query
    #[serde(default = "default_query_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

impl CacheConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Keys per batch query, never zero.
    pub fn batch_limit(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration_secs: default_expiration_secs(),
            max_fetch_attempts: default_max_fetch_attempts(),
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_batch_size(),
            fetch_timeout_ms: default_query_timeout_ms(),
        }
    }
}

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Relays in priority order
    #[serde(default)]
    pub relays: Vec<RelayConfig>,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub subscriptions: SubscriptionConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

impl ClientConfig {
    pub fn with_relays<I, R>(relays: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RelayConfig>,
    {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        for relay in &self.relays {
            validate_relay_url(&relay.url)?;
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(ClientError::Configuration(
                "connectTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if self.subscriptions.batch_size == 0
            || self.query.batch_size == 0
            || self.cache.max_batch_size == 0
        {
            return Err(ClientError::Configuration(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.subscriptions.dedup_capacity == 0 {
            return Err(ClientError::Configuration(
                "dedupCapacity must be greater than zero".to_string(),
            ));
        }
        if self.query.timeout_ms == 0 || self.cache.fetch_timeout_ms == 0 {
            return Err(ClientError::Configuration(
                "query timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a relay address, accepting only `ws` and `wss`.
pub fn validate_relay_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed.scheme()
        )));
    }
    Ok(parsed)
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_batch_size() -> usize {
    150
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_query_timeout_ms() -> u64 {
    3_000
}

fn default_expiration_secs() -> u64 {
    3_600
}

fn default_max_fetch_attempts() -> u32 {
    3
}

fn default_batch_window_ms() -> u64 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(config.relays.is_empty());
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.query.timeout(), Duration::from_secs(3));
        assert_eq!(config.cache.expiration(), Duration::from_secs(3600));
        assert_eq!(config.subscriptions.eose_timeout(), None);
        assert!(config.subscriptions.reissue_on_reconnect);
        assert_eq!(config.subscriptions.dedup_capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "relays": [{"url": "wss://relay.damus.io"}, {"url": "wss://nos.lol", "write": false}],
            "connection": {"maxReconnectAttempts": 5},
            "subscriptions": {"eoseTimeoutMs": 2500},
            "cache": {"expirationSecs": 600}
        }"#;
        let config = ClientConfig::from_json_str(json).unwrap();

        assert_eq!(
            config.relays,
            vec![
                RelayConfig::new("wss://relay.damus.io"),
                RelayConfig::read_only("wss://nos.lol"),
            ]
        );
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.connection.reconnect_delay_ms, 5_000);
        assert_eq!(
            config.subscriptions.eose_timeout(),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.cache.expiration_secs, 600);
        assert_eq!(config.cache.max_fetch_attempts, 3);
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        let config = ClientConfig::with_relays(["https://relay.example.com"]);
        match config.validate() {
            Err(ClientError::InvalidUrl(_)) => {}
            other => panic!("Expected InvalidUrl error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut config = ClientConfig::default();
        config.subscriptions.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ClientError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"relays": [{{"url": "ws://127.0.0.1:7777"}}], "query": {{"timeoutMs": 1000}}}}"#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.relays.len(), 1);
        assert_eq!(config.query.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientConfig::load("/nonexistent/nostr-client.json");
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
