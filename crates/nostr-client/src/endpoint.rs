//! Relay endpoint state.

use crate::config::RelayConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Disconnected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Last connect attempt or the live connection failed
    Errored,
}

/// Weight of the newest sample in the latency average
const LATENCY_WEIGHT: f64 = 0.2;

/// One relay's address and live connection state.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub read: bool,
    pub write: bool,
    pub state: EndpointState,
    /// Failed connects since the last success
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub last_error: Option<String>,
    /// Rolling connect round-trip estimate
    pub latency: Option<Duration>,
    pub messages_received: u64,
    /// Retry timers scheduled since the last successful connect
    pub reconnect_attempts: u32,
    /// Automatic retry stopped after exhausting the retry budget
    pub suspended: bool,
}

impl Endpoint {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            url: config.url.clone(),
            read: config.read,
            write: config.write,
            state: EndpointState::Disconnected,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            latency: None,
            messages_received: 0,
            reconnect_attempts: 0,
            suspended: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == EndpointState::Connected
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Connected | EndpointState::Connecting
        )
    }

    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        self.state = EndpointState::Connected;
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
        self.last_error = None;
        self.reconnect_attempts = 0;
        self.suspended = false;
        self.latency = Some(match self.latency {
            Some(previous) => previous.mul_f64(1.0 - LATENCY_WEIGHT) + elapsed.mul_f64(LATENCY_WEIGHT),
            None => elapsed,
        });
    }

    /// Give the endpoint a fresh automatic-retry budget.
    pub(crate) fn reset_retry_budget(&mut self) {
        self.reconnect_attempts = 0;
        self.suspended = false;
    }

    pub(crate) fn record_failure(&mut self, error: &str) {
        self.state = EndpointState::Errored;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
    }
}

/// Aggregated pool health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolHealth {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub errored: usize,
    pub suspended: usize,
}

impl PoolHealth {
    pub fn from_endpoints<'a>(endpoints: impl IntoIterator<Item = &'a Endpoint>) -> Self {
        let mut health = PoolHealth::default();
        for endpoint in endpoints {
            health.total += 1;
            match endpoint.state {
                EndpointState::Connected => health.connected += 1,
                EndpointState::Connecting => health.connecting += 1,
                EndpointState::Errored => health.errored += 1,
                EndpointState::Disconnected => {}
            }
            if endpoint.suspended {
                health.suspended += 1;
            }
        }
        health
    }

    pub fn is_healthy(&self) -> bool {
        self.connected > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_then_success_resets_count() {
        let mut endpoint = Endpoint::new(&RelayConfig::new("wss://relay.example.com"));
        endpoint.record_failure("timeout");
        endpoint.record_failure("timeout");
        assert_eq!(endpoint.state, EndpointState::Errored);
        assert_eq!(endpoint.consecutive_failures, 2);
        assert_eq!(endpoint.last_error.as_deref(), Some("timeout"));

        endpoint.record_success(Duration::from_millis(100));
        assert!(endpoint.is_connected());
        assert_eq!(endpoint.consecutive_failures, 0);
        assert!(endpoint.last_error.is_none());
        assert!(endpoint.last_success.is_some());
    }

    #[test]
    fn test_latency_moving_average() {
        let mut endpoint = Endpoint::new(&RelayConfig::new("wss://relay.example.com"));
        endpoint.record_success(Duration::from_millis(100));
        assert_eq!(endpoint.latency, Some(Duration::from_millis(100)));

        endpoint.record_success(Duration::from_millis(200));
        let latency = endpoint.latency.unwrap().as_millis();
        assert!((119..=121).contains(&latency), "latency was {}ms", latency);
    }

    #[test]
    fn test_pool_health() {
        let mut a = Endpoint::new(&RelayConfig::new("wss://a.example"));
        let mut b = Endpoint::new(&RelayConfig::new("wss://b.example"));
        let c = Endpoint::new(&RelayConfig::new("wss://c.example"));
        a.record_success(Duration::ZERO);
        b.record_failure("refused");
        b.suspended = true;

        let health = PoolHealth::from_endpoints([&a, &b, &c]);
        assert_eq!(
            health,
            PoolHealth {
                total: 3,
                connected: 1,
                connecting: 0,
                errored: 1,
                suspended: 1,
            }
        );
        assert!(health.is_healthy());
    }
}
