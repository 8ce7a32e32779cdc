//! Client error types

use crate::message::MessageError;
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Caller misuse (empty filter set, bad option values). Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connect or send failure on a single relay
    #[error("Transport error on {relay_url}: {message}")]
    Transport { relay_url: String, message: String },

    /// No connected relay can serve the request
    #[error("No relays available")]
    NoEndpointsAvailable,

    /// A relay refused work with a `rate-limited:` prefix
    #[error("Rate limited by {relay_url}: {message}")]
    RateLimited { relay_url: String, message: String },

    /// Relay closed a subscription for a reason other than rate limiting
    #[error("Subscription {subscription_id} closed by {relay_url}: {message}")]
    SubscriptionClosed {
        relay_url: String,
        subscription_id: String,
        message: String,
    },

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protocol message could not be encoded or decoded
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Unknown relay address
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// Signer refused or failed
    #[error("Signer error: {0}")]
    Signer(String),
}

impl ClientError {
    pub(crate) fn transport(relay_url: impl Into<String>, message: impl ToString) -> Self {
        ClientError::Transport {
            relay_url: relay_url.into(),
            message: message.to_string(),
        }
    }

    /// This error as a transport failure on `relay_url`. Errors that already
    /// are transport failures keep their own relay and message.
    pub(crate) fn to_transport(&self, relay_url: &str) -> Self {
        match self {
            ClientError::Transport {
                relay_url: origin,
                message,
            } => ClientError::transport(origin.clone(), message),
            other => ClientError::transport(relay_url, other),
        }
    }

    /// Soft errors describe one relay declining work; they never fail a
    /// multi-relay operation.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            ClientError::RateLimited { .. } | ClientError::SubscriptionClosed { .. }
        )
    }

    /// The relay this error is attributed to, if any.
    pub fn relay_url(&self) -> Option<&str> {
        match self {
            ClientError::Transport { relay_url, .. }
            | ClientError::RateLimited { relay_url, .. }
            | ClientError::SubscriptionClosed { relay_url, .. } => Some(relay_url),
            ClientError::UnknownRelay(url) => Some(url),
            _ => None,
        }
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
