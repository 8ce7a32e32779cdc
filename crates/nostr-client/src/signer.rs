//! Signer boundary.
//!
//! Key material never enters this crate. A [`Signer`] turns an
//! [`UnsignedEvent`] into a signed [`Event`]; how it computes the id and
//! signature (local key, browser extension, remote bunker) is its own
//! business.

use crate::error::Result;
use crate::message::Event;
use async_trait::async_trait;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a caller wants to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTemplate {
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Defaults to the current time
    pub created_at: Option<u64>,
}

impl EventTemplate {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn tag(mut self, tag: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    pub fn created_at(mut self, timestamp: u64) -> Self {
        self.created_at = Some(timestamp);
        self
    }

    pub(crate) fn into_unsigned(self, pubkey: String) -> UnsignedEvent {
        UnsignedEvent {
            pubkey,
            created_at: self.created_at.unwrap_or_else(unix_now),
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// An event with everything but id and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// NIP-01 id preimage: `[0, pubkey, created_at, kind, tags, content]`.
    pub fn id_preimage(&self) -> String {
        json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]).to_string()
    }

    /// Attach an id and signature produced by a signer.
    pub fn into_event(self, id: impl Into<String>, sig: impl Into<String>) -> Event {
        Event {
            id: id.into(),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.into(),
        }
    }
}

/// Signs events on behalf of one identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Public key (hex) of the identity
    async fn get_identity(&self) -> Result<String>;

    async fn sign(&self, event: UnsignedEvent) -> Result<Event>;
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
