//! Nostr relay message types.
//!
//! This module implements the relay protocol messages as specified in NIP-01:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name` (the second element of each tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => {
                serde_json::json!(["EVENT", event])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }

    /// Subscription id carried by REQ and CLOSE.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Req {
                subscription_id, ..
            }
            | ClientMessage::Close { subscription_id } => Some(subscription_id),
            ClientMessage::Event(_) => None,
        }
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },

    /// Authentication challenge (NIP-42): ["AUTH", <challenge>]
    Auth { challenge: String },

    /// Count response (NIP-45): ["COUNT", <subscription_id>, {"count": <n>}]
    Count { subscription_id: String, count: u64 },
}

fn string_at(arr: &[Value], idx: usize, field: &str) -> Result<String, MessageError> {
    arr[idx]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        if arr.is_empty() {
            return Err(MessageError::InvalidFormat("empty array".to_string()));
        }

        let msg_type = arr[0]
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField(
                        "event or subscription_id".to_string(),
                    ));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let event: Event = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField("OK fields".to_string()));
                }
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("success not a boolean".to_string())
                })?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("subscription_id".to_string()));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                Ok(RelayMessage::Eose { subscription_id })
            }
            "CLOSED" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("CLOSED fields".to_string()));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let message = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("message".to_string()));
                }
                let message = string_at(&arr, 1, "message")?;
                Ok(RelayMessage::Notice { message })
            }
            "AUTH" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("challenge".to_string()));
                }
                let challenge = string_at(&arr, 1, "challenge")?;
                Ok(RelayMessage::Auth { challenge })
            }
            "COUNT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField("COUNT fields".to_string()));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let count = arr[2]
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| MessageError::MissingField("count value".to_string()))?;
                Ok(RelayMessage::Count {
                    subscription_id,
                    count,
                })
            }
            _ => Err(MessageError::UnknownType(msg_type.to_string())),
        }
    }

    /// Serialize to the JSON array a relay would send.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => serde_json::json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => serde_json::json!(["OK", event_id, success, message]),
            RelayMessage::Eose { subscription_id } => serde_json::json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => serde_json::json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => serde_json::json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => serde_json::json!(["AUTH", challenge]),
            RelayMessage::Count {
                subscription_id,
                count,
            } => serde_json::json!(["COUNT", subscription_id, {"count": count}]),
        };
        Ok(value.to_string())
    }

    /// Subscription id the message refers to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            }
            | RelayMessage::Count {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

/// Machine-readable prefix of a CLOSED or rejected OK message (NIP-01).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    RateLimited,
    AuthRequired,
    Restricted,
    Blocked,
    Duplicate,
    Pow,
    Invalid,
    Error,
    /// No recognized prefix
    Unspecified,
}

impl CloseReason {
    /// Classify a relay message by its `prefix:` token.
    pub fn from_message(message: &str) -> Self {
        let Some((prefix, _)) = message.split_once(':') else {
            return CloseReason::Unspecified;
        };
        match prefix.trim() {
            "rate-limited" => CloseReason::RateLimited,
            "auth-required" => CloseReason::AuthRequired,
            "restricted" => CloseReason::Restricted,
            "blocked" => CloseReason::Blocked,
            "duplicate" => CloseReason::Duplicate,
            "pow" => CloseReason::Pow,
            "invalid" => CloseReason::Invalid,
            "error" => CloseReason::Error,
            _ => CloseReason::Unspecified,
        }
    }

    pub fn is_rate_limited(self) -> bool {
        self == CloseReason::RateLimited
    }
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries (e.g., #e, #p)
    /// The key includes the # prefix, value is list of accepted tag values
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key should be the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = if key.starts_with('#') {
            key.to_string()
        } else {
            format!("#{}", key)
        };
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.iter().any(|id| *id == event.id)
        {
            return false;
        }

        if let Some(ref authors) = self.authors
            && !authors.iter().any(|a| *a == event.pubkey)
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let Some(letter) = key.strip_prefix('#') else {
                return true;
            };
            event
                .tag_values(letter)
                .any(|value| values.iter().any(|v| v == value))
        })
    }

    /// Split oversized author and id lists into sub-filters of at most
    /// `batch_size` entries each. The union of the returned filters matches
    /// exactly what `self` matches.
    pub fn split(&self, batch_size: usize) -> Vec<Filter> {
        let batch_size = batch_size.max(1);
        let chunk = |values: &Option<Vec<String>>| -> Vec<Option<Vec<String>>> {
            match values {
                Some(list) if list.len() > batch_size => list
                    .chunks(batch_size)
                    .map(|c| Some(c.to_vec()))
                    .collect(),
                other => vec![other.clone()],
            }
        };

        let author_chunks = chunk(&self.authors);
        let id_chunks = chunk(&self.ids);

        let mut filters = Vec::with_capacity(author_chunks.len() * id_chunks.len());
        for authors in &author_chunks {
            for ids in &id_chunks {
                let mut filter = self.clone();
                filter.authors = authors.clone();
                filter.ids = ids.clone();
                filters.push(filter);
            }
        }
        filters
    }
}

/// Whether any filter in the set matches the event.
pub fn any_matches(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// Split every filter in the set, see [`Filter::split`].
pub fn split_filters(filters: &[Filter], batch_size: usize) -> Vec<Filter> {
    filters.iter().flat_map(|f| f.split(batch_size)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn test_client_message_event() {
        let event = Event {
            id: "abc123".to_string(),
            pubkey: "pubkey123".to_string(),
            created_at: 1234567890,
            kind: 1,
            tags: vec![],
            content: "Hello".to_string(),
            sig: "sig123".to_string(),
        };

        let msg = ClientMessage::Event(event);
        let json = msg.to_json().unwrap();

        assert!(json.contains("EVENT"));
        assert!(json.contains("abc123"));
    }

    #[test]
    fn test_client_message_req() {
        let filter = Filter::new().kinds(vec![1]).limit(10);

        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![filter],
        };

        let json = msg.to_json().unwrap();
        assert!(json.starts_with(r#"["REQ","sub1","#));
        assert!(json.contains(r#""kinds":[1]"#));
        assert_eq!(msg.subscription_id(), Some("sub1"));
    }

    #[test]
    fn test_client_message_close() {
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };

        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_relay_message_event() {
        let json = r#"["EVENT","sub1",{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"Hello","sig":"sig"}]"#;
        let msg = RelayMessage::from_json(json).unwrap();

        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.id, "abc");
                assert_eq!(event.content, "Hello");
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_ok_failure() {
        let json = r#"["OK","event123",false,"duplicate: already have this event"]"#;
        let msg = RelayMessage::from_json(json).unwrap();

        match msg {
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                assert_eq!(event_id, "event123");
                assert!(!success);
                assert_eq!(CloseReason::from_message(&message), CloseReason::Duplicate);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_closed_rate_limited() {
        let json = r#"["CLOSED","sub1","rate-limited: slow down there chief"]"#;
        let msg = RelayMessage::from_json(json).unwrap();

        match msg {
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert!(CloseReason::from_message(&message).is_rate_limited());
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_close_reason_needs_prefix() {
        // Free text mentioning rate limits is not a structured rate limit.
        assert_eq!(
            CloseReason::from_message("you are being rate limited"),
            CloseReason::Unspecified
        );
        assert_eq!(
            CloseReason::from_message("auth-required: sign in"),
            CloseReason::AuthRequired
        );
        assert_eq!(CloseReason::from_message(""), CloseReason::Unspecified);
    }

    #[test]
    fn test_relay_message_count() {
        let json = r#"["COUNT","sub1",{"count":42}]"#;
        let msg = RelayMessage::from_json(json).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Count {
                subscription_id: "sub1".to_string(),
                count: 42
            }
        );
    }

    #[test]
    fn test_relay_message_to_json_parses_back() {
        let msg = RelayMessage::Eose {
            subscription_id: "sub9".to_string(),
        };
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"["EOSE","sub9"]"#);
        assert_eq!(RelayMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_invalid_message() {
        assert!(RelayMessage::from_json("not valid json").is_err());
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(matches!(
            RelayMessage::from_json(r#"["UNKNOWN"]"#),
            Err(MessageError::UnknownType(_))
        ));
    }

    #[test]
    fn test_filter_serialization() {
        let filter = Filter::new().kinds(vec![1]).limit(10).pubkey_refs(["pk"]);

        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"kinds\":[1]"));
        assert!(json.contains("\"limit\":10"));
        assert!(json.contains("\"#p\":[\"pk\"]"));
        assert!(!json.contains("authors"));

        let parsed: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, filter);
    }

    #[test]
    fn test_filter_matches_kind_author_window() {
        let filter = Filter::new()
            .kinds([0, 1])
            .authors(["alice"])
            .since(100)
            .until(200);

        assert!(filter.matches(&make_event("a", "alice", 1, 100)));
        assert!(filter.matches(&make_event("b", "alice", 0, 200)));
        assert!(!filter.matches(&make_event("c", "alice", 1, 99)));
        assert!(!filter.matches(&make_event("d", "alice", 1, 201)));
        assert!(!filter.matches(&make_event("e", "bob", 1, 150)));
        assert!(!filter.matches(&make_event("f", "alice", 7, 150)));
    }

    #[test]
    fn test_filter_matches_ids_exactly() {
        let filter = Filter::new().ids(["abcdef"]);
        assert!(filter.matches(&make_event("abcdef", "pk", 1, 1)));
        assert!(!filter.matches(&make_event("abcdef00", "pk", 1, 1)));
    }

    #[test]
    fn test_filter_matches_tags() {
        let filter = Filter::new().event_refs(["root"]);
        let mut event = make_event("x", "pk", 1, 1);
        assert!(!filter.matches(&event));

        event.tags.push(vec!["p".to_string(), "root".to_string()]);
        assert!(!filter.matches(&event));

        event.tags.push(vec!["e".to_string(), "root".to_string()]);
        assert!(filter.matches(&event));
    }

    #[test]
    fn test_filter_split_keeps_small_filters() {
        let filter = Filter::new().kinds([0]).authors(["a", "b"]);
        assert_eq!(filter.split(10), vec![filter.clone()]);
    }

    #[test]
    fn test_filter_split_chunks_authors() {
        let authors: Vec<String> = (0..25).map(|i| format!("pk{}", i)).collect();
        let filter = Filter::new().kinds([0]).authors(authors.clone());

        let parts = filter.split(10);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|f| f.kinds == Some(vec![0])));
        let sizes: Vec<usize> = parts
            .iter()
            .map(|f| f.authors.as_ref().map_or(0, Vec::len))
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    proptest! {
        #[test]
        fn prop_split_preserves_matching(
            author_count in 1usize..60,
            batch in 1usize..20,
            author_index in 0usize..80,
        ) {
            let authors: Vec<String> = (0..author_count).map(|i| format!("pk{}", i)).collect();
            let filter = Filter::new().kinds([1]).authors(authors);
            let parts = filter.split(batch);

            prop_assert!(parts.iter().all(|f| f.authors.as_ref().map_or(0, Vec::len) <= batch));

            let event = make_event("id", &format!("pk{}", author_index), 1, 10);
            prop_assert_eq!(filter.matches(&event), any_matches(&parts, &event));
        }
    }
}
