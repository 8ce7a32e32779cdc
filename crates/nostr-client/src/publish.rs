//! Publishing signed events to writable relays.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, CloseReason, Event, RelayMessage};
use crate::observer::ObserverHandle;
use crate::signer::{EventTemplate, Signer};
use crate::supervisor::{ConnectionSupervisor, StatusEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

/// Default wait for OK confirmations
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(5);

/// How each relay answered a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub event_id: String,
    pub accepted: Vec<String>,
    /// Relay and rejection message
    pub rejected: Vec<(String, String)>,
    pub rate_limited: Vec<String>,
    /// Sent but unanswered before the timeout or disconnect
    pub no_response: Vec<String>,
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        !self.accepted.is_empty()
    }
}

enum Confirmation {
    Ok {
        relay_url: String,
        success: bool,
        message: String,
    },
    Lost(String),
}

struct PublisherInner {
    supervisor: ConnectionSupervisor,
    signer: Arc<dyn Signer>,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<Confirmation>>>,
    observers: Mutex<Vec<ObserverHandle>>,
}

impl Drop for PublisherInner {
    fn drop(&mut self) {
        for handle in self.observers.get_mut().drain(..) {
            self.supervisor.unobserve(handle);
        }
    }
}

/// Signs and publishes events, collecting OK confirmations.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(supervisor: ConnectionSupervisor, signer: Arc<dyn Signer>) -> Self {
        let inner = Arc::new(PublisherInner {
            supervisor: supervisor.clone(),
            signer,
            pending: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let frames = supervisor.on_frame(move |frame| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let RelayMessage::Ok {
                event_id,
                success,
                message,
            } = &frame.message
                && let Some(tx) = inner.pending.lock().get(event_id)
            {
                let _ = tx.send(Confirmation::Ok {
                    relay_url: frame.relay_url.clone(),
                    success: *success,
                    message: message.clone(),
                });
            }
        });
        let weak = Arc::downgrade(&inner);
        let status = supervisor.on_status(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let StatusEvent::Disconnected { relay_url, .. }
            | StatusEvent::Errored { relay_url, .. }
            | StatusEvent::Removed { relay_url } = event
            {
                for tx in inner.pending.lock().values() {
                    let _ = tx.send(Confirmation::Lost(relay_url.clone()));
                }
            }
        });
        inner.observers.lock().extend([frames, status]);

        Self { inner }
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.inner.signer
    }

    /// Sign `template` with the configured signer and publish it.
    pub async fn publish(&self, template: EventTemplate, timeout: Option<Duration>) -> Result<PublishOutcome> {
        let pubkey = self.inner.signer.get_identity().await?;
        let event = self.inner.signer.sign(template.into_unsigned(pubkey)).await?;
        self.publish_event(&event, timeout).await
    }

    /// Send an already signed event to every connected, write-enabled relay
    /// and wait for their OK answers.
    pub async fn publish_event(&self, event: &Event, timeout: Option<Duration>) -> Result<PublishOutcome> {
        let relays = self.inner.supervisor.writable_endpoints();
        if relays.is_empty() {
            return Err(ClientError::NoEndpointsAvailable);
        }

        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_CONFIRMATION_TIMEOUT);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.pending.lock().insert(event.id.clone(), tx);

        let sent = self
            .inner
            .supervisor
            .send(&relays, &ClientMessage::Event(event.clone()))
            .await;
        info!("Published event {} to {} relays", event.id, sent.len());

        let mut outcome = PublishOutcome {
            event_id: event.id.clone(),
            ..PublishOutcome::default()
        };
        let mut waiting: HashSet<String> = sent.into_iter().collect();

        while !waiting.is_empty() {
            let confirmation = match timeout_at(deadline, rx.recv()).await {
                Ok(Some(confirmation)) => confirmation,
                Ok(None) => break,
                Err(_) => {
                    debug!("Event confirmation timeout for {}", event.id);
                    break;
                }
            };
            match confirmation {
                Confirmation::Ok {
                    relay_url,
                    success,
                    message,
                } => {
                    if !waiting.remove(&relay_url) {
                        continue;
                    }
                    if success {
                        outcome.accepted.push(relay_url);
                    } else if CloseReason::from_message(&message).is_rate_limited() {
                        warn!("Relay {} rate limited event {}: {}", relay_url, event.id, message);
                        outcome.rate_limited.push(relay_url);
                    } else {
                        warn!("Relay {} rejected event {}: {}", relay_url, event.id, message);
                        outcome.rejected.push((relay_url, message));
                    }
                }
                Confirmation::Lost(relay_url) => {
                    if waiting.remove(&relay_url) {
                        outcome.no_response.push(relay_url);
                    }
                }
            }
        }

        self.inner.pending.lock().remove(&event.id);
        let mut unanswered: Vec<String> = waiting.into_iter().collect();
        unanswered.sort();
        outcome.no_response.extend(unanswered);
        Ok(outcome)
    }
}
