//! Integration events and the listener registry.
//!
//! Listeners subscribe to one integration id or to the wildcard channel
//! [`WILDCARD`]. Events are delivered synchronously; a panicking listener is
//! logged and skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use switchboard_core::{EventId, ListenerId};
use tracing::error;

/// Channel receiving events for every integration.
pub const WILDCARD: &str = "*";

/// Kind of integration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationEventType {
    Request,
    Response,
    Error,
    QuotaExceeded,
    RateLimit,
}

impl IntegrationEventType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimit => "rate_limit",
        }
    }
}

impl fmt::Display for IntegrationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub id: EventId,
    pub integration_id: String,
    #[serde(rename = "type")]
    pub event_type: IntegrationEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntegrationEvent {
    /// Creates an event with a fresh id.
    #[must_use]
    pub fn new(
        integration_id: impl Into<String>,
        event_type: IntegrationEventType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            integration_id: integration_id.into(),
            event_type,
            timestamp,
            data: None,
            error: None,
        }
    }

    /// Attaches event data.
    #[must_use]
    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches an error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Callback invoked for each delivered event.
pub type EventListener = Arc<dyn Fn(&IntegrationEvent) + Send + Sync>;

/// Listener registry keyed by channel.
#[derive(Default)]
pub struct EventBus {
    channels: RwLock<HashMap<String, Vec<(ListenerId, EventListener)>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> = channels
            .iter()
            .map(|(channel, listeners)| (channel.as_str(), listeners.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to `channel` (an integration id or [`WILDCARD`]).
    pub fn subscribe<F>(&self, channel: &str, listener: F) -> ListenerId
    where
        F: Fn(&IntegrationEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns whether it was subscribed to `channel`.
    pub fn unsubscribe(&self, channel: &str, listener_id: ListenerId) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = channels.get_mut(channel) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener_id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Returns the number of listeners on `channel`.
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Delivers `event` to its integration's listeners, then to wildcard
    /// listeners, each in subscription order.
    ///
    /// Returns the number of listeners that ran without panicking.
    pub fn emit(&self, event: &IntegrationEvent) -> usize {
        // Snapshot so listeners may subscribe or unsubscribe while running.
        let listeners: Vec<(ListenerId, EventListener)> = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            let specific = Some(event.integration_id.as_str()).filter(|id| *id != WILDCARD);
            specific
                .into_iter()
                .chain([WILDCARD])
                .filter_map(|channel| channels.get(channel))
                .flatten()
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for (listener_id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    listener_id = %listener_id,
                    integration_id = %event.integration_id,
                    event_type = %event.event_type,
                    "event listener panicked"
                ),
            }
        }
        delivered
    }
}
