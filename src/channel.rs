//! Channels and broadcast fan-out.
//!
//! A channel is a named broadcast group within a vhost. Its kind is derived
//! once from the name prefix and decides the subscription rules: `presence-`
//! channels announce joins and leaves, `private-` channels (like presence
//! ones) require a single-use token authorization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use webrocket_proto::Event;

use crate::error::EngineError;
use crate::subscriber::Subscriber;

/// The three channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Normal,
    Presence,
    Private,
}

impl ChannelKind {
    /// Derive the kind from a channel name prefix.
    pub fn from_name(name: &str) -> ChannelKind {
        if name.starts_with("presence-") {
            ChannelKind::Presence
        } else if name.starts_with("private-") {
            ChannelKind::Private
        } else {
            ChannelKind::Normal
        }
    }

    /// Whether subscription requires a prior token authorization.
    pub fn is_protected(self) -> bool {
        matches!(self, ChannelKind::Presence | ChannelKind::Private)
    }
}

/// Check a channel name against `^[A-Za-z0-9._-]+$`.
pub fn validate_channel_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"\A[A-Za-z0-9._-]+\z").expect("valid regex"));
    pattern.is_match(name)
}

/// A named broadcast group.
pub struct Channel {
    name: String,
    kind: ChannelKind,
    storage_key: AtomicU64,
    subscribers: DashMap<String, Arc<Subscriber>>,
}

impl Channel {
    /// Create a channel, validating the name and the kind against it.
    pub(crate) fn new(name: &str, kind: ChannelKind) -> Result<Channel, EngineError> {
        if !validate_channel_name(name) || kind != ChannelKind::from_name(name) {
            return Err(EngineError::InvalidChannelName(name.to_string()));
        }
        Ok(Channel {
            name: name.to_string(),
            kind,
            storage_key: AtomicU64::new(0),
            subscribers: DashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn storage_key(&self) -> u64 {
        self.storage_key.load(Ordering::Acquire)
    }

    pub(crate) fn set_storage_key(&self, key: u64) {
        self.storage_key.store(key, Ordering::Release);
    }

    /// Snapshot of the current subscribers.
    pub fn subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscriber(&self, sid: &str) -> bool {
        self.subscribers.contains_key(sid)
    }

    /// Add a subscriber, updating both sides of the bidirectional index.
    pub(crate) fn add_subscriber(&self, subscriber: &Arc<Subscriber>, hidden: bool) {
        subscriber.joined(&self.name, hidden);
        self.subscribers
            .insert(subscriber.sid().to_string(), Arc::clone(subscriber));
    }

    /// Remove a subscriber, updating both sides of the bidirectional index.
    pub(crate) fn remove_subscriber(&self, subscriber: &Subscriber) {
        subscriber.left(&self.name);
        self.subscribers.remove(subscriber.sid());
    }

    /// Serialize `{event: data}` and queue it on every subscriber.
    ///
    /// Delivery is best-effort per subscriber: a dead connection is dropped
    /// from the channel, but never fails the broadcast. `except` excludes
    /// the originator.
    pub fn broadcast(&self, event: &str, data: &Map<String, Value>, except: Option<&str>) {
        let payload = Event::new(event, data.clone()).to_json();
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if except == Some(entry.key().as_str()) {
                continue;
            }
            if !entry.value().send(&payload) {
                dead.push(Arc::clone(entry.value()));
            }
        }
        for subscriber in dead {
            debug!(channel = %self.name, sid = %subscriber.sid(), "dropping dead subscriber");
            self.remove_subscriber(&subscriber);
            subscriber.kill();
        }
    }

    /// User ids of the non-hidden members of a presence channel.
    pub fn presence_members(&self) -> Vec<String> {
        self.subscribers
            .iter()
            .filter(|e| !e.value().is_hidden_on(&self.name))
            .filter_map(|e| e.value().uid())
            .collect()
    }
}
