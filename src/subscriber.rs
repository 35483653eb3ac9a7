//! WebSocket-side participants.
//!
//! A subscriber is the engine's handle to one browser connection: a stable
//! session id, the write side of the connection (an unbounded queue drained
//! by the connection's writer task, so one slow browser never blocks a
//! broadcast), the single-use permission it authorized with, and the set of
//! channels it is subscribed to.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::permission::Permission;

#[derive(Default)]
struct SubscriberState {
    permission: Option<Permission>,
    /// Subscribed channel names, with the hidden flag used on presence
    /// channels.
    channels: HashMap<String, bool>,
}

/// One connected WebSocket session.
pub struct Subscriber {
    sid: String,
    tx: mpsc::UnboundedSender<String>,
    state: Mutex<SubscriberState>,
    cancel: CancellationToken,
}

impl Subscriber {
    /// Wrap the write side of a fresh connection.
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Subscriber {
        Subscriber {
            sid: Uuid::new_v4().simple().to_string(),
            tx,
            state: Mutex::new(SubscriberState::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// The session id assigned at connect time.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// The user id from the authorized permission, if any.
    pub fn uid(&self) -> Option<String> {
        let state = self.state.lock().expect("subscriber poisoned");
        state.permission.as_ref().map(|p| p.uid().to_string())
    }

    /// Attach a validated (already consumed) permission to this session.
    pub fn authorize(&self, permission: Permission) {
        let mut state = self.state.lock().expect("subscriber poisoned");
        state.permission = Some(permission);
    }

    /// Whether the session's permission covers the given channel.
    pub fn is_authorized_for(&self, channel: &str) -> bool {
        let state = self.state.lock().expect("subscriber poisoned");
        state
            .permission
            .as_ref()
            .map(|p| p.is_matching(channel))
            .unwrap_or(false)
    }

    /// Queue a payload on the session's write side.
    ///
    /// Returns false when the connection is gone; the caller is expected to
    /// drop the subscriber from its registries.
    pub fn send(&self, payload: &str) -> bool {
        self.tx.send(payload.to_string()).is_ok()
    }

    pub(crate) fn joined(&self, channel: &str, hidden: bool) {
        let mut state = self.state.lock().expect("subscriber poisoned");
        state.channels.insert(channel.to_string(), hidden);
    }

    pub(crate) fn left(&self, channel: &str) {
        let mut state = self.state.lock().expect("subscriber poisoned");
        state.channels.remove(channel);
    }

    /// Names of every channel this session is subscribed to.
    pub fn channels(&self) -> Vec<String> {
        let state = self.state.lock().expect("subscriber poisoned");
        state.channels.keys().cloned().collect()
    }

    /// Whether the session subscribed to `channel` as hidden.
    pub fn is_hidden_on(&self, channel: &str) -> bool {
        let state = self.state.lock().expect("subscriber poisoned");
        state.channels.get(channel).copied().unwrap_or(false)
    }

    pub fn is_subscribed_to(&self, channel: &str) -> bool {
        let state = self.state.lock().expect("subscriber poisoned");
        state.channels.contains_key(channel)
    }

    /// Ask the owning connection task to close the session.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Token the connection task watches for [`kill`](Subscriber::kill).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber() -> (Subscriber, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscriber::new(tx), rx)
    }

    #[test]
    fn test_send_queues_payload() {
        let (sub, mut rx) = subscriber();
        assert!(sub.send("{\"hello\":{}}"));
        assert_eq!(rx.try_recv().unwrap(), "{\"hello\":{}}");
    }

    #[test]
    fn test_send_reports_dead_connection() {
        let (sub, rx) = subscriber();
        drop(rx);
        assert!(!sub.send("{}"));
    }

    #[test]
    fn test_authorization() {
        let (sub, _rx) = subscriber();
        assert!(!sub.is_authorized_for("private-room"));
        assert_eq!(sub.uid(), None);

        let permission = Permission::new("joe", "private-.*").unwrap();
        sub.authorize(permission);
        assert!(sub.is_authorized_for("private-room"));
        assert!(!sub.is_authorized_for("other"));
        assert_eq!(sub.uid().as_deref(), Some("joe"));
    }

    #[test]
    fn test_channel_bookkeeping() {
        let (sub, _rx) = subscriber();
        sub.joined("a", false);
        sub.joined("presence-b", true);
        assert!(sub.is_subscribed_to("a"));
        assert!(sub.is_hidden_on("presence-b"));
        assert!(!sub.is_hidden_on("a"));

        sub.left("a");
        assert!(!sub.is_subscribed_to("a"));
        assert_eq!(sub.channels(), vec!["presence-b".to_string()]);
    }
}
