//! Vhosts: isolation scopes with their own channels, permissions and lobby.
//!
//! # Lock order
//!
//! When touching more than one layer, always acquire in this order:
//! Context vhost map → vhost maps (channels / permissions / lobby) →
//! channel subscriber map → subscriber/worker state. Never the reverse.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use webrocket_proto::Event;

use crate::channel::{Channel, ChannelKind};
use crate::error::EngineError;
use crate::lobby::Lobby;
use crate::permission::Permission;
use crate::storage::{ChannelRecord, PermissionRecord, Storage, VhostRecord};
use crate::subscriber::Subscriber;
use crate::token::{self, secure_compare, ACCESS_TOKEN_BYTES};

/// Check a vhost path against `^/[A-Za-z0-9._-]+$`.
pub fn validate_vhost_path(path: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"\A/[A-Za-z0-9._-]+\z").expect("valid regex"));
    pattern.is_match(path)
}

/// A named isolation scope.
pub struct Vhost {
    path: String,
    storage_key: AtomicU64,
    access_token: RwLock<String>,
    channels: DashMap<String, Arc<Channel>>,
    /// Single-use permissions, keyed by token. Lookup goes through a
    /// constant-time scan; the key only serves the map.
    permissions: DashMap<String, Permission>,
    lobby: Lobby,
    storage: Arc<Storage>,
}

impl Vhost {
    /// Create a vhost with a fresh access token. Not yet persisted.
    pub(crate) fn new(path: &str, storage: Arc<Storage>) -> Result<Vhost, EngineError> {
        if !validate_vhost_path(path) {
            return Err(EngineError::InvalidPath(path.to_string()));
        }
        Ok(Vhost {
            path: path.to_string(),
            storage_key: AtomicU64::new(0),
            access_token: RwLock::new(token::generate_token(ACCESS_TOKEN_BYTES)),
            channels: DashMap::new(),
            permissions: DashMap::new(),
            lobby: Lobby::new(),
            storage,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn storage_key(&self) -> u64 {
        self.storage_key.load(Ordering::Acquire)
    }

    pub(crate) fn set_storage_key(&self, key: u64) {
        self.storage_key.store(key, Ordering::Release);
    }

    /// The long-lived credential backends present when connecting.
    pub fn access_token(&self) -> String {
        self.access_token.read().expect("vhost poisoned").clone()
    }

    pub(crate) fn set_access_token(&self, token: String) {
        *self.access_token.write().expect("vhost poisoned") = token;
    }

    /// Rotate the access token and persist the new one.
    pub fn generate_access_token(&self) -> Result<String, EngineError> {
        let fresh = token::generate_token(ACCESS_TOKEN_BYTES);
        self.storage.vhosts().update(
            self.storage_key(),
            VhostRecord {
                path: self.path.clone(),
                access_token: fresh.clone(),
            },
        )?;
        self.set_access_token(fresh.clone());
        Ok(fresh)
    }

    /// Constant-time check of a presented access token.
    pub fn authenticate(&self, token: &str) -> bool {
        let current = self.access_token.read().expect("vhost poisoned");
        secure_compare(&current, token)
    }

    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    // Channels
    // ------------------------------------------------------------------

    /// Open a channel. The kind is derived from the name; passing an
    /// explicit kind that contradicts the prefix is an invalid name.
    pub fn open_channel(
        &self,
        name: &str,
        kind: Option<ChannelKind>,
    ) -> Result<Arc<Channel>, EngineError> {
        let kind = kind.unwrap_or_else(|| ChannelKind::from_name(name));
        match self.channels.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::ChannelExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let channel = Channel::new(name, kind)?;
                let key = self.storage.channels().set(ChannelRecord {
                    vhost: self.storage_key(),
                    name: name.to_string(),
                    kind,
                })?;
                channel.set_storage_key(key);
                let channel = Arc::new(channel);
                slot.insert(Arc::clone(&channel));
                debug!(vhost = %self.path, channel = %name, ?kind, "channel opened");
                Ok(channel)
            }
        }
    }

    pub fn channel(&self, name: &str) -> Result<Arc<Channel>, EngineError> {
        self.channels
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::ChannelNotFound(name.to_string()))
    }

    /// Snapshot of the channels. Ordering unspecified.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Delete a channel, unsubscribing (and notifying) every subscriber.
    pub fn delete_channel(&self, name: &str) -> Result<(), EngineError> {
        let (_, channel) = self
            .channels
            .remove(name)
            .ok_or_else(|| EngineError::ChannelNotFound(name.to_string()))?;
        let mut farewell = Map::new();
        farewell.insert("channel".to_string(), Value::String(name.to_string()));
        let payload = Event::new("__unsubscribed", farewell).to_json();
        for subscriber in channel.subscribers() {
            channel.remove_subscriber(&subscriber);
            subscriber.send(&payload);
        }
        self.storage.channels().delete(channel.storage_key())?;
        debug!(vhost = %self.path, channel = %name, "channel deleted");
        Ok(())
    }

    /// Delete every channel of this vhost.
    pub fn delete_all_channels(&self) -> Result<(), EngineError> {
        let names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.delete_channel(&name)?;
        }
        Ok(())
    }

    /// Attach a channel rebuilt from storage.
    pub(crate) fn insert_loaded_channel(&self, channel: Arc<Channel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe a session to a channel.
    ///
    /// Presence and private channels require a prior single-use-token
    /// authorization matching the channel name. On presence channels a
    /// non-hidden subscribe announces itself to all other subscribers.
    pub fn subscribe(
        &self,
        channel_name: &str,
        subscriber: &Arc<Subscriber>,
        hidden: bool,
    ) -> Result<Arc<Channel>, EngineError> {
        let channel = self.channel(channel_name)?;
        if channel.kind().is_protected() && !subscriber.is_authorized_for(channel_name) {
            return Err(EngineError::Unauthorized);
        }
        channel.add_subscriber(subscriber, hidden);
        if channel.kind() == ChannelKind::Presence && !hidden {
            channel.broadcast(
                "__subscribe",
                &presence_payload(channel_name, subscriber),
                Some(subscriber.sid()),
            );
        }
        Ok(channel)
    }

    /// Symmetric to [`subscribe`](Vhost::subscribe); presence channels
    /// announce the departure.
    pub fn unsubscribe(
        &self,
        channel_name: &str,
        subscriber: &Arc<Subscriber>,
    ) -> Result<(), EngineError> {
        let channel = self.channel(channel_name)?;
        let hidden = subscriber.is_hidden_on(channel_name);
        channel.remove_subscriber(subscriber);
        if channel.kind() == ChannelKind::Presence && !hidden {
            channel.broadcast(
                "__unsubscribe",
                &presence_payload(channel_name, subscriber),
                Some(subscriber.sid()),
            );
        }
        Ok(())
    }

    // Events
    // ------------------------------------------------------------------

    /// Broadcast on a channel and fan the event out to every worker.
    pub fn broadcast(
        &self,
        channel_name: &str,
        event: &str,
        data: Map<String, Value>,
        except: Option<&str>,
    ) -> Result<(), EngineError> {
        let channel = self.channel(channel_name)?;
        channel.broadcast(event, &data, except);
        self.trigger_workers(&Event::new(event, data));
        Ok(())
    }

    /// Deliver an event to every worker in the lobby.
    pub fn trigger_workers(&self, event: &Event) {
        for worker in self.lobby.workers() {
            if !worker.trigger(event) {
                warn!(vhost = %self.path, worker = %worker.id(), "worker write failed, dropping");
                worker.kill();
                self.lobby.remove(worker.id());
            }
        }
    }

    // Permissions
    // ------------------------------------------------------------------

    /// Issue a single-use token for `uid` over channels matching `pattern`.
    pub fn generate_single_access_token(
        &self,
        uid: &str,
        pattern: &str,
    ) -> Result<String, EngineError> {
        let mut permission = Permission::new(uid, pattern)?;
        let key = self.storage.permissions().set(PermissionRecord {
            vhost: self.storage_key(),
            uid: uid.to_string(),
            pattern: permission.pattern().to_string(),
            token: permission.token().to_string(),
        })?;
        permission.set_storage_key(key);
        let token = permission.token().to_string();
        self.permissions.insert(token.clone(), permission);
        Ok(token)
    }

    /// Validate and consume a single-use token.
    ///
    /// The scan compares every stored token in constant time. On a match
    /// the permission is deleted before it is returned, so a second
    /// validation of the same token always fails.
    pub fn validate_single_access_token(&self, token: &str) -> Option<Permission> {
        let mut matched = None;
        for entry in self.permissions.iter() {
            if secure_compare(entry.key(), token) {
                matched = Some(entry.key().clone());
            }
        }
        let (_, permission) = self.permissions.remove(&matched?)?;
        if let Err(err) = self.storage.permissions().delete(permission.storage_key()) {
            warn!(vhost = %self.path, error = %err, "failed to delete consumed permission");
        }
        Some(permission)
    }

    /// Snapshot of the outstanding permissions.
    pub fn permissions(&self) -> Vec<Permission> {
        self.permissions.iter().map(|e| e.value().clone()).collect()
    }

    /// Attach a permission rebuilt from storage.
    pub(crate) fn insert_loaded_permission(&self, permission: Permission) {
        self.permissions
            .insert(permission.token().to_string(), permission);
    }

    // Teardown
    // ------------------------------------------------------------------

    /// Close every subscriber, disconnect every worker, drop permissions.
    /// In-memory only; the owning context deletes the persisted rows.
    pub(crate) fn kill(&self) {
        for channel in self.channels() {
            for subscriber in channel.subscribers() {
                channel.remove_subscriber(&subscriber);
                subscriber.kill();
            }
        }
        self.channels.clear();
        self.permissions.clear();
        self.lobby.kill_all();
    }
}

fn presence_payload(channel: &str, subscriber: &Subscriber) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("channel".to_string(), Value::String(channel.to_string()));
    if let Some(uid) = subscriber.uid() {
        data.insert("uid".to_string(), Value::String(uid));
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn storage() -> (Arc<Storage>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path(), "test").unwrap());
        (storage, dir)
    }

    fn vhost(storage: &Arc<Storage>) -> Vhost {
        Vhost::new("/test", Arc::clone(storage)).unwrap()
    }

    fn subscriber() -> (Arc<Subscriber>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Subscriber::new(tx)), rx)
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_vhost_path("/hello"));
        assert!(validate_vhost_path("/h.e_l-l0"));
        assert!(!validate_vhost_path("hello"));
        assert!(!validate_vhost_path("/"));
        assert!(!validate_vhost_path("/a/b"));
        assert!(!validate_vhost_path(""));
        assert!(!validate_vhost_path("/==="));
    }

    #[test]
    fn test_access_token_shape_and_rotation() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        let key = storage
            .vhosts()
            .set(VhostRecord {
                path: v.path().into(),
                access_token: v.access_token(),
            })
            .unwrap();
        v.set_storage_key(key);

        let before = v.access_token();
        assert_eq!(before.len(), 128);
        assert!(v.authenticate(&before));

        let after = v.generate_access_token().unwrap();
        assert_ne!(before, after);
        assert!(!v.authenticate(&before));
        assert!(v.authenticate(&after));
        // Rotation is persisted.
        assert_eq!(storage.vhosts().all()[0].1.access_token, after);
    }

    #[test]
    fn test_open_channel_is_unique_and_lookup_works() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        let opened = v.open_channel("world", None).unwrap();
        assert_eq!(opened.kind(), ChannelKind::Normal);
        assert!(Arc::ptr_eq(&opened, &v.channel("world").unwrap()));
        assert!(matches!(
            v.open_channel("world", None),
            Err(EngineError::ChannelExists(_))
        ));
    }

    #[test]
    fn test_open_channel_rejects_bad_names_and_kinds() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        assert!(matches!(
            v.open_channel("===", None),
            Err(EngineError::InvalidChannelName(_))
        ));
        assert!(matches!(
            v.open_channel("plain", Some(ChannelKind::Presence)),
            Err(EngineError::InvalidChannelName(_))
        ));
        let presence = v.open_channel("presence-room", None).unwrap();
        assert_eq!(presence.kind(), ChannelKind::Presence);
    }

    #[test]
    fn test_delete_channel_notifies_subscribers() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        v.open_channel("world", None).unwrap();
        let (sub, mut rx) = subscriber();
        v.subscribe("world", &sub, false).unwrap();

        v.delete_channel("world").unwrap();
        assert!(v.channel("world").is_err());
        assert!(!sub.is_subscribed_to("world"));
        let payload = rx.try_recv().unwrap();
        assert!(payload.contains("__unsubscribed"));
        // The persisted row went with it.
        assert!(storage.channels().all().is_empty());
    }

    #[test]
    fn test_protected_channels_require_authorization() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        v.open_channel("private-vip", None).unwrap();
        let (sub, _rx) = subscriber();

        assert!(matches!(
            v.subscribe("private-vip", &sub, false),
            Err(EngineError::Unauthorized)
        ));

        let token = v.generate_single_access_token("joe", "private-.*").unwrap();
        let permission = v.validate_single_access_token(&token).unwrap();
        sub.authorize(permission);
        assert!(v.subscribe("private-vip", &sub, false).is_ok());
    }

    #[test]
    fn test_single_access_token_validates_once() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        let token = v.generate_single_access_token("joe", ".*").unwrap();
        assert_eq!(token.len(), 128);
        assert_eq!(storage.permissions().all().len(), 1);

        let permission = v.validate_single_access_token(&token).unwrap();
        assert_eq!(permission.uid(), "joe");
        // Consumed: the second validation fails and the row is gone.
        assert!(v.validate_single_access_token(&token).is_none());
        assert!(storage.permissions().all().is_empty());
    }

    #[test]
    fn test_presence_announcements() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        v.open_channel("presence-room", None).unwrap();

        let (joe, mut joe_rx) = subscriber();
        let (ann, mut ann_rx) = subscriber();
        for (sub, uid) in [(&joe, "joe"), (&ann, "ann")] {
            let token = v.generate_single_access_token(uid, ".*").unwrap();
            sub.authorize(v.validate_single_access_token(&token).unwrap());
        }

        v.subscribe("presence-room", &joe, false).unwrap();
        v.subscribe("presence-room", &ann, false).unwrap();

        // Joe saw Ann arrive; Ann saw nothing (she was excluded from her
        // own announcement).
        let payload = joe_rx.try_recv().unwrap();
        assert!(payload.contains("__subscribe"));
        assert!(payload.contains("ann"));
        assert!(ann_rx.try_recv().is_err());

        v.unsubscribe("presence-room", &ann).unwrap();
        let payload = joe_rx.try_recv().unwrap();
        assert!(payload.contains("__unsubscribe"));
    }

    #[test]
    fn test_hidden_subscribe_stays_silent() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        v.open_channel("presence-room", None).unwrap();

        let (joe, mut joe_rx) = subscriber();
        let (ghost, _ghost_rx) = subscriber();
        for (sub, uid) in [(&joe, "joe"), (&ghost, "ghost")] {
            let token = v.generate_single_access_token(uid, ".*").unwrap();
            sub.authorize(v.validate_single_access_token(&token).unwrap());
        }
        v.subscribe("presence-room", &joe, false).unwrap();
        v.subscribe("presence-room", &ghost, true).unwrap();

        assert!(joe_rx.try_recv().is_err());
        assert_eq!(
            v.channel("presence-room").unwrap().presence_members(),
            vec!["joe".to_string()]
        );
    }

    #[test]
    fn test_broadcast_reaches_subscribers_and_workers() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        v.open_channel("news", None).unwrap();
        let (sub, mut sub_rx) = subscriber();
        v.subscribe("news", &sub, false).unwrap();

        let (worker_tx, mut worker_rx) = mpsc::channel(4);
        v.lobby().add(Arc::new(crate::lobby::Worker::new(
            uuid::Uuid::new_v4(),
            "dlr:/test:t:id".into(),
            worker_tx,
        )));

        let mut data = Map::new();
        data.insert("foo".into(), Value::String("bar".into()));
        v.broadcast("news", "test", data, None).unwrap();

        let payload = sub_rx.try_recv().unwrap();
        assert!(payload.contains("\"test\""));
        let packet = worker_rx.try_recv().unwrap();
        assert_eq!(packet.frames[0], "TR");
        assert!(packet.frames[1].contains("\"foo\":\"bar\""));
    }

    #[test]
    fn test_broadcast_on_missing_channel() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        assert!(matches!(
            v.broadcast("nope", "x", Map::new(), None),
            Err(EngineError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_kill_clears_everything() {
        let (storage, _dir) = storage();
        let v = vhost(&storage);
        v.open_channel("a", None).unwrap();
        let (sub, _rx) = subscriber();
        v.subscribe("a", &sub, false).unwrap();
        v.generate_single_access_token("joe", ".*").unwrap();

        v.kill();
        assert!(v.channels().is_empty());
        assert!(v.permissions().is_empty());
        assert!(!sub.is_subscribed_to("a"));
        assert!(sub.cancel_token().is_cancelled());
    }
}
