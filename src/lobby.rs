//! Per-vhost registry of connected backend workers.
//!
//! Workers enter the lobby when their `RD` announcement is accepted and
//! leave when their connection dies, their heartbeat lapses, or the vhost is
//! deleted. `next()` rotates round-robin over the live workers to support
//! direct-reply routing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrocket_proto::{Event, Packet};

/// Broker-side handle to one connected worker.
pub struct Worker {
    id: Uuid,
    identity: String,
    tx: mpsc::Sender<Packet>,
    last_seen: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Worker {
    /// Wrap the write side of an announced worker connection.
    pub(crate) fn new(id: Uuid, identity: String, tx: mpsc::Sender<Packet>) -> Worker {
        Worker {
            id,
            identity,
            tx,
            last_seen: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The raw identity string the worker announced with.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queue a `TR` frame carrying the event.
    ///
    /// Returns false when the connection's queue is gone or full; the
    /// caller treats that as a write failure and removes the worker.
    pub fn trigger(&self, event: &Event) -> bool {
        let packet = Packet::new(["TR".to_string(), event.to_json()]);
        self.tx.try_send(packet).is_ok()
    }

    pub(crate) fn touch(&self) {
        *self.last_seen.lock().expect("worker poisoned") = Instant::now();
    }

    pub(crate) fn expired(&self, deadline: Duration) -> bool {
        self.last_seen.lock().expect("worker poisoned").elapsed() > deadline
    }

    /// Ask the session task to drop the connection.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct LobbyInner {
    workers: Vec<Arc<Worker>>,
    robin: usize,
}

/// The set of live workers of one vhost.
pub struct Lobby {
    inner: Mutex<LobbyInner>,
}

impl Lobby {
    pub fn new() -> Lobby {
        Lobby {
            inner: Mutex::new(LobbyInner {
                workers: Vec::new(),
                robin: 0,
            }),
        }
    }

    pub fn add(&self, worker: Arc<Worker>) {
        let mut inner = self.inner.lock().expect("lobby poisoned");
        inner.workers.push(worker);
    }

    pub fn remove(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("lobby poisoned");
        inner.workers.retain(|w| w.id() != id);
    }

    /// Snapshot of the live workers.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let inner = self.inner.lock().expect("lobby poisoned");
        inner.workers.clone()
    }

    /// Round-robin pick over the live workers.
    pub fn next(&self) -> Option<Arc<Worker>> {
        let mut inner = self.inner.lock().expect("lobby poisoned");
        if inner.workers.is_empty() {
            return None;
        }
        let pick = inner.robin % inner.workers.len();
        inner.robin = inner.robin.wrapping_add(1);
        Some(Arc::clone(&inner.workers[pick]))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lobby poisoned").workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every worker connection. Used on vhost deletion and shutdown.
    pub fn kill_all(&self) {
        for worker in self.workers() {
            worker.kill();
        }
    }
}

impl Default for Lobby {
    fn default() -> Self {
        Lobby::new()
    }
}
