//! The broker context.
//!
//! The context owns the node identity, the storage, the admin cookie and
//! the vhost registry, and coordinates shutdown. Bootstrap order is fixed:
//! construct, `set_storage_dir`, optionally `set_node_name`, `lock`,
//! `load`, `generate_cookie`, then hand the context to the endpoints.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::error::{EngineError, StorageError};
use crate::permission::Permission;
use crate::storage::{Storage, VhostRecord};
use crate::token::{self, COOKIE_BYTES};
use crate::vhost::Vhost;

/// Root object of one broker node.
pub struct Context {
    node_name: String,
    storage_dir: Option<PathBuf>,
    storage: Option<Arc<Storage>>,
    cookie: RwLock<String>,
    vhosts: DashMap<String, Arc<Vhost>>,
    lock_path: Mutex<Option<PathBuf>>,
    cancel: CancellationToken,
}

impl Context {
    /// A context named after the local host, with no storage attached yet.
    pub fn new() -> Context {
        Context {
            node_name: default_node_name(),
            storage_dir: None,
            storage: None,
            cookie: RwLock::new(String::new()),
            vhosts: DashMap::new(),
            lock_path: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Override the node name. Must happen before `lock` and `load`.
    pub fn set_node_name(&mut self, name: &str) {
        self.node_name = name.to_string();
    }

    /// Point the context at its storage directory, creating it if needed.
    pub fn set_storage_dir(&mut self, dir: &Path) -> Result<(), EngineError> {
        std::fs::create_dir_all(dir).map_err(StorageError::Io)?;
        self.storage_dir = Some(dir.to_path_buf());
        Ok(())
    }

    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    fn node_file(&self, suffix: &str) -> Result<PathBuf, EngineError> {
        let dir = self.storage_dir.as_ref().ok_or_else(not_ready)?;
        Ok(dir.join(format!("{}.{}", self.node_name, suffix)))
    }

    fn storage(&self) -> Result<Arc<Storage>, EngineError> {
        self.storage.clone().ok_or_else(not_ready)
    }

    /// Take the node's file lock, refusing to share a storage dir with
    /// another live process.
    pub fn lock(&self) -> Result<(), EngineError> {
        let path = self.node_file("lock")?;
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(EngineError::Storage(StorageError::Locked(
                    path.display().to_string(),
                )));
            }
            Err(err) => return Err(EngineError::Storage(StorageError::Io(err))),
        };
        let _ = writeln!(file, "{}", std::process::id());
        *self.lock_path.lock().expect("context poisoned") = Some(path);
        Ok(())
    }

    /// Open the buckets and rebuild the vhost registry from them.
    ///
    /// Vhosts come first; channels and permissions attach to their vhost by
    /// bucket key, and rows pointing at a missing vhost are deleted.
    pub fn load(&mut self) -> Result<(), EngineError> {
        let dir = self.storage_dir.clone().ok_or_else(not_ready)?;
        let storage = Arc::new(Storage::open(&dir, &self.node_name)?);

        let mut by_key: HashMap<u64, Arc<Vhost>> = HashMap::new();
        for (key, record) in storage.vhosts().all() {
            match Vhost::new(&record.path, Arc::clone(&storage)) {
                Ok(vhost) => {
                    vhost.set_storage_key(key);
                    vhost.set_access_token(record.access_token);
                    let vhost = Arc::new(vhost);
                    by_key.insert(key, Arc::clone(&vhost));
                    self.vhosts.insert(record.path, vhost);
                }
                Err(err) => {
                    warn!(path = %record.path, error = %err, "dropping corrupt vhost row");
                    storage.vhosts().delete(key)?;
                }
            }
        }
        for (key, record) in storage.channels().all() {
            match by_key.get(&record.vhost) {
                Some(vhost) => match Channel::new(&record.name, record.kind) {
                    Ok(channel) => {
                        channel.set_storage_key(key);
                        vhost.insert_loaded_channel(Arc::new(channel));
                    }
                    Err(err) => {
                        warn!(name = %record.name, error = %err, "dropping corrupt channel row");
                        storage.channels().delete(key)?;
                    }
                },
                None => storage.channels().delete(key)?,
            }
        }
        for (key, record) in storage.permissions().all() {
            match by_key.get(&record.vhost) {
                Some(vhost) => {
                    match Permission::from_parts(key, &record.uid, &record.pattern, record.token)
                    {
                        Ok(permission) => vhost.insert_loaded_permission(permission),
                        Err(err) => {
                            warn!(uid = %record.uid, error = %err, "dropping corrupt permission row");
                            storage.permissions().delete(key)?;
                        }
                    }
                }
                None => storage.permissions().delete(key)?,
            }
        }

        info!(
            node = %self.node_name,
            vhosts = self.vhosts.len(),
            "state loaded"
        );
        self.storage = Some(storage);
        Ok(())
    }

    // Cookie
    // ------------------------------------------------------------------

    /// Ensure the node's cookie file exists and read it into memory.
    ///
    /// An existing cookie survives unless `force` asks for regeneration.
    pub fn generate_cookie(&self, force: bool) -> Result<(), EngineError> {
        let path = self.node_file("cookie")?;
        if !force && path.exists() {
            let existing = std::fs::read_to_string(&path).map_err(StorageError::Io)?;
            let existing = existing.trim().to_string();
            if existing.len() >= 2 * COOKIE_BYTES {
                *self.cookie.write().expect("context poisoned") = existing;
                return Ok(());
            }
        }
        let fresh = token::generate_token(COOKIE_BYTES);
        std::fs::write(&path, &fresh).map_err(StorageError::Io)?;
        *self.cookie.write().expect("context poisoned") = fresh;
        Ok(())
    }

    /// The shared secret authenticating the admin surface.
    pub fn cookie(&self) -> String {
        self.cookie.read().expect("context poisoned").clone()
    }

    // Vhosts
    // ------------------------------------------------------------------

    /// Register a vhost under a validated path and persist it.
    pub fn add_vhost(&self, path: &str) -> Result<Arc<Vhost>, EngineError> {
        let storage = self.storage()?;
        match self.vhosts.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::VhostExists(path.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let vhost = Vhost::new(path, Arc::clone(&storage))?;
                let key = storage.vhosts().set(VhostRecord {
                    path: path.to_string(),
                    access_token: vhost.access_token(),
                })?;
                vhost.set_storage_key(key);
                let vhost = Arc::new(vhost);
                slot.insert(Arc::clone(&vhost));
                info!(path = %path, "vhost added");
                Ok(vhost)
            }
        }
    }

    pub fn vhost(&self, path: &str) -> Result<Arc<Vhost>, EngineError> {
        self.vhosts
            .get(path)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::VhostNotFound(path.to_string()))
    }

    /// Snapshot of the registered vhosts. Ordering unspecified.
    pub fn vhosts(&self) -> Vec<Arc<Vhost>> {
        self.vhosts.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Delete a vhost and everything it owns.
    ///
    /// Closes every subscriber, disconnects every worker, then deletes the
    /// persisted rows in order: permissions, channels, vhost.
    pub fn delete_vhost(&self, path: &str) -> Result<(), EngineError> {
        let storage = self.storage()?;
        let (_, vhost) = self
            .vhosts
            .remove(path)
            .ok_or_else(|| EngineError::VhostNotFound(path.to_string()))?;

        let permission_keys: Vec<u64> = vhost
            .permissions()
            .iter()
            .map(|p| p.storage_key())
            .collect();
        let channel_keys: Vec<u64> = vhost.channels().iter().map(|c| c.storage_key()).collect();
        vhost.kill();

        for key in permission_keys {
            storage.permissions().delete(key)?;
        }
        for key in channel_keys {
            storage.channels().delete(key)?;
        }
        storage.vhosts().delete(vhost.storage_key())?;
        info!(path = %path, "vhost deleted");
        Ok(())
    }

    /// Delete every vhost.
    pub fn clear_vhosts(&self) -> Result<(), EngineError> {
        let paths: Vec<String> = self.vhosts.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            self.delete_vhost(&path)?;
        }
        Ok(())
    }

    // Lifecycle
    // ------------------------------------------------------------------

    /// Token endpoints watch to stop accepting and close connections.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shut the node down: stop endpoints, close connections, flush
    /// storage, release the file lock.
    pub fn kill(&self) {
        self.cancel.cancel();
        for vhost in self.vhosts() {
            vhost.kill();
        }
        if let Some(storage) = &self.storage {
            storage.kill();
        }
        if let Some(path) = self.lock_path.lock().expect("context poisoned").take() {
            let _ = std::fs::remove_file(path);
        }
        info!(node = %self.node_name, "context killed");
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

fn not_ready() -> EngineError {
    EngineError::Storage(StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "storage not configured",
    )))
}

/// Read a node's cookie file, as written by
/// [`generate_cookie`](Context::generate_cookie).
pub fn read_cookie(dir: &Path, node: &str) -> Option<String> {
    let raw = std::fs::read_to_string(dir.join(format!("{}.cookie", node))).ok()?;
    let cookie = raw.trim().to_string();
    if cookie.is_empty() {
        None
    } else {
        Some(cookie)
    }
}

/// Name of the node, taken from the operating system's host name.
pub fn default_node_name() -> String {
    std::process::Command::new("uname")
        .arg("-n")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrapped(dir: &Path) -> Context {
        let mut ctx = Context::new();
        ctx.set_storage_dir(dir).unwrap();
        ctx.set_node_name("testnode");
        ctx.lock().unwrap();
        ctx.load().unwrap();
        ctx.generate_cookie(false).unwrap();
        ctx
    }

    #[test]
    fn test_add_and_lookup_vhost() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = bootstrapped(dir.path());

        let vhost = ctx.add_vhost("/hello").unwrap();
        assert_eq!(vhost.path(), "/hello");
        assert_eq!(vhost.access_token().len(), 128);
        assert!(Arc::ptr_eq(&vhost, &ctx.vhost("/hello").unwrap()));

        assert!(matches!(
            ctx.add_vhost("/hello"),
            Err(EngineError::VhostExists(_))
        ));
        assert!(matches!(
            ctx.add_vhost("no-slash"),
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(
            ctx.vhost("/nope"),
            Err(EngineError::VhostNotFound(_))
        ));
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let token;
        {
            let ctx = bootstrapped(dir.path());
            let vhost = ctx.add_vhost("/persist").unwrap();
            token = vhost.access_token();
            vhost.open_channel("world", None).unwrap();
            vhost.generate_single_access_token("joe", ".*").unwrap();
            ctx.kill();
        }

        let ctx = bootstrapped(dir.path());
        let vhost = ctx.vhost("/persist").unwrap();
        assert_eq!(vhost.access_token(), token);
        assert!(vhost.channel("world").is_ok());
        assert_eq!(vhost.permissions().len(), 1);
        assert_eq!(vhost.permissions()[0].uid(), "joe");
        ctx.kill();
    }

    #[test]
    fn test_orphan_rows_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::open(dir.path(), "testnode").unwrap();
            storage
                .channels()
                .set(crate::storage::ChannelRecord {
                    vhost: 42,
                    name: "orphan".into(),
                    kind: crate::channel::ChannelKind::Normal,
                })
                .unwrap();
            storage.kill();
        }

        let ctx = bootstrapped(dir.path());
        assert!(ctx.vhosts().is_empty());
        ctx.kill();

        let storage = Storage::open(dir.path(), "testnode").unwrap();
        assert!(storage.channels().all().is_empty());
    }

    #[test]
    fn test_delete_vhost_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = bootstrapped(dir.path());
        let vhost = ctx.add_vhost("/doomed").unwrap();
        vhost.open_channel("a", None).unwrap();
        vhost.open_channel("b", None).unwrap();
        vhost.generate_single_access_token("joe", ".*").unwrap();

        ctx.delete_vhost("/doomed").unwrap();
        assert!(ctx.vhost("/doomed").is_err());

        // Nothing of it remains after a reload.
        ctx.kill();
        let ctx = bootstrapped(dir.path());
        assert!(ctx.vhosts().is_empty());
        ctx.kill();
    }

    #[test]
    fn test_cookie_shape_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = bootstrapped(dir.path());
        let cookie = ctx.cookie();
        assert_eq!(cookie.len(), 40);

        // Same cookie read back unless forced.
        ctx.generate_cookie(false).unwrap();
        assert_eq!(ctx.cookie(), cookie);
        ctx.generate_cookie(true).unwrap();
        assert_ne!(ctx.cookie(), cookie);
        ctx.kill();
    }

    #[test]
    fn test_lock_excludes_second_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = bootstrapped(dir.path());

        let mut second = Context::new();
        second.set_storage_dir(dir.path()).unwrap();
        second.set_node_name("testnode");
        assert!(matches!(
            second.lock(),
            Err(EngineError::Storage(StorageError::Locked(_)))
        ));

        // The lock is released on kill.
        ctx.kill();
        second.lock().unwrap();
        second.kill();
    }

    #[test]
    fn test_clear_vhosts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = bootstrapped(dir.path());
        ctx.add_vhost("/a").unwrap();
        ctx.add_vhost("/b").unwrap();
        ctx.clear_vhosts().unwrap();
        assert!(ctx.vhosts().is_empty());
        ctx.kill();
    }
}
