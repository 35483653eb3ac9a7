//! Persistence adapter.
//!
//! State lives in three append-oriented keyed buckets under the storage
//! directory: `<node>.vhosts.bkt`, `<node>.channels.bkt` and
//! `<node>.permissions.bkt`. Each bucket is a log of serde_json records
//! (`set` / `delete`), replayed into memory on open. Every accepted
//! mutation is appended and flushed before the operation reports success.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::ChannelKind;
use crate::error::StorageError;

/// Stored shape of a vhost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VhostRecord {
    pub path: String,
    pub access_token: String,
}

/// Stored shape of a channel, attached to its vhost by bucket key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub vhost: u64,
    pub name: String,
    pub kind: ChannelKind,
}

/// Stored shape of a single-use permission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub vhost: u64,
    pub uid: String,
    pub pattern: String,
    pub token: String,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Record<T> {
    Set { key: u64, value: T },
    Delete { key: u64 },
}

struct BucketInner<T> {
    file: File,
    entries: BTreeMap<u64, T>,
    next_key: u64,
}

/// One append-oriented keyed bucket.
pub struct Bucket<T> {
    path: PathBuf,
    inner: Mutex<BucketInner<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> Bucket<T> {
    fn open(path: PathBuf) -> Result<Bucket<T>, StorageError> {
        let mut entries = BTreeMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Record<T>>(&line)? {
                    Record::Set { key, value } => {
                        entries.insert(key, value);
                    }
                    Record::Delete { key } => {
                        entries.remove(&key);
                    }
                }
            }
        }
        let next_key = entries.keys().next_back().map(|k| k + 1).unwrap_or(1);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Bucket {
            path,
            inner: Mutex::new(BucketInner {
                file,
                entries,
                next_key,
            }),
        })
    }

    fn append(inner: &mut BucketInner<T>, record: &Record<T>) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        inner.file.write_all(line.as_bytes())?;
        inner.file.flush()?;
        Ok(())
    }

    /// Store a new value, assigning it a fresh key.
    pub fn set(&self, value: T) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().expect("bucket poisoned");
        let key = inner.next_key;
        inner.next_key += 1;
        Self::append(&mut inner, &Record::Set {
            key,
            value: value.clone(),
        })?;
        inner.entries.insert(key, value);
        Ok(key)
    }

    /// Replace the value under an existing key.
    pub fn update(&self, key: u64, value: T) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("bucket poisoned");
        Self::append(&mut inner, &Record::Set {
            key,
            value: value.clone(),
        })?;
        inner.entries.insert(key, value);
        Ok(())
    }

    /// Remove the value under a key. Unknown keys are a no-op.
    pub fn delete(&self, key: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("bucket poisoned");
        if inner.entries.remove(&key).is_some() {
            Self::append(&mut inner, &Record::Delete { key })?;
        }
        Ok(())
    }

    /// Snapshot of every entry.
    pub fn all(&self) -> Vec<(u64, T)> {
        let inner = self.inner.lock().expect("bucket poisoned");
        inner.entries.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Truncate the bucket: drops the log and the in-memory entries.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("bucket poisoned");
        inner.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        inner.entries.clear();
        inner.next_key = 1;
        Ok(())
    }

    fn sync(&self) {
        let inner = self.inner.lock().expect("bucket poisoned");
        let _ = inner.file.sync_all();
    }
}

/// The three buckets backing a node's state.
pub struct Storage {
    vhosts: Bucket<VhostRecord>,
    channels: Bucket<ChannelRecord>,
    permissions: Bucket<PermissionRecord>,
}

impl Storage {
    /// Open (or create) the buckets for `node` under `dir`.
    pub fn open(dir: &Path, node: &str) -> Result<Storage, StorageError> {
        std::fs::create_dir_all(dir)?;
        let bucket_path = |bucket: &str| dir.join(format!("{}.{}.bkt", node, bucket));
        let storage = Storage {
            vhosts: Bucket::open(bucket_path("vhosts"))?,
            channels: Bucket::open(bucket_path("channels"))?,
            permissions: Bucket::open(bucket_path("permissions"))?,
        };
        debug!(dir = %dir.display(), node = %node, "storage opened");
        Ok(storage)
    }

    pub fn vhosts(&self) -> &Bucket<VhostRecord> {
        &self.vhosts
    }

    pub fn channels(&self) -> &Bucket<ChannelRecord> {
        &self.channels
    }

    pub fn permissions(&self) -> &Bucket<PermissionRecord> {
        &self.permissions
    }

    /// Truncate all the buckets.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.vhosts.clear()?;
        self.channels.clear()?;
        self.permissions.clear()?;
        Ok(())
    }

    /// Flush everything to disk.
    pub fn kill(&self) {
        self.vhosts.sync();
        self.channels.sync();
        self.permissions.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_storage(dir: &Path) -> Storage {
        Storage::open(dir, "testnode").unwrap()
    }

    #[test]
    fn test_bucket_set_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(dir.path());
        let key = storage
            .vhosts()
            .set(VhostRecord {
                path: "/hello".into(),
                access_token: "tok".into(),
            })
            .unwrap();
        storage.kill();

        let storage = open_storage(dir.path());
        let all = storage.vhosts().all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, key);
        assert_eq!(all[0].1.path, "/hello");
    }

    #[test]
    fn test_bucket_delete_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(dir.path());
        let keep = storage
            .channels()
            .set(ChannelRecord {
                vhost: 1,
                name: "keep".into(),
                kind: ChannelKind::Normal,
            })
            .unwrap();
        let drop_ = storage
            .channels()
            .set(ChannelRecord {
                vhost: 1,
                name: "drop".into(),
                kind: ChannelKind::Normal,
            })
            .unwrap();
        storage.channels().delete(drop_).unwrap();

        let storage = open_storage(dir.path());
        let all = storage.channels().all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, keep);
        assert_eq!(all[0].1.name, "keep");
    }

    #[test]
    fn test_bucket_update() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(dir.path());
        let key = storage
            .vhosts()
            .set(VhostRecord {
                path: "/a".into(),
                access_token: "old".into(),
            })
            .unwrap();
        storage
            .vhosts()
            .update(key, VhostRecord {
                path: "/a".into(),
                access_token: "new".into(),
            })
            .unwrap();

        let storage = open_storage(dir.path());
        assert_eq!(storage.vhosts().all()[0].1.access_token, "new");
    }

    #[test]
    fn test_keys_not_reused_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(dir.path());
        let first = storage
            .vhosts()
            .set(VhostRecord {
                path: "/a".into(),
                access_token: "t".into(),
            })
            .unwrap();

        let storage = open_storage(dir.path());
        let second = storage
            .vhosts()
            .set(VhostRecord {
                path: "/b".into(),
                access_token: "t".into(),
            })
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_clear_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(dir.path());
        storage
            .permissions()
            .set(PermissionRecord {
                vhost: 1,
                uid: "joe".into(),
                pattern: ".*".into(),
                token: "t".into(),
            })
            .unwrap();
        storage.clear().unwrap();
        assert!(storage.permissions().all().is_empty());

        let storage = open_storage(dir.path());
        assert!(storage.permissions().all().is_empty());
    }
}
