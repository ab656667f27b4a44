//! Embedded key-value persistence.
//!
//! Both halves of the system keep small per-process databases: the client
//! records which files a watcher has announced, the server records transfer
//! progress per content hash. Keys are hashed before hitting the store so
//! arbitrary paths and hex digests become fixed-width keys.
//!
//! The store is constructed explicitly and handed to whoever needs it; there
//! is intentionally no process-wide singleton.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::debug;

use crate::crypto::sha256_hex;
use crate::error::Result;
use crate::STORE_FLUSH_THRESHOLD;

/// File-backed key-value store with hashed keys.
///
/// Every operation pings a maintenance task; after
/// [`STORE_FLUSH_THRESHOLD`] operations the backing tree is flushed to disk.
#[derive(Debug)]
pub struct KvStore {
    db: sled::Db,
    path: PathBuf,
    calls: mpsc::UnboundedSender<()>,
}

impl KvStore {
    /// Open (or create) a store at `dir/name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database cannot be opened.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let db = sled::open(&path)?;
        let calls = Self::spawn_maintenance(db.clone());
        debug!(path = %path.display(), "opened kv store");
        Ok(Self { db, path, calls })
    }

    /// Open a store named `name` in the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing database cannot be opened.
    pub fn open_in_temp(name: &str) -> Result<Self> {
        Self::open(&std::env::temp_dir(), name)
    }

    fn spawn_maintenance(db: sled::Db) -> mpsc::UnboundedSender<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            let mut counter: usize = 0;
            while rx.recv().await.is_some() {
                counter += 1;
                if counter == STORE_FLUSH_THRESHOLD {
                    counter = 0;
                    if let Err(e) = db.flush_async().await {
                        debug!(error = %e, "store maintenance flush failed");
                    }
                }
            }
        });
        tx
    }

    fn called(&self) {
        let _ = self.calls.send(());
    }

    fn hash_key(key: &str) -> String {
        sha256_hex(key.as_bytes())
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.called();
        self.db
            .insert(Self::hash_key(key).as_bytes(), value.as_bytes())?;
        Ok(())
    }

    /// Fetch the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the stored bytes are not UTF-8.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.called();
        match self.db.get(Self::hash_key(key).as_bytes())? {
            Some(bytes) => {
                let value = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    crate::error::Error::Serialization(format!("stored value not UTF-8: {e}"))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Remove `key` from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.called();
        self.db.remove(Self::hash_key(key).as_bytes())?;
        Ok(())
    }

    /// Returns true if `key` is present.
    pub fn has(&self, key: &str) -> bool {
        self.called();
        self.db
            .contains_key(Self::hash_key(key).as_bytes())
            .unwrap_or(false)
    }

    /// Flush and close the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Path of the backing database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_delete_has() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), "test.db").unwrap();

        assert!(!store.has("a"));
        store.put("a", "first").unwrap();
        assert!(store.has("a"));
        assert_eq!(store.get("a").unwrap().as_deref(), Some("first"));

        store.put("a", "second").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("second"));

        store.delete("a").unwrap();
        assert!(!store.has("a"));
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[tokio::test]
    async fn keys_are_hashed() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path(), "test.db").unwrap();

        let key = "/watch/dir/some file (1).mkv";
        store.put(key, "value").unwrap();

        // The raw key must not appear in the tree; only its digest does.
        let raw = store.db.get(key.as_bytes()).unwrap();
        assert!(raw.is_none());
        let hashed = store.db.get(KvStore::hash_key(key).as_bytes()).unwrap();
        assert!(hashed.is_some());
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(dir.path(), "persist.db").unwrap();
            store.put("hash-abc", "record").unwrap();
            store.close().unwrap();
        }
        let store = KvStore::open(dir.path(), "persist.db").unwrap();
        assert_eq!(store.get("hash-abc").unwrap().as_deref(), Some("record"));
    }
}
