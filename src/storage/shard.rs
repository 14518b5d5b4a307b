//! Thin adapter over one RocksDB instance, the embedded ordered KV store
//! backing a single shard.
//!
//! Batched writes are atomic at the shard level; there is no cross-shard
//! atomicity. RocksDB's own `LOCK` file gives each directory an exclusive
//! owner, so opening a directory twice fails with a lock conflict.

use crate::core::error::{HtracedError, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};

/// One embedded key/value store instance.
pub struct ShardStore {
    db: DB,
    path: PathBuf,
}

fn db_options(create: bool) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(create);
    opts
}

fn map_open_error(path: &Path, err: rocksdb::Error) -> HtracedError {
    let message = err.to_string();
    // RocksDB reports lock contention through its LOCK file.
    if message.contains("LOCK") || message.contains("lock") {
        HtracedError::LockConflict(format!(
            "Shard directory {} is already held by process: {}",
            path.display(),
            message
        ))
    } else {
        HtracedError::storage(format!(
            "Failed to open shard directory {}: {}",
            path.display(),
            message
        ))
    }
}

impl ShardStore {
    /// Creates a fresh store, making the directory if needed.
    pub fn create(path: &Path) -> Result<Self> {
        let db = DB::open(&db_options(true), path).map_err(|e| map_open_error(path, e))?;
        Ok(ShardStore {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing store; the directory must already hold one.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let db = DB::open(&db_options(false), path).map_err(|e| map_open_error(path, e))?;
        Ok(ShardStore {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| HtracedError::storage(format!("Read failed: {}", e)))
    }

    /// Commits all entries as one atomic batch.
    pub fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put(key, value);
        }
        self.db
            .write(batch)
            .map_err(|e| HtracedError::storage(format!("Batch write failed: {}", e)))
    }

    /// Ordered scan starting at `start`. A reverse scan begins at the
    /// largest key not greater than `start` and walks down.
    pub fn scan_from<'a>(
        &'a self,
        start: &[u8],
        reverse: bool,
    ) -> impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + 'a {
        let direction = if reverse {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        self.db
            .iterator(IteratorMode::From(start, direction))
            .map(|item| item.map_err(|e| HtracedError::storage(format!("Scan failed: {}", e))))
    }

    /// Forces buffered writes down to disk. The store itself closes when
    /// the last handle drops.
    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| HtracedError::storage(format!("Flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(pairs: &[(&[u8], &[u8])]) -> Vec<(Vec<u8>, Vec<u8>)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect()
    }

    #[test]
    fn test_put_batch_and_get() {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::create(dir.path()).unwrap();
        store
            .put_batch(&entries(&[(b"Ba", b""), (b"Pa", b"span-a")]))
            .unwrap();
        assert_eq!(store.get(b"Pa").unwrap().unwrap(), b"span-a");
        assert!(store.get(b"Pb").unwrap().is_none());
    }

    #[test]
    fn test_scan_forward_and_reverse() {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::create(dir.path()).unwrap();
        store
            .put_batch(&entries(&[(b"k1", b"1"), (b"k2", b"2"), (b"k3", b"3")]))
            .unwrap();

        let forward: Vec<_> = store
            .scan_from(b"k2", false)
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(forward, vec![b"k2".to_vec().into(), b"k3".to_vec().into()]);

        let reverse: Vec<_> = store
            .scan_from(b"k2", true)
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(reverse, vec![b"k2".to_vec().into(), b"k1".to_vec().into()]);
    }

    #[test]
    fn test_reverse_scan_seeks_below_missing_start() {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::create(dir.path()).unwrap();
        store
            .put_batch(&entries(&[(b"k1", b"1"), (b"k3", b"3")]))
            .unwrap();
        let reverse: Vec<_> = store
            .scan_from(b"k2", true)
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(reverse, vec![b"k1".to_vec().into()]);
    }

    #[test]
    fn test_double_open_is_lock_conflict() {
        let dir = TempDir::new().unwrap();
        let _store = ShardStore::create(dir.path()).unwrap();
        let err = ShardStore::open_existing(dir.path()).unwrap_err();
        assert_eq!(err.category(), "lock_conflict");
        assert!(err.to_string().contains("already held by process"));
    }
}
