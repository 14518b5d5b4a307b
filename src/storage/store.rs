//! Data store lifecycle: shard creation, discovery, verification, and
//! point lookups.
//!
//! The shard set is fixed at creation time. Every shard directory carries a
//! `SHARD_INFO` record; at load all records must agree on the daemon id,
//! the shard count, and a supported layout version, whatever order the
//! configuration lists the directories in.

use crate::codec;
use crate::core::config::Config;
use crate::core::error::{HtracedError, Result};
use crate::core::span::{Span, SpanId};
use crate::metrics::SinkHandle;
use crate::storage::ingest::SpanIngestor;
use crate::storage::keys;
use crate::storage::shard::ShardStore;
use crate::storage::writer::{ShardWriter, WriterConfig};
use crate::storage::{ShardInfo, CURRENT_LAYOUT_VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xxhash_rust::xxh64::xxh64;

/// One shard: its directory, its shared read handle, and its writer.
struct Shard {
    path: PathBuf,
    reader: Arc<ShardStore>,
    writer: ShardWriter,
}

/// The sharded span store.
pub struct DataStore {
    shards: Vec<Shard>,
    daemon_id: u64,
    sink: SinkHandle,
}

/// True when the directory is missing or holds no entries at all.
fn dir_is_empty(path: &Path) -> Result<bool> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

impl DataStore {
    /// Opens the store described by the configuration, creating shards on
    /// first startup (or after `data.store.clear=true`).
    pub fn open(config: &Config, sink: SinkHandle) -> Result<Arc<DataStore>> {
        let dirs: Vec<PathBuf> = config
            .data_store_directories()
            .into_iter()
            .map(PathBuf::from)
            .collect();
        if dirs.is_empty() {
            return Err(HtracedError::load_mismatch("No shard directories found."));
        }

        // A directory listed twice can never hold its exclusive lock
        // twice; fail with the lock error before touching any shard.
        let mut seen = std::collections::HashSet::new();
        for dir in &dirs {
            let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
            if !seen.insert(canonical) {
                return Err(HtracedError::LockConflict(format!(
                    "Shard directory {} is already held by process: it is \
                     listed more than once",
                    dir.display()
                )));
            }
        }

        if config.data_store_clear()? {
            for dir in &dirs {
                match std::fs::remove_dir_all(dir) {
                    Ok(()) => tracing::info!(dir = %dir.display(), "Cleared shard directory"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let writer_config = WriterConfig::from_config(config)?;
        let empty_count = dirs
            .iter()
            .map(|dir| dir_is_empty(dir))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|empty| *empty)
            .count();

        let store = if empty_count == dirs.len() {
            Self::create_shards(&dirs, writer_config, sink)?
        } else if empty_count == 0 {
            Self::load_shards(&dirs, writer_config, sink)?
        } else {
            return Err(HtracedError::load_mismatch(format!(
                "{} of {} shard directories are empty; refusing to mix \
                 fresh and existing shards",
                empty_count,
                dirs.len()
            )));
        };
        Ok(Arc::new(store))
    }

    fn create_shards(
        dirs: &[PathBuf],
        writer_config: WriterConfig,
        sink: SinkHandle,
    ) -> Result<DataStore> {
        let daemon_id: u64 = rand::random();
        tracing::info!(
            daemon_id = %format!("{:016x}", daemon_id),
            shards = dirs.len(),
            "Creating new data store"
        );

        let mut shards = Vec::with_capacity(dirs.len());
        for (index, dir) in dirs.iter().enumerate() {
            std::fs::create_dir_all(dir)?;
            let reader = Arc::new(ShardStore::create(dir)?);
            let info = ShardInfo {
                layout_version: CURRENT_LAYOUT_VERSION,
                daemon_id,
                shard_index: index as u32,
                total_shards: dirs.len() as u32,
            };
            info.write_to(dir)?;
            let writer = ShardWriter::spawn(
                index as u32,
                reader.clone(),
                writer_config.clone(),
                sink.clone(),
            );
            shards.push(Shard {
                path: dir.clone(),
                reader,
                writer,
            });
        }
        Ok(DataStore {
            shards,
            daemon_id,
            sink,
        })
    }

    fn load_shards(
        dirs: &[PathBuf],
        writer_config: WriterConfig,
        sink: SinkHandle,
    ) -> Result<DataStore> {
        let mut discovered: Vec<(ShardInfo, PathBuf)> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            discovered.push((ShardInfo::read_from(dir)?, dir.clone()));
        }

        let first = discovered[0].0;
        for (info, dir) in &discovered {
            if info.daemon_id != first.daemon_id {
                return Err(HtracedError::load_mismatch(format!(
                    "DaemonId mismatch: {} has {:016x}, but {} has {:016x}",
                    dir.display(),
                    info.daemon_id,
                    discovered[0].1.display(),
                    first.daemon_id
                )));
            }
            if info.total_shards != first.total_shards || info.total_shards != dirs.len() as u32
            {
                return Err(HtracedError::load_mismatch(format!(
                    "TotalShards mismatch: {} says {} shards, but {} \
                     directories are configured",
                    dir.display(),
                    info.total_shards,
                    dirs.len()
                )));
            }
        }
        let layout = first.layout_version;
        if discovered.iter().any(|(info, _)| info.layout_version != layout)
            || layout != CURRENT_LAYOUT_VERSION
        {
            return Err(HtracedError::load_mismatch(format!(
                "The layout version of all shards is {}, but we only support {}.",
                layout, CURRENT_LAYOUT_VERSION
            )));
        }

        // Present shards in index order regardless of configuration order.
        discovered.sort_by_key(|(info, _)| info.shard_index);
        for (position, (info, dir)) in discovered.iter().enumerate() {
            if info.shard_index != position as u32 {
                return Err(HtracedError::load_mismatch(format!(
                    "Shard index {} of {} is duplicated or out of range",
                    info.shard_index,
                    dir.display()
                )));
            }
        }

        let mut shards = Vec::with_capacity(discovered.len());
        for (info, dir) in &discovered {
            let reader = Arc::new(ShardStore::open_existing(dir)?);
            let writer = ShardWriter::spawn(
                info.shard_index,
                reader.clone(),
                writer_config.clone(),
                sink.clone(),
            );
            shards.push(Shard {
                path: dir.clone(),
                reader,
                writer,
            });
        }

        tracing::info!(
            daemon_id = %format!("{:016x}", first.daemon_id),
            shards = shards.len(),
            "Loaded existing data store"
        );
        Ok(DataStore {
            shards,
            daemon_id: first.daemon_id,
            sink,
        })
    }

    pub fn daemon_id(&self) -> u64 {
        self.daemon_id
    }

    pub fn total_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    pub(crate) fn sink(&self) -> &SinkHandle {
        &self.sink
    }

    /// Stable shard assignment: `xxh64(id bytes) mod total_shards`.
    pub fn shard_for(&self, id: &SpanId) -> usize {
        (xxh64(id.as_bytes(), 0) % self.shards.len() as u64) as usize
    }

    pub(crate) fn writer(&self, shard: usize) -> &ShardWriter {
        &self.shards[shard].writer
    }

    /// Read handle for one shard, used by the query executor.
    pub fn reader(&self, shard: usize) -> Arc<ShardStore> {
        self.shards[shard].reader.clone()
    }

    /// Current depth of every shard queue, in shard order.
    pub fn queue_depths(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.writer.queue_len()).collect()
    }

    /// Creates an ingestor for one remote peer.
    pub fn ingestor(self: &Arc<Self>, remote_addr: &str, default_tracer_id: &str) -> SpanIngestor {
        SpanIngestor::new(
            self.clone(),
            remote_addr.to_string(),
            default_tracer_id.to_string(),
        )
    }

    /// Point lookup in the owning shard. `Ok(None)` means not found.
    pub fn find_span(&self, id: &SpanId) -> Result<Option<Span>> {
        let shard = self.shard_for(id);
        match self.shards[shard].reader.get(&keys::primary_key(id))? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Children of `parent` across every shard, sorted by child id,
    /// truncated to `limit`.
    pub fn find_children(&self, parent: &SpanId, limit: usize) -> Result<Vec<SpanId>> {
        let prefix = keys::child_scan_prefix(parent);
        let mut children: Vec<SpanId> = Vec::new();
        for shard in &self.shards {
            let mut found = 0usize;
            for item in shard.reader.scan_from(&prefix, false) {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                if let Some((_, _, child)) = keys::parse_secondary_key(&key) {
                    children.push(child);
                    found += 1;
                    if found >= limit {
                        break;
                    }
                }
            }
        }
        children.sort_unstable();
        children.dedup();
        children.truncate(limit);
        Ok(children)
    }

    /// Closes every shard queue and joins the writers. Remaining queued
    /// spans are committed on the way out.
    pub fn shutdown(mut self) {
        for shard in self.shards.drain(..) {
            shard.writer.shutdown();
            if let Err(e) = shard.reader.flush() {
                tracing::warn!(
                    dir = %shard.path.display(),
                    error = %e,
                    "Flush during shutdown failed"
                );
            }
        }
    }

    /// Shuts down through an `Arc`, once transports have released theirs.
    pub fn shutdown_arc(store: Arc<DataStore>) {
        match Arc::try_unwrap(store) {
            Ok(store) => store.shutdown(),
            Err(_) => {
                tracing::warn!("Data store still shared at shutdown; skipping writer join");
            },
        }
    }
}
