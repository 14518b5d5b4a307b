//! Sharded span storage.
//!
//! A data store is a fixed set of shards, each one a RocksDB instance in
//! its own directory with a single writer thread. Spans are partitioned by
//! a stable hash of their id; see [`store::DataStore`] for lifecycle and
//! lookups, [`writer`] for the write pipeline, and [`keys`] for the index
//! layout.

pub mod ingest;
pub mod keys;
pub mod shard;
pub mod store;
pub mod writer;

pub use ingest::SpanIngestor;
pub use shard::ShardStore;
pub use store::DataStore;
pub use writer::{ShardWriter, SpanWriteRequest, WriterConfig};

use crate::core::error::{HtracedError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

/// On-disk layout version understood by this build.
pub const CURRENT_LAYOUT_VERSION: u32 = 3;

/// Name of the per-shard metadata file.
pub const SHARD_INFO_FILE: &str = "SHARD_INFO";

/// Identity record stamped into every shard directory at creation time.
///
/// `daemon_id` ties the shards of one daemon together so that mixed shard
/// sets are caught at load; it renders as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    #[serde(rename = "LayoutVersion")]
    pub layout_version: u32,
    #[serde(
        rename = "DaemonId",
        serialize_with = "serialize_daemon_id",
        deserialize_with = "deserialize_daemon_id"
    )]
    pub daemon_id: u64,
    #[serde(rename = "ShardIndex")]
    pub shard_index: u32,
    #[serde(rename = "TotalShards")]
    pub total_shards: u32,
}

fn serialize_daemon_id<S>(id: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{:016x}", id))
}

fn deserialize_daemon_id<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u64::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
}

impl ShardInfo {
    /// Reads the `SHARD_INFO` file from a shard directory.
    pub fn read_from(dir: &Path) -> Result<ShardInfo> {
        let path = dir.join(SHARD_INFO_FILE);
        let body = std::fs::read(&path).map_err(|e| {
            HtracedError::load_mismatch(format!(
                "Shard directory {} has no readable {}: {}",
                dir.display(),
                SHARD_INFO_FILE,
                e
            ))
        })?;
        serde_json::from_slice(&body).map_err(|e| {
            HtracedError::load_mismatch(format!(
                "Shard directory {} has a corrupt {}: {}",
                dir.display(),
                SHARD_INFO_FILE,
                e
            ))
        })
    }

    /// Writes the `SHARD_INFO` file into a shard directory.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(SHARD_INFO_FILE);
        let body = serde_json::to_vec(self)?;
        std::fs::write(&path, body)?;
        Ok(())
    }
}
