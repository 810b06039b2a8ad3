use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::Db;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

use crate::config::SimConfig;
use crate::core::consensus::VersionRecord;
use crate::core::types::NodeId;
use crate::node::NodeSnapshot;

/// Key prefixes for different data types in sled
const PREFIX_NODE: &[u8] = b"node:";
const META_REGISTRY: &[u8] = b"meta:registry";
const META_NETWORK: &[u8] = b"meta:network";

/// Bumped whenever a stored layout changes
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
    #[error("store is missing {0}")]
    Missing(&'static str),
}

/// One live link between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub a: NodeId,
    pub b: NodeId,
    pub latency_ms: u64,
    pub connected_at: u64,
}

/// Simulation-wide state that is not owned by any node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMeta {
    pub version: u32,
    pub now: u64,
    pub config: SimConfig,
    pub links: Vec<LinkRecord>,
}

/// Persistent snapshot store using the sled embedded database.
/// Values are gzip-compressed bincode.
pub struct Storage {
    db: Db,
}

impl Storage {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Storage { db: sled::open(path)? })
    }

    /// Check if the database holds a saved network
    pub fn has_network(&self) -> bool {
        self.db.contains_key(META_NETWORK).unwrap_or(false)
    }

    // ─── Nodes ───────────────────────────────────────────────────────

    pub fn put_node(&self, snapshot: &NodeSnapshot) -> Result<(), StorageError> {
        self.db.insert(node_key(snapshot.id), pack(snapshot)?)?;
        Ok(())
    }

    pub fn get_node(&self, id: NodeId) -> Result<Option<NodeSnapshot>, StorageError> {
        match self.db.get(node_key(id))? {
            Some(bytes) => Ok(Some(unpack(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every stored node, in id order
    pub fn load_nodes(&self) -> Result<Vec<NodeSnapshot>, StorageError> {
        let mut nodes = Vec::new();
        for item in self.db.scan_prefix(PREFIX_NODE) {
            let (_, value) = item?;
            nodes.push(unpack(&value)?);
        }
        Ok(nodes)
    }

    // ─── Metadata ────────────────────────────────────────────────────

    pub fn put_registry(&self, records: &[VersionRecord]) -> Result<(), StorageError> {
        self.db.insert(META_REGISTRY, pack(&records)?)?;
        Ok(())
    }

    pub fn get_registry(&self) -> Result<Vec<VersionRecord>, StorageError> {
        let bytes = self.db.get(META_REGISTRY)?.ok_or(StorageError::Missing("consensus registry"))?;
        unpack(&bytes)
    }

    pub fn put_network(&self, meta: &NetworkMeta) -> Result<(), StorageError> {
        self.db.insert(META_NETWORK, pack(meta)?)?;
        Ok(())
    }

    pub fn get_network(&self) -> Result<NetworkMeta, StorageError> {
        let bytes = self.db.get(META_NETWORK)?.ok_or(StorageError::Missing("network metadata"))?;
        let meta: NetworkMeta = unpack(&bytes)?;
        if meta.version != SNAPSHOT_VERSION {
            return Err(StorageError::Version(meta.version));
        }
        Ok(meta)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// Drop everything, ready for a fresh save
    pub fn clear_all(&self) -> Result<(), StorageError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn node_key(id: NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(PREFIX_NODE.len() + 4);
    key.extend_from_slice(PREFIX_NODE);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn pack<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    let raw = bincode::serialize(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(bincode::deserialize(&raw)?)
}
