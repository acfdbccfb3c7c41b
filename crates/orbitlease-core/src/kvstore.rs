//! Injected key-value store for nodes, ports, reservations, incidents,
//! audit events and usage rollups.
//!
//! The engine only talks to [`KvStore`]; the backing implementation
//! (memory, embedded database, remote object store) is chosen by the caller.
//! Records are encoded with bincode under `<prefix>/<id>` keys and are never
//! deleted: terminal states are written, not removed.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::LeaseError;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, LeaseError>;

    /// Overwrites any existing record at `key`.
    fn put(&self, key: Key, value: Value) -> Result<(), LeaseError>;

    fn contains_key(&self, key: &[u8]) -> Result<bool, LeaseError>;

    /// Every pair whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Key, Value)>, LeaseError>;

    /// Applies all of `ops` or none of them.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), LeaseError>;
}

/// One staged write; a mutation and its audit event travel in the same batch.
#[derive(Debug)]
pub enum BatchOp {
    Put { key: Key, value: Value },
}

/// Process-local store used by the server and by tests.
#[derive(Default)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Key, Value>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, LeaseError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), LeaseError> {
        self.data.write().insert(key, value);
        Ok(())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, LeaseError> {
        Ok(self.data.read().contains_key(key))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Key, Value)>, LeaseError> {
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), LeaseError> {
        // One write guard for the whole batch: readers see all or nothing.
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
            }
        }
        Ok(())
    }
}

/// Builds `<prefix><id>` as a store key.
pub(crate) fn record_key(prefix: &[u8], id: &str) -> Key {
    let mut key = prefix.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

pub(crate) fn encode<T: Serialize>(record: &T) -> Result<Value, LeaseError> {
    bincode::serialize(record).map_err(|e| LeaseError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<T, LeaseError> {
    bincode::deserialize(value).map_err(|e| LeaseError::Codec(e.to_string()))
}

/// Decodes every record stored under `prefix`.
pub(crate) fn scan_records<T: DeserializeOwned>(
    kv: &dyn KvStore,
    prefix: &[u8],
) -> Result<Vec<T>, LeaseError> {
    kv.scan_prefix(prefix)?
        .iter()
        .map(|(_, v)| decode(v))
        .collect()
}
