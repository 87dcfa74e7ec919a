//! Module `kv` expose the index through the flat key-value surface that
//! benchmarking harnesses drive: fixed-width 64-bit integer keys, a
//! shared context plus per-thread handles.
//!
//! Integer keys are canonicalised big-endian before they reach the
//! index, so numeric order and slice order coincide and [Kv::scan]
//! yields numerically ascending keys.

use std::convert::TryInto;
use std::sync::Arc;

use crate::mast::Index;
use crate::Result;

/// Shared engine context. Clones taken via [Kv::thread_context] are
/// handles onto the same index; the index itself is safe for any number
/// of concurrent readers and writers.
#[derive(Clone)]
pub struct Kv {
    index: Arc<Index>,
}

impl Kv {
    /// Identify this engine.
    pub fn engine() -> &'static str {
        "mast"
    }

    pub fn create_context() -> Kv {
        Kv {
            index: Arc::new(Index::new()),
        }
    }

    /// Per-thread handle; the engine keeps no thread-local state.
    pub fn thread_context(&self) -> Kv {
        self.clone()
    }

    pub fn put(&self, key: u64, value: u64) -> Result<Option<u64>> {
        self.index.put(&key.to_be_bytes(), value)
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        self.index.get(&key.to_be_bytes())
    }

    pub fn del(&self, key: u64) -> Option<u64> {
        self.index.del(&key.to_be_bytes())
    }

    /// Range scan: up to `range` entries starting from `key` inclusive,
    /// in ascending key order.
    pub fn scan(&self, key: u64, range: usize) -> Vec<(u64, u64)> {
        self.index
            .iter_from(&key.to_be_bytes())
            .take(range)
            .filter_map(|(key, value)| {
                let key: [u8; 8] = key.as_slice().try_into().ok()?;
                Some((u64::from_be_bytes(key), value))
            })
            .collect()
    }

    /// Access the underlying index, for operations outside the flat
    /// surface, gc above all.
    pub fn index(&self) -> &Index {
        &self.index
    }
}

#[cfg(test)]
#[path = "kv_test.rs"]
mod kv_test;
