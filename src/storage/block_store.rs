//! In-memory block store
//!
//! Blocks live in a concurrent map keyed by [`BlockKey`]. Operations on
//! different keys never contend, so the data-path loop can serve requests
//! without any coordination beyond the map's own sharding.

use crate::protocol::data::segment_fits;
use crate::storage::{BlockKey, Storage, StorageStats};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Node-local block store; lives until process exit or a failure signal
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: DashMap<BlockKey, Vec<u8>>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of blocks held
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Get total bytes held
    pub fn bytes_stored(&self) -> usize {
        self.blocks.iter().map(|entry| entry.value().len()).sum()
    }

    /// Keys currently held, sorted (for inspection and tests)
    pub fn keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<BlockKey> = self.blocks.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl Storage for MemoryBlockStore {
    fn store(&self, key: BlockKey, data: Vec<u8>) {
        self.blocks.insert(key, data);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn store_segment(&self, key: BlockKey, total: usize, offset: usize, data: &[u8]) -> bool {
        if !segment_fits(offset, data.len(), total) {
            return false;
        }
        let end = offset + data.len();
        let mut block = self.blocks.entry(key).or_default();
        if block.len() != total {
            block.resize(total, 0);
        }
        block[offset..end].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn fetch(&self, key: &BlockKey) -> Option<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.blocks.get(key).map(|block| block.value().clone())
    }

    fn fetch_segment(&self, key: &BlockKey, offset: usize, max: usize) -> (usize, Vec<u8>) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.blocks.get(key) {
            Some(block) => {
                let total = block.len();
                let start = offset.min(total);
                let end = start.saturating_add(max).min(total);
                (total, block[start..end].to_vec())
            }
            None => (0, Vec::new()),
        }
    }

    fn clear_all(&self) -> usize {
        let count = self.blocks.len();
        self.blocks.clear();
        count
    }

    fn stats(&self) -> StorageStats {
        StorageStats {
            blocks: self.block_count(),
            bytes: self.bytes_stored(),
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(stripe: u64, member: usize, parity: bool) -> BlockKey {
        BlockKey::new("G", "f", stripe, member, parity)
    }

    #[test]
    fn test_store_overwrites() {
        let store = MemoryBlockStore::new();
        store.store(key(0, 1, false), vec![1, 2, 3]);
        store.store(key(0, 1, false), vec![9]);
        assert_eq!(store.fetch(&key(0, 1, false)), Some(vec![9]));
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn test_absent_block_is_empty_not_error() {
        let store = MemoryBlockStore::new();
        assert_eq!(store.fetch(&key(3, 0, true)), None);
        assert_eq!(store.fetch_segment(&key(3, 0, true), 0, 1024), (0, vec![]));
    }

    #[test]
    fn test_parity_flag_is_part_of_the_key() {
        let store = MemoryBlockStore::new();
        store.store(key(0, 0, true), vec![7]);
        assert_eq!(store.fetch(&key(0, 0, false)), None);
    }

    #[test]
    fn test_segments_assemble_in_any_order() {
        let store = MemoryBlockStore::new();
        let k = key(0, 2, false);
        store.store_segment(k.clone(), 6, 4, &[5, 6]);
        store.store_segment(k.clone(), 6, 0, &[1, 2, 3, 4]);
        // a retried segment is harmless
        store.store_segment(k.clone(), 6, 4, &[5, 6]);
        assert_eq!(store.fetch(&k), Some(vec![1, 2, 3, 4, 5, 6]));

        assert_eq!(store.fetch_segment(&k, 4, 10), (6, vec![5, 6]));
        assert_eq!(store.fetch_segment(&k, 2, 2), (6, vec![3, 4]));
    }

    #[test]
    fn test_segment_resizes_stale_block() {
        let store = MemoryBlockStore::new();
        let k = key(1, 0, false);
        store.store(k.clone(), vec![0xff; 10]);
        store.store_segment(k.clone(), 3, 0, &[1, 2, 3]);
        assert_eq!(store.fetch(&k), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_segment_outside_block_is_ignored() {
        let store = MemoryBlockStore::new();
        let k = key(0, 1, false);
        store.store_segment(k.clone(), 4, 0, &[1, 2, 3, 4]);

        assert!(!store.store_segment(k.clone(), 2, usize::MAX, &[9]));
        assert!(!store.store_segment(k.clone(), 2, 1, &[9, 9]));
        assert_eq!(store.fetch(&k), Some(vec![1, 2, 3, 4]));
        assert_eq!(store.fetch_segment(&k, 1, usize::MAX), (4, vec![2, 3, 4]));
    }

    #[test]
    fn test_empty_block_is_present() {
        let store = MemoryBlockStore::new();
        let k = key(0, 3, false);
        store.store_segment(k.clone(), 0, 0, &[]);
        assert_eq!(store.fetch(&k), Some(vec![]));
    }

    #[test]
    fn test_clear_all_models_data_loss() {
        let store = MemoryBlockStore::new();
        store.store(key(0, 0, false), vec![1; 4]);
        store.store(key(1, 0, true), vec![2; 4]);
        assert_eq!(store.stats().bytes, 8);

        assert_eq!(store.clear_all(), 2);
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.fetch(&key(0, 0, false)), None);
    }
}
