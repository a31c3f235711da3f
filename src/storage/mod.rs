//! Block storage on the storage nodes
//!
//! This module holds the node-local block store and the storage node process
//! that serves it over its control and data ports.

pub mod block_store;
pub mod node;

pub use block_store::MemoryBlockStore;
pub use node::DiskNode;

use std::fmt;

/// Address of one block: which group, file, stripe and member it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub group: String,
    pub file: String,
    pub stripe: u64,
    pub member: usize,
    pub parity: bool,
}

impl BlockKey {
    pub fn new(
        group: impl Into<String>,
        file: impl Into<String>,
        stripe: u64,
        member: usize,
        parity: bool,
    ) -> Self {
        Self {
            group: group.into(),
            file: file.into(),
            stripe,
            member,
            parity,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.group,
            self.file,
            self.stripe,
            self.member,
            u8::from(self.parity)
        )
    }
}

/// Trait for block storage backends
pub trait Storage {
    /// Store a whole block, replacing whatever was there
    fn store(&self, key: BlockKey, data: Vec<u8>);

    /// Write one segment of a block that is `total` bytes long
    ///
    /// A segment that does not fit inside `total` is ignored and `false`
    /// returned; the stored block is left untouched.
    fn store_segment(&self, key: BlockKey, total: usize, offset: usize, data: &[u8]) -> bool;

    /// Fetch a whole block; absence is not an error
    fn fetch(&self, key: &BlockKey) -> Option<Vec<u8>>;

    /// Fetch up to `max` bytes from `offset`, with the block's total length
    ///
    /// An absent block reads as `(0, [])`.
    fn fetch_segment(&self, key: &BlockKey, offset: usize, max: usize) -> (usize, Vec<u8>);

    /// Erase every block, returning how many were held
    fn clear_all(&self) -> usize;

    /// Get storage statistics
    fn stats(&self) -> StorageStats;
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of blocks held
    pub blocks: usize,
    /// Total bytes held
    pub bytes: usize,
    /// Number of store operations served
    pub writes: u64,
    /// Number of fetch operations served
    pub reads: u64,
}
