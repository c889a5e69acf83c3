//! Buffer pool management for Quarry.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable frame count
//! - Extendible-hash page table for page id to frame lookup
//! - LRU eviction policy over unpinned frames
//! - Pin counting and dirty page tracking for write-back

mod frame;
mod hash_table;
mod pool;
mod replacer;

pub use frame::{Frame, FrameId};
pub use hash_table::{ExtendibleHashTable, HashKey, DEFAULT_BUCKET_CAPACITY};
pub use pool::{BufferPoolManager, BufferPoolStats, PageGuard};
pub use replacer::{LruReplacer, Replacer};
