//! Configuration structures for Quarry.

use crate::page::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the database file.
    pub db_path: PathBuf,
    /// Page size in bytes.
    pub page_size: usize,
    /// Buffer pool size in number of frames.
    pub buffer_pool_frames: usize,
    /// Capacity of an extendible hash bucket.
    pub hash_bucket_capacity: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./quarry.db"),
            page_size: PAGE_SIZE,
            buffer_pool_frames: 1024,
            hash_bucket_capacity: 50,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn buffer_pool_size_bytes(&self) -> usize {
        self.buffer_pool_frames * self.page_size
    }
}
