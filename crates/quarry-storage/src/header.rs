//! Header page: the persistent index catalog.
//!
//! Page 0 of every database file maps index names to root page ids. The
//! B+Tree writes its record here whenever its root page changes, so an index
//! can be reopened by name after a restart.
//!
//! Layout:
//! - record_count: 4 bytes
//! - records: 36 bytes each (name: 32 bytes zero-padded, root_page_id: 4)

use std::sync::Arc;

use quarry_buffer::BufferPoolManager;
use quarry_common::{PageId, QuarryError, Result, HEADER_PAGE_ID, PAGE_SIZE};

const COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;

/// Mutable view of the header page's bytes.
pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    /// Maximum number of index records the header page can hold.
    pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

    /// Initializes an empty header page in `data`.
    pub fn init(data: &'a mut [u8]) -> Self {
        data[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        Self { data }
    }

    /// Attaches a view to an already initialized header page.
    pub fn attach(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Returns the number of records.
    pub fn record_count(&self) -> usize {
        record_count_in(self.data)
    }

    /// Adds a `name -> root_page_id` record.
    ///
    /// Returns false if a record with this name already exists.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> Result<bool> {
        validate_name(name)?;
        if find_record_in(self.data, name).is_some() {
            return Ok(false);
        }

        let count = self.record_count();
        if count >= Self::MAX_RECORDS {
            return Err(QuarryError::HeaderPageFull(name.to_string()));
        }

        let offset = RECORDS_OFFSET + count * RECORD_SIZE;
        self.data[offset..offset + NAME_SIZE].fill(0);
        self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        self.data[offset + NAME_SIZE..offset + RECORD_SIZE]
            .copy_from_slice(&root_page_id.raw().to_le_bytes());
        self.set_record_count(count + 1);
        Ok(true)
    }

    /// Updates the root page id of an existing record.
    ///
    /// Returns false if no record with this name exists.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match find_record_in(self.data, name) {
            Some(slot) => {
                let offset = RECORDS_OFFSET + slot * RECORD_SIZE + NAME_SIZE;
                self.data[offset..offset + 4].copy_from_slice(&root_page_id.raw().to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Inserts or updates a record.
    pub fn set_record(&mut self, name: &str, root_page_id: PageId) -> Result<()> {
        if !self.update_record(name, root_page_id) {
            self.insert_record(name, root_page_id)?;
        }
        Ok(())
    }

    /// Returns the root page id registered under `name`.
    pub fn get_record(&self, name: &str) -> Option<PageId> {
        lookup_root(self.data, name)
    }

    /// Removes the record registered under `name`.
    ///
    /// Returns false if no record with this name exists.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let Some(slot) = find_record_in(self.data, name) else {
            return false;
        };
        let count = self.record_count();
        let start = RECORDS_OFFSET + (slot + 1) * RECORD_SIZE;
        let end = RECORDS_OFFSET + count * RECORD_SIZE;
        self.data
            .copy_within(start..end, RECORDS_OFFSET + slot * RECORD_SIZE);
        self.set_record_count(count - 1);
        true
    }

    fn set_record_count(&mut self, count: usize) {
        self.data[COUNT_OFFSET..COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }
}

/// Bootstraps the header page on a fresh database file.
pub fn bootstrap_header(pool: &Arc<BufferPoolManager>) -> Result<()> {
    if pool.disk().num_pages() > 0 {
        return Ok(());
    }
    let (page_id, mut guard) = pool.new_page()?;
    debug_assert_eq!(page_id, HEADER_PAGE_ID);
    HeaderPage::init(&mut guard.data_mut()[..]);
    Ok(())
}

/// Reads the root page id registered under `name` from raw header bytes.
pub fn lookup_root(data: &[u8], name: &str) -> Option<PageId> {
    let slot = find_record_in(data, name)?;
    let offset = RECORDS_OFFSET + slot * RECORD_SIZE + NAME_SIZE;
    let raw = i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]);
    Some(PageId::new(raw))
}

fn record_count_in(data: &[u8]) -> usize {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
}

fn find_record_in(data: &[u8], name: &str) -> Option<usize> {
    let count = record_count_in(data);
    let mut padded = [0u8; NAME_SIZE];
    if name.len() > NAME_SIZE {
        return None;
    }
    padded[..name.len()].copy_from_slice(name.as_bytes());

    (0..count).find(|slot| {
        let offset = RECORDS_OFFSET + slot * RECORD_SIZE;
        data[offset..offset + NAME_SIZE] == padded
    })
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_SIZE {
        return Err(QuarryError::Internal(format!(
            "invalid index name: {:?}",
            name
        )));
    }
    Ok(())
}
