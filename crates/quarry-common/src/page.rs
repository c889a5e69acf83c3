//! Page identifiers and page-level constants.

use serde::{Deserialize, Serialize};

/// Size of a data page in bytes.
pub const PAGE_SIZE: usize = 512;

/// Page id of the header page (persistent index catalog).
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Sentinel log sequence number. The `lsn` header field is written but
/// otherwise unused by this engine.
pub const INVALID_LSN: i32 = -1;

/// On-disk identity of a page.
///
/// Page ids are dense non-negative integers handed out by the disk manager;
/// `-1` denotes an invalid page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub i32);

impl PageId {
    /// Invalid page id.
    pub const INVALID: PageId = PageId(-1);

    /// Creates a page id from a raw value.
    pub fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns true if this is a valid page id.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Returns the raw id value.
    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 512);
    }

    #[test]
    fn test_header_page_id() {
        assert_eq!(HEADER_PAGE_ID, PageId(0));
        assert!(HEADER_PAGE_ID.is_valid());
    }

    #[test]
    fn test_page_id_validity() {
        assert!(PageId::new(0).is_valid());
        assert!(PageId::new(1234).is_valid());
        assert!(!PageId::INVALID.is_valid());
        assert!(!PageId::new(-7).is_valid());
    }

    #[test]
    fn test_page_id_invalid_is_minus_one() {
        assert_eq!(PageId::INVALID.raw(), -1);
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(5).to_string(), "page:5");
        assert_eq!(PageId::INVALID.to_string(), "page:-1");
    }

    #[test]
    fn test_page_id_ordering() {
        assert!(PageId::new(1) < PageId::new(2));
        assert!(PageId::INVALID < PageId::new(0));
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId::new(1));
        set.insert(PageId::new(2));
        set.insert(PageId::new(1)); // Duplicate

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::new(42);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
