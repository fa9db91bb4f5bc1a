//! Page identifiers for MartenDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (8 KiB). Fixed: all on-disk node layouts and fanout
/// constants are derived from it.
pub const PAGE_SIZE: usize = 8 * 1024;

/// Page number within a single paged file.
pub type PageNo = u32;

/// Page number 0 is the file header and is never handed to clients, so it
/// doubles as the "no such page" sentinel. Zeroed node memory therefore
/// reads back as empty slots.
pub const INVALID_PAGE_NO: PageNo = 0;

/// Unique identifier for a page across all open files.
///
/// The buffer manager keys its page table with this; `file_id` is assigned
/// per open file, `page_no` is the page's position within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Identifier of the open file owning the page.
    pub file_id: u32,
    /// Page number within the file (0 = file header).
    pub page_no: PageNo,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(file_id: u32, page_no: PageNo) -> Self {
        Self { file_id, page_no }
    }

    /// Packs the PageId into a single u64.
    pub fn as_u64(&self) -> u64 {
        ((self.file_id as u64) << 32) | (self.page_no as u64)
    }

    /// Unpacks a PageId from its u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            file_id: (value >> 32) as u32,
            page_no: value as u32,
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 8192);
    }

    #[test]
    fn test_invalid_page_no_is_zero() {
        assert_eq!(INVALID_PAGE_NO, 0);
    }

    #[test]
    fn test_page_id_new() {
        let page_id = PageId::new(1, 100);
        assert_eq!(page_id.file_id, 1);
        assert_eq!(page_id.page_no, 100);
    }

    #[test]
    fn test_page_id_roundtrip() {
        let page_id = PageId::new(42, 1000);
        assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));
    }

    #[test]
    fn test_page_id_roundtrip_edge_cases() {
        for page_id in [
            PageId::new(0, 0),
            PageId::new(u32::MAX, u32::MAX),
            PageId::new(0, u32::MAX),
            PageId::new(u32::MAX, 0),
        ] {
            assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));
        }
    }

    #[test]
    fn test_page_id_as_u64_bit_layout() {
        let page_id = PageId::new(1, 2);
        assert_eq!(page_id.as_u64(), (1u64 << 32) | 2);
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(5, 123).to_string(), "5:123");
        assert_eq!(PageId::new(0, 0).to_string(), "0:0");
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId::new(1, 1));
        set.insert(PageId::new(1, 2));
        set.insert(PageId::new(1, 1));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::new(10, 500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
