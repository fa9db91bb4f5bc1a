//! Scalar attribute types, record identifiers and scan operators.

use crate::page::{PageNo, INVALID_PAGE_NO};
use serde::{Deserialize, Serialize};

/// Type of the attribute a secondary index is built over.
///
/// Stored as a 32-bit little-endian integer in the index header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AttrType {
    /// Signed 32-bit integer.
    Integer = 0,
    /// IEEE-754 64-bit floating point.
    Double = 1,
    /// Fixed-width 10-byte string, compared as raw bytes.
    String = 2,
}

impl AttrType {
    /// Decodes an AttrType from its on-disk representation.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(AttrType::Integer),
            1 => Some(AttrType::Double),
            2 => Some(AttrType::String),
            _ => None,
        }
    }

    /// Width in bytes of a key of this type inside a record.
    pub fn key_width(&self) -> usize {
        match self {
            AttrType::Integer => 4,
            AttrType::Double => 8,
            AttrType::String => 10,
        }
    }
}

impl std::fmt::Display for AttrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AttrType::Integer => "INTEGER",
            AttrType::Double => "DOUBLE",
            AttrType::String => "STRING",
        };
        write!(f, "{}", name)
    }
}

/// Comparison operators accepted by index range scans.
///
/// The low bound takes `Gt` or `Gte`; the high bound takes `Lt` or `Lte`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOp {
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than or equal.
    Gte,
    /// Strictly greater than.
    Gt,
}

impl ScanOp {
    /// Returns true if this operator is valid as a scan low bound.
    pub fn is_low_op(&self) -> bool {
        matches!(self, ScanOp::Gt | ScanOp::Gte)
    }

    /// Returns true if this operator is valid as a scan high bound.
    pub fn is_high_op(&self) -> bool {
        matches!(self, ScanOp::Lt | ScanOp::Lte)
    }
}

/// Identifier of a record in a heap relation: the page holding it and the
/// slot within that page.
///
/// On disk a RecordId occupies [`RecordId::DISK_SIZE`] bytes:
/// `page_no:4, slot_no:2, pad:2`, little-endian. A RecordId whose
/// `page_no` is [`INVALID_PAGE_NO`] marks an empty index entry;
/// `slot_no == 0` is likewise reserved.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RecordId {
    /// Heap page holding the record.
    pub page_no: PageNo,
    /// Slot within the page, numbered from 1.
    pub slot_no: u16,
}

impl RecordId {
    /// On-disk size in bytes, including trailing padding.
    pub const DISK_SIZE: usize = 8;

    /// Creates a new RecordId.
    pub fn new(page_no: PageNo, slot_no: u16) -> Self {
        Self { page_no, slot_no }
    }

    /// Returns true if this RecordId marks an empty slot.
    pub fn is_empty(&self) -> bool {
        self.page_no == INVALID_PAGE_NO
    }

    /// Serializes into `buf[0..8]`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_no.to_le_bytes());
        buf[4..6].copy_from_slice(&self.slot_no.to_le_bytes());
        buf[6..8].fill(0);
    }

    /// Deserializes from `buf[0..8]`.
    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            page_no: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            slot_no: u16::from_le_bytes([buf[4], buf[5]]),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.page_no, self.slot_no)
    }
}
