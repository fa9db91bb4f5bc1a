//! Disk-resident B+Tree secondary index.
//!
//! Maps values of one fixed-offset attribute of a heap relation to the
//! record ids holding them, so equality and range predicates on that
//! attribute skip the full relation scan. The engine ([`BTree`]) is
//! monomorphized per key type; [`BTreeIndex`] picks the engine from the
//! attribute type at open time and is the surface callers use.
//!
//! ```no_run
//! use marten_buffer::{BufferConfig, BufferManager};
//! use marten_common::config::StorageConfig;
//! use marten_common::types::{AttrType, ScanOp};
//! use marten_storage::btree::{BTreeIndex, KeyValue};
//! use marten_storage::heap::HeapFile;
//! use std::sync::Arc;
//!
//! # fn main() -> marten_common::Result<()> {
//! let config = StorageConfig::default();
//! let buf = Arc::new(BufferManager::new(BufferConfig::default()));
//! let heap = HeapFile::open("employees", &config, buf.clone())?;
//!
//! // Index the i32 attribute at byte offset 0, bulk-loading on creation.
//! let mut index = BTreeIndex::open_or_create(&heap, buf, &config, 0, AttrType::Integer)?;
//!
//! index.start_scan(
//!     &KeyValue::Int(25),
//!     ScanOp::Gte,
//!     &KeyValue::Int(40),
//!     ScanOp::Lt,
//! )?;
//! while let Ok(rid) = index.scan_next() {
//!     println!("match: {}", rid);
//! }
//! index.end_scan()?;
//! # Ok(())
//! # }
//! ```

pub mod index;
pub mod key;
pub mod meta;
pub mod node;

pub use index::{BTree, TreeStats};
pub use key::{IndexKey, StringKey};

use crate::heap::HeapFile;
use marten_buffer::BufferManager;
use marten_common::config::StorageConfig;
use marten_common::types::{AttrType, RecordId, ScanOp};
use marten_common::{MartenError, Result};
use std::sync::Arc;

/// Name of the index file for `relation`'s attribute at `attr_byte_offset`.
///
/// Deterministic from the construction arguments, so reopening with the
/// same arguments finds the same file.
pub fn index_file_name(relation: &str, attr_byte_offset: u32) -> String {
    format!("{}.{}", relation, attr_byte_offset)
}

/// A key value crossing the index API boundary.
///
/// The variant must match the index's attribute type; a disagreement is a
/// [`MartenError::TypeMismatch`]. String values are truncated/NUL-padded
/// to the fixed 10-byte key width.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Int(i32),
    Double(f64),
    Str(String),
}

impl KeyValue {
    /// The attribute type this value belongs to.
    pub fn attr_type(&self) -> AttrType {
        match self {
            KeyValue::Int(_) => AttrType::Integer,
            KeyValue::Double(_) => AttrType::Double,
            KeyValue::Str(_) => AttrType::String,
        }
    }
}

/// A B+Tree secondary index over one attribute of a heap relation,
/// dispatching to the engine monomorphized for the attribute's type.
pub enum BTreeIndex {
    Int(BTree<i32>),
    Double(BTree<f64>),
    Str(BTree<StringKey>),
}

impl BTreeIndex {
    /// Opens the index for `heap`'s attribute at `attr_byte_offset`,
    /// creating and bulk-loading it if it does not exist yet.
    pub fn open_or_create(
        heap: &HeapFile,
        buf: Arc<BufferManager>,
        config: &StorageConfig,
        attr_byte_offset: u32,
        attr_type: AttrType,
    ) -> Result<Self> {
        match attr_type {
            AttrType::Integer => Ok(Self::Int(BTree::open_or_create(
                heap,
                buf,
                config,
                attr_byte_offset,
                attr_type,
            )?)),
            AttrType::Double => Ok(Self::Double(BTree::open_or_create(
                heap,
                buf,
                config,
                attr_byte_offset,
                attr_type,
            )?)),
            AttrType::String => Ok(Self::Str(BTree::open_or_create(
                heap,
                buf,
                config,
                attr_byte_offset,
                attr_type,
            )?)),
        }
    }

    /// The type of the indexed attribute.
    pub fn attr_type(&self) -> AttrType {
        match self {
            Self::Int(_) => AttrType::Integer,
            Self::Double(_) => AttrType::Double,
            Self::Str(_) => AttrType::String,
        }
    }

    fn mismatch(&self, value: &KeyValue) -> MartenError {
        MartenError::TypeMismatch {
            expected: self.attr_type().to_string(),
            actual: value.attr_type().to_string(),
        }
    }

    /// Inserts a `(key, rid)` entry.
    pub fn insert(&mut self, key: &KeyValue, rid: RecordId) -> Result<()> {
        match (self, key) {
            (Self::Int(tree), KeyValue::Int(v)) => tree.insert(*v, rid),
            (Self::Double(tree), KeyValue::Double(v)) => tree.insert(*v, rid),
            (Self::Str(tree), KeyValue::Str(s)) => tree.insert(StringKey::new(s), rid),
            (index, value) => Err(index.mismatch(value)),
        }
    }

    /// Opens a range scan over `[low_op low, high_op high]`.
    pub fn start_scan(
        &mut self,
        low: &KeyValue,
        low_op: ScanOp,
        high: &KeyValue,
        high_op: ScanOp,
    ) -> Result<()> {
        match (self, low, high) {
            (Self::Int(tree), KeyValue::Int(lo), KeyValue::Int(hi)) => {
                tree.start_scan(*lo, low_op, *hi, high_op)
            }
            (Self::Double(tree), KeyValue::Double(lo), KeyValue::Double(hi)) => {
                tree.start_scan(*lo, low_op, *hi, high_op)
            }
            (Self::Str(tree), KeyValue::Str(lo), KeyValue::Str(hi)) => {
                tree.start_scan(StringKey::new(lo), low_op, StringKey::new(hi), high_op)
            }
            (index, low, high) => {
                if low.attr_type() != index.attr_type() {
                    Err(index.mismatch(low))
                } else {
                    Err(index.mismatch(high))
                }
            }
        }
    }

    /// Returns the rid of the next entry in the scan range.
    pub fn scan_next(&mut self) -> Result<RecordId> {
        match self {
            Self::Int(tree) => tree.scan_next(),
            Self::Double(tree) => tree.scan_next(),
            Self::Str(tree) => tree.scan_next(),
        }
    }

    /// Closes the current scan.
    pub fn end_scan(&mut self) -> Result<()> {
        match self {
            Self::Int(tree) => tree.end_scan(),
            Self::Double(tree) => tree.end_scan(),
            Self::Str(tree) => tree.end_scan(),
        }
    }

    /// Height of the tree in pages.
    pub fn height(&self) -> Result<u32> {
        match self {
            Self::Int(tree) => tree.height(),
            Self::Double(tree) => tree.height(),
            Self::Str(tree) => tree.height(),
        }
    }

    /// Checks the structural invariants of the whole tree.
    pub fn validate(&self) -> Result<TreeStats> {
        match self {
            Self::Int(tree) => tree.validate(),
            Self::Double(tree) => tree.validate(),
            Self::Str(tree) => tree.validate(),
        }
    }
}
