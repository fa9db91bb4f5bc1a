//! Storage layer for MartenDB.
//!
//! Three pieces, bottom up:
//!
//! - [`file`]: paged files, a header page plus a sequence of fixed-size
//!   pages addressed by page number, the unit the buffer manager caches.
//! - [`heap`]: heap relations, slotted record pages with a sequential
//!   scanner, used as the base relation an index is bulk-loaded from.
//! - [`btree`]: the disk-resident B+Tree secondary index over one
//!   fixed-offset attribute of a heap relation.

pub mod btree;
pub mod file;
pub mod heap;

pub use btree::{index_file_name, BTree, BTreeIndex, IndexKey, KeyValue, StringKey};
pub use file::PagedFile;
pub use heap::{HeapFile, HeapScan};
