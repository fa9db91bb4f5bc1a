//! The B+Tree engine: descent, insertion with cascading splits, and the
//! one-at-a-time range scan.

use crate::btree::index_file_name;
use crate::btree::key::IndexKey;
use crate::btree::meta::IndexMeta;
use crate::btree::node::{InnerNode, InnerNodeMut, LeafNode, LeafNodeMut};
use crate::file::PagedFile;
use crate::heap::HeapFile;
use log::debug;
use marten_buffer::{BufferManager, PageStore};
use marten_common::config::StorageConfig;
use marten_common::page::{PageNo, INVALID_PAGE_NO};
use marten_common::types::{AttrType, RecordId, ScanOp};
use marten_common::{MartenError, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// Page number of the index header page. Page 2 is the initial root; the
/// root moves to a fresh page each time it splits.
const META_PAGE_NO: PageNo = 1;

/// One step of a root-to-leaf descent: the inner node we came through and
/// the child slot we took. The inserter replays this stack to propagate
/// splits upward.
struct PathEntry {
    parent_page_no: PageNo,
    child_index: usize,
}

/// Result of locating the leaf for a key. No pins are held on return.
struct LeafLocation {
    leaf_page_no: PageNo,
    /// First slot whose entry orders at-or-after the probe.
    insert_index: usize,
    /// Number of used entries in the leaf.
    used: usize,
    path: Vec<PathEntry>,
}

/// Live range-scan state. While present, `current_page` (if any) holds the
/// scan's single pinned leaf.
struct ScanState<K> {
    high: K,
    high_op: ScanOp,
    current_page: Option<PageNo>,
    next_entry: usize,
}

/// Tree shape summary returned by [`BTree::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Root level: the tree's height in pages.
    pub height: u32,
    /// Number of leaves on the sibling chain.
    pub leaf_count: usize,
    /// Total `(key, rid)` entries.
    pub entry_count: usize,
}

/// A disk-resident B+Tree secondary index over one attribute of a heap
/// relation, monomorphized per key type.
///
/// The index file holds a header page, an initial root page and
/// demand-allocated node pages; all access goes through the buffer
/// manager with balanced pin/unpin pairs. At most one range scan is live
/// at a time and owns the only pin that survives between calls.
pub struct BTree<K: IndexKey> {
    file: Arc<PagedFile>,
    buf: Arc<BufferManager>,
    name: String,
    attr_byte_offset: u32,
    root_page_no: PageNo,
    scan: Option<ScanState<K>>,
}

impl<K: IndexKey> BTree<K> {
    /// Opens the index for `heap`'s attribute at `attr_byte_offset`,
    /// creating and bulk-loading it if the index file does not exist yet.
    ///
    /// On open, the header page must agree with the arguments; a
    /// disagreement is an [`MartenError::IndexMetadataMismatch`].
    pub fn open_or_create(
        heap: &HeapFile,
        buf: Arc<BufferManager>,
        config: &StorageConfig,
        attr_byte_offset: u32,
        attr_type: AttrType,
    ) -> Result<Self> {
        let name = index_file_name(heap.name(), attr_byte_offset);
        let path = config.data_dir.join(&name);

        if path.exists() {
            Self::open(heap, buf, path, name, attr_byte_offset, attr_type, config)
        } else {
            Self::create(heap, buf, path, name, attr_byte_offset, attr_type, config)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open(
        heap: &HeapFile,
        buf: Arc<BufferManager>,
        path: std::path::PathBuf,
        name: String,
        attr_byte_offset: u32,
        attr_type: AttrType,
        config: &StorageConfig,
    ) -> Result<Self> {
        let file = Arc::new(PagedFile::open(path, config.fsync_enabled)?);
        buf.register_file(file.clone());
        let fid = file.file_id();

        let meta: Result<IndexMeta> = (|| {
            buf.read_page(&*file, META_PAGE_NO)?;
            let meta = buf.with_page(fid, META_PAGE_NO, IndexMeta::read_from)?;
            buf.unpin_page(fid, META_PAGE_NO, false)?;
            let meta = meta?;
            Self::check_meta(&meta, heap.name(), attr_byte_offset, attr_type)?;
            Ok(meta)
        })();

        let meta = match meta {
            Ok(meta) => meta,
            Err(e) => {
                let _ = buf.evict_file(&*file);
                buf.unregister_file(fid);
                return Err(e);
            }
        };

        debug!("opened index {} (root page {})", name, meta.root_page_no);
        Ok(Self {
            file,
            buf,
            name,
            attr_byte_offset,
            root_page_no: meta.root_page_no,
            scan: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        heap: &HeapFile,
        buf: Arc<BufferManager>,
        path: std::path::PathBuf,
        name: String,
        attr_byte_offset: u32,
        attr_type: AttrType,
        config: &StorageConfig,
    ) -> Result<Self> {
        let file = Arc::new(PagedFile::create(path, config.fsync_enabled)?);
        buf.register_file(file.clone());
        let fid = file.file_id();

        let meta_page = buf.alloc_page(&*file)?;
        let root_page = buf.alloc_page(&*file)?;

        let meta = IndexMeta {
            relation_name: heap.name().to_string(),
            attr_byte_offset,
            attr_type,
            root_page_no: root_page,
        };
        buf.with_page_mut(fid, meta_page, |data| meta.write_to(data))?;
        buf.unpin_page(fid, meta_page, true)?;

        // The initial root is an inner node with no children yet.
        buf.with_page_mut(fid, root_page, |data| {
            InnerNodeMut::<K>::new(data).set_level(1);
        })?;
        buf.unpin_page(fid, root_page, true)?;

        let mut index = Self {
            file,
            buf,
            name,
            attr_byte_offset,
            root_page_no: root_page,
            scan: None,
        };
        index.bulk_load(heap)?;
        debug!("created index {} from relation {}", index.name, heap.name());
        Ok(index)
    }

    fn check_meta(
        meta: &IndexMeta,
        relation_name: &str,
        attr_byte_offset: u32,
        attr_type: AttrType,
    ) -> Result<()> {
        // The header stores at most 19 name bytes; compare what fits.
        let stored_len = relation_name.len().min(IndexMeta::RELATION_NAME_LEN - 1);
        let expected_name =
            String::from_utf8_lossy(&relation_name.as_bytes()[..stored_len]).into_owned();
        if meta.relation_name != expected_name {
            return Err(MartenError::IndexMetadataMismatch {
                field: "relation_name",
                expected: expected_name,
                found: meta.relation_name.clone(),
            });
        }
        if meta.attr_byte_offset != attr_byte_offset {
            return Err(MartenError::IndexMetadataMismatch {
                field: "attr_byte_offset",
                expected: attr_byte_offset.to_string(),
                found: meta.attr_byte_offset.to_string(),
            });
        }
        if meta.attr_type != attr_type {
            return Err(MartenError::IndexMetadataMismatch {
                field: "attr_type",
                expected: attr_type.to_string(),
                found: meta.attr_type.to_string(),
            });
        }
        Ok(())
    }

    /// Scans the base relation and inserts every `(attribute, rid)` pair.
    fn bulk_load(&mut self, heap: &HeapFile) -> Result<()> {
        let offset = self.attr_byte_offset as usize;
        for item in heap.scan() {
            let (rid, record) = item?;
            if record.len() < offset + K::SIZE {
                return Err(MartenError::Internal(format!(
                    "record {} too short for attribute at offset {}",
                    rid, offset
                )));
            }
            let key = K::read_from(&record[offset..]);
            self.insert(key, rid)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    /// Child slot to descend through at an inner node.
    ///
    /// Inserts descend right of equal separators so duplicates gather at
    /// the upper end of their run; lookups descend left of them so a scan
    /// starts at the first leaf that can hold the key.
    fn descend_index(node: &InnerNode<'_, K>, key: K, insert: bool) -> usize {
        let mut i = 0;
        while i < K::INNER_FANOUT {
            if node.child_at(i + 1) == INVALID_PAGE_NO {
                break;
            }
            let cmp = node.key_at(i).key_cmp(&key);
            let go_right = if insert {
                cmp != Ordering::Greater
            } else {
                cmp == Ordering::Less
            };
            if !go_right {
                break;
            }
            i += 1;
        }
        i
    }

    /// Slot where the probe orders into a leaf, plus the used-entry count.
    ///
    /// With a rid the probe is the `(key, rid)` pair, giving duplicate
    /// keys a total order; without one (lookup mode) the probe is the key
    /// alone, landing on the first entry at-or-after it.
    fn leaf_position(leaf: &LeafNode<'_, K>, key: K, rid: Option<RecordId>) -> (usize, usize) {
        let mut insert_index = None;
        let mut used = K::LEAF_FANOUT;
        for i in 0..K::LEAF_FANOUT {
            let entry_rid = leaf.rid_at(i);
            if entry_rid.is_empty() {
                used = i;
                break;
            }
            if insert_index.is_none() {
                let at_or_after = match leaf.key_at(i).key_cmp(&key) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => rid.map_or(true, |r| entry_rid >= r),
                };
                if at_or_after {
                    insert_index = Some(i);
                }
            }
        }
        (insert_index.unwrap_or(used), used)
    }

    /// Walks from the root to the leaf that does or would contain `key`,
    /// recording the descent path. Every page pinned on the way down is
    /// unpinned again; the caller re-pins what it needs.
    fn locate(&self, key: K, rid: Option<RecordId>) -> Result<LeafLocation> {
        let fid = self.file.file_id();
        let mut page_no = self.root_page_no;
        let mut path = Vec::new();

        self.buf.read_page(&*self.file, page_no)?;
        let root_level = self
            .buf
            .with_page(fid, page_no, |data| InnerNode::<K>::new(data).level())?;

        for _ in 1..root_level {
            let (child_index, child_no) = self.buf.with_page(fid, page_no, |data| {
                let node = InnerNode::<K>::new(data);
                let index = Self::descend_index(&node, key, rid.is_some());
                (index, node.child_at(index))
            })?;
            path.push(PathEntry {
                parent_page_no: page_no,
                child_index,
            });
            self.buf.unpin_page(fid, page_no, false)?;
            self.buf.read_page(&*self.file, child_no)?;
            page_no = child_no;
        }

        let (insert_index, used) = self.buf.with_page(fid, page_no, |data| {
            let leaf = LeafNode::<K>::new(data);
            Self::leaf_position(&leaf, key, rid)
        })?;
        self.buf.unpin_page(fid, page_no, false)?;

        Ok(LeafLocation {
            leaf_page_no: page_no,
            insert_index,
            used,
            path,
        })
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Inserts a `(key, rid)` entry.
    pub fn insert(&mut self, key: K, rid: RecordId) -> Result<()> {
        let fid = self.file.file_id();

        self.buf.read_page(&*self.file, self.root_page_no)?;
        let first_child = self.buf.with_page(fid, self.root_page_no, |data| {
            InnerNode::<K>::new(data).child_at(0)
        })?;
        if first_child == INVALID_PAGE_NO {
            return self.first_insert(key, rid);
        }
        self.buf.unpin_page(fid, self.root_page_no, false)?;

        let loc = self.locate(key, Some(rid))?;
        if loc.used < K::LEAF_FANOUT {
            self.buf.read_page(&*self.file, loc.leaf_page_no)?;
            self.buf.with_page_mut(fid, loc.leaf_page_no, |data| {
                LeafNodeMut::<K>::new(data).insert_at(loc.insert_index, loc.used, key, rid);
            })?;
            self.buf.unpin_page(fid, loc.leaf_page_no, true)?;
            return Ok(());
        }
        self.split_leaf_and_insert(key, rid, loc)
    }

    /// Very first insert: the empty root gains two leaf children, an
    /// empty left one and a right one holding the new entry.
    ///
    /// The root page is pinned by the caller and released here.
    fn first_insert(&mut self, key: K, rid: RecordId) -> Result<()> {
        let fid = self.file.file_id();
        let left = self.buf.alloc_page(&*self.file)?;
        let right = self.buf.alloc_page(&*self.file)?;

        self.buf.with_page_mut(fid, left, |data| {
            LeafNodeMut::<K>::new(data).set_right_sibling(right);
        })?;
        self.buf.with_page_mut(fid, right, |data| {
            LeafNodeMut::<K>::new(data).set_entry(0, key, rid);
        })?;
        self.buf.with_page_mut(fid, self.root_page_no, |data| {
            let mut root = InnerNodeMut::<K>::new(data);
            root.set_level(2);
            root.set_key(0, key);
            root.set_child(0, left);
            root.set_child(1, right);
        })?;

        self.buf.unpin_page(fid, left, true)?;
        self.buf.unpin_page(fid, right, true)?;
        self.buf.unpin_page(fid, self.root_page_no, true)?;
        Ok(())
    }

    /// Splits the full leaf at `loc`, inserts the pending entry on the
    /// proper side and propagates the new separator up the path.
    fn split_leaf_and_insert(&mut self, key: K, rid: RecordId, loc: LeafLocation) -> Result<()> {
        let fid = self.file.file_id();
        let median = K::LEAF_FANOUT / 2;
        let leaf_no = loc.leaf_page_no;

        self.buf.read_page(&*self.file, leaf_no)?;
        let new_leaf_no = self.buf.alloc_page(&*self.file)?;

        let (moved, old_sibling) = self.buf.with_page(fid, leaf_no, |data| {
            let leaf = LeafNode::<K>::new(data);
            let moved: Vec<(K, RecordId)> = (median..K::LEAF_FANOUT)
                .map(|i| (leaf.key_at(i), leaf.rid_at(i)))
                .collect();
            (moved, leaf.right_sibling())
        })?;

        self.buf.with_page_mut(fid, new_leaf_no, |data| {
            let mut leaf = LeafNodeMut::<K>::new(data);
            for (j, &(k, r)) in moved.iter().enumerate() {
                leaf.set_entry(j, k, r);
            }
            leaf.set_right_sibling(old_sibling);
        })?;
        self.buf.with_page_mut(fid, leaf_no, |data| {
            let mut leaf = LeafNodeMut::<K>::new(data);
            for i in median..K::LEAF_FANOUT {
                leaf.clear_entry(i);
            }
            leaf.set_right_sibling(new_leaf_no);
        })?;

        // The slot index found against the unsplit leaf decides the side.
        let right_used = K::LEAF_FANOUT - median;
        if loc.insert_index >= median {
            self.buf.with_page_mut(fid, new_leaf_no, |data| {
                LeafNodeMut::<K>::new(data).insert_at(
                    loc.insert_index - median,
                    right_used,
                    key,
                    rid,
                );
            })?;
        } else {
            self.buf.with_page_mut(fid, leaf_no, |data| {
                LeafNodeMut::<K>::new(data).insert_at(loc.insert_index, median, key, rid);
            })?;
        }

        let separator = self
            .buf
            .with_page(fid, new_leaf_no, |data| LeafNode::<K>::new(data).key_at(0))?;

        self.buf.unpin_page(fid, leaf_no, true)?;
        self.buf.unpin_page(fid, new_leaf_no, true)?;

        self.propagate_split(separator, new_leaf_no, loc.path)
    }

    /// Carries a `(separator, new right child)` pair up the recorded
    /// path, splitting full inner nodes as needed and growing a new root
    /// when the path runs out.
    fn propagate_split(
        &mut self,
        separator: K,
        new_child: PageNo,
        mut path: Vec<PathEntry>,
    ) -> Result<()> {
        let fid = self.file.file_id();
        let mut pending = Some((separator, new_child));
        let mut split_level = 1;

        while let Some((separator, new_child)) = pending.take() {
            let Some(entry) = path.pop() else {
                return self.grow_root(separator, new_child, split_level + 1);
            };
            let parent_no = entry.parent_page_no;
            let child_index = entry.child_index;

            self.buf.read_page(&*self.file, parent_no)?;
            let (used_children, level) = self.buf.with_page(fid, parent_no, |data| {
                let node = InnerNode::<K>::new(data);
                (node.used_children(), node.level())
            })?;

            if used_children <= K::INNER_FANOUT {
                self.buf.with_page_mut(fid, parent_no, |data| {
                    InnerNodeMut::<K>::new(data).insert_separator(
                        child_index,
                        used_children,
                        separator,
                        new_child,
                    );
                })?;
                self.buf.unpin_page(fid, parent_no, true)?;
                return Ok(());
            }

            // Inner node full: promote the median, move the upper half
            // into a new right sibling.
            let median = K::INNER_FANOUT / 2;
            let new_inner_no = self.buf.alloc_page(&*self.file)?;

            let (promoted, moved_keys, moved_children) =
                self.buf.with_page(fid, parent_no, |data| {
                    let node = InnerNode::<K>::new(data);
                    let promoted = node.key_at(median);
                    let moved_keys: Vec<K> = (median + 1..K::INNER_FANOUT)
                        .map(|i| node.key_at(i))
                        .collect();
                    let moved_children: Vec<PageNo> = (median + 1..=K::INNER_FANOUT)
                        .map(|i| node.child_at(i))
                        .collect();
                    (promoted, moved_keys, moved_children)
                })?;

            self.buf.with_page_mut(fid, new_inner_no, |data| {
                let mut node = InnerNodeMut::<K>::new(data);
                node.set_level(level);
                for (j, k) in moved_keys.iter().enumerate() {
                    node.set_key(j, *k);
                }
                for (j, c) in moved_children.iter().enumerate() {
                    node.set_child(j, *c);
                }
            })?;
            self.buf.with_page_mut(fid, parent_no, |data| {
                let mut node = InnerNodeMut::<K>::new(data);
                node.clear_key(median);
                for i in median + 1..K::INNER_FANOUT {
                    node.clear_key(i);
                }
                for i in median + 1..=K::INNER_FANOUT {
                    node.clear_child(i);
                }
            })?;

            // The recorded child slot tells which side the pending
            // separator belongs to.
            if child_index <= median {
                self.buf.with_page_mut(fid, parent_no, |data| {
                    InnerNodeMut::<K>::new(data).insert_separator(
                        child_index,
                        median + 1,
                        separator,
                        new_child,
                    );
                })?;
            } else {
                self.buf.with_page_mut(fid, new_inner_no, |data| {
                    InnerNodeMut::<K>::new(data).insert_separator(
                        child_index - median - 1,
                        K::INNER_FANOUT - median,
                        separator,
                        new_child,
                    );
                })?;
            }

            self.buf.unpin_page(fid, parent_no, true)?;
            self.buf.unpin_page(fid, new_inner_no, true)?;

            split_level = level;
            pending = Some((promoted, new_inner_no));
        }
        Ok(())
    }

    /// Allocates a new root above the old one and rewrites the header's
    /// root page number.
    fn grow_root(&mut self, separator: K, new_child: PageNo, new_level: u32) -> Result<()> {
        let fid = self.file.file_id();
        let new_root_no = self.buf.alloc_page(&*self.file)?;

        self.buf.with_page_mut(fid, new_root_no, |data| {
            let mut root = InnerNodeMut::<K>::new(data);
            root.set_level(new_level);
            root.set_key(0, separator);
            root.set_child(0, self.root_page_no);
            root.set_child(1, new_child);
        })?;
        self.buf.unpin_page(fid, new_root_no, true)?;

        debug!(
            "index {}: root grew to level {} (page {})",
            self.name, new_level, new_root_no
        );
        self.root_page_no = new_root_no;

        self.buf.read_page(&*self.file, META_PAGE_NO)?;
        self.buf.with_page_mut(fid, META_PAGE_NO, |data| {
            data[IndexMeta::ROOT_PAGE_NO_OFF..IndexMeta::ROOT_PAGE_NO_OFF + 4]
                .copy_from_slice(&new_root_no.to_le_bytes());
        })?;
        self.buf.unpin_page(fid, META_PAGE_NO, true)
    }

    // ------------------------------------------------------------------
    // Range scan
    // ------------------------------------------------------------------

    /// Opens a range scan over `[low_op low, high_op high]`.
    ///
    /// Any already-open scan is closed first. Fails with
    /// [`MartenError::NoSuchKeyFound`] when no entry satisfies the range;
    /// the scan is then not open.
    pub fn start_scan(&mut self, low: K, low_op: ScanOp, high: K, high_op: ScanOp) -> Result<()> {
        if !low_op.is_low_op() || !high_op.is_high_op() {
            return Err(MartenError::BadScanOpcodes);
        }
        if low.key_cmp(&high) == Ordering::Greater {
            return Err(MartenError::BadScanRange);
        }
        if self.scan.is_some() {
            self.end_scan()?;
        }

        let fid = self.file.file_id();
        self.buf.read_page(&*self.file, self.root_page_no)?;
        let first_child = self.buf.with_page(fid, self.root_page_no, |data| {
            InnerNode::<K>::new(data).child_at(0)
        })?;
        self.buf.unpin_page(fid, self.root_page_no, false)?;
        if first_child == INVALID_PAGE_NO {
            return Err(MartenError::NoSuchKeyFound);
        }

        let loc = self.locate(low, None)?;
        self.buf.read_page(&*self.file, loc.leaf_page_no)?;
        let mut state = ScanState {
            high,
            high_op,
            current_page: Some(loc.leaf_page_no),
            next_entry: loc.insert_index,
        };

        if loc.insert_index >= loc.used {
            Self::cross_to_sibling(&self.file, &self.buf, &mut state)?;
        }

        if low_op == ScanOp::Gt {
            // Skip every entry equal to the low bound, crossing leaves
            // as needed.
            while let Some(page_no) = state.current_page {
                let next = state.next_entry;
                let key = self
                    .buf
                    .with_page(fid, page_no, |data| LeafNode::<K>::new(data).key_at(next))?;
                if key.key_cmp(&low) != Ordering::Equal {
                    break;
                }
                Self::advance_entry(&self.file, &self.buf, &mut state)?;
            }
        }

        let Some(page_no) = state.current_page else {
            return Err(MartenError::NoSuchKeyFound);
        };
        let next = state.next_entry;
        let key = self
            .buf
            .with_page(fid, page_no, |data| LeafNode::<K>::new(data).key_at(next))?;
        if Self::past_high(&key, &state) {
            self.buf.unpin_page(fid, page_no, false)?;
            return Err(MartenError::NoSuchKeyFound);
        }

        self.scan = Some(state);
        Ok(())
    }

    /// Returns the rid of the next entry in the scan range.
    ///
    /// Fails with [`MartenError::ScanNotInitialized`] when no scan is
    /// open and [`MartenError::IndexScanCompleted`] once the range is
    /// exhausted (stably: later calls keep reporting completion).
    pub fn scan_next(&mut self) -> Result<RecordId> {
        let state = self.scan.as_mut().ok_or(MartenError::ScanNotInitialized)?;
        let page_no = state.current_page.ok_or(MartenError::IndexScanCompleted)?;

        let fid = self.file.file_id();
        let next = state.next_entry;
        let (key, rid) = self.buf.with_page(fid, page_no, |data| {
            let leaf = LeafNode::<K>::new(data);
            (leaf.key_at(next), leaf.rid_at(next))
        })?;

        if Self::past_high(&key, state) {
            self.buf.unpin_page(fid, page_no, false)?;
            state.current_page = None;
            return Err(MartenError::IndexScanCompleted);
        }

        Self::advance_entry(&self.file, &self.buf, state)?;
        Ok(rid)
    }

    /// Closes the current scan, releasing its pinned leaf.
    pub fn end_scan(&mut self) -> Result<()> {
        let state = self.scan.take().ok_or(MartenError::ScanNotInitialized)?;
        if let Some(page_no) = state.current_page {
            self.buf.unpin_page(self.file.file_id(), page_no, false)?;
        }
        Ok(())
    }

    fn past_high(key: &K, state: &ScanState<K>) -> bool {
        match key.key_cmp(&state.high) {
            Ordering::Greater => true,
            Ordering::Equal => state.high_op == ScanOp::Lt,
            Ordering::Less => false,
        }
    }

    /// Moves the scan to the next used entry, crossing to the right
    /// sibling when the current leaf is done.
    fn advance_entry(
        file: &Arc<PagedFile>,
        buf: &BufferManager,
        state: &mut ScanState<K>,
    ) -> Result<()> {
        let Some(page_no) = state.current_page else {
            return Ok(());
        };
        let next = state.next_entry;
        let has_next = buf.with_page(file.file_id(), page_no, |data| {
            let leaf = LeafNode::<K>::new(data);
            next + 1 < K::LEAF_FANOUT && !leaf.rid_at(next + 1).is_empty()
        })?;
        if has_next {
            state.next_entry += 1;
            return Ok(());
        }
        Self::cross_to_sibling(file, buf, state)
    }

    /// Unpins the current leaf and pins its right sibling, or marks the
    /// scan exhausted at the end of the chain.
    fn cross_to_sibling(
        file: &Arc<PagedFile>,
        buf: &BufferManager,
        state: &mut ScanState<K>,
    ) -> Result<()> {
        let Some(page_no) = state.current_page else {
            return Ok(());
        };
        let fid = file.file_id();
        let sibling = buf.with_page(fid, page_no, |data| {
            LeafNode::<K>::new(data).right_sibling()
        })?;
        buf.unpin_page(fid, page_no, false)?;

        if sibling == INVALID_PAGE_NO {
            state.current_page = None;
        } else {
            buf.read_page(&**file, sibling)?;
            state.current_page = Some(sibling);
            state.next_entry = 0;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Height of the tree in pages (the root's level).
    pub fn height(&self) -> Result<u32> {
        let fid = self.file.file_id();
        self.buf.read_page(&*self.file, self.root_page_no)?;
        let level = self
            .buf
            .with_page(fid, self.root_page_no, |data| {
                InnerNode::<K>::new(data).level()
            })?;
        self.buf.unpin_page(fid, self.root_page_no, false)?;
        Ok(level)
    }

    /// Walks the whole tree checking the structural invariants: sorted
    /// keys, contiguous used slots, uniform levels per depth, and a
    /// sibling chain that enumerates the leaves in key order.
    pub fn validate(&self) -> Result<TreeStats> {
        let fid = self.file.file_id();
        self.buf.read_page(&*self.file, self.root_page_no)?;
        let (level, first_child) = self.buf.with_page(fid, self.root_page_no, |data| {
            let node = InnerNode::<K>::new(data);
            (node.level(), node.child_at(0))
        })?;
        self.buf.unpin_page(fid, self.root_page_no, false)?;

        if first_child == INVALID_PAGE_NO {
            return Ok(TreeStats {
                height: level,
                leaf_count: 0,
                entry_count: 0,
            });
        }

        let mut leaves = Vec::new();
        self.collect_leaves(self.root_page_no, level, &mut leaves)?;

        let mut entry_count = 0;
        let mut prev_key: Option<K> = None;
        for (i, &leaf_no) in leaves.iter().enumerate() {
            self.buf.read_page(&*self.file, leaf_no)?;
            let (entries, sibling) = self.buf.with_page(fid, leaf_no, |data| {
                let leaf = LeafNode::<K>::new(data);
                let used = leaf.used_count();
                let entries: Vec<(K, RecordId)> =
                    (0..used).map(|j| (leaf.key_at(j), leaf.rid_at(j))).collect();
                (entries, leaf.right_sibling())
            })?;
            self.buf.unpin_page(fid, leaf_no, false)?;

            let expected_sibling = leaves.get(i + 1).copied().unwrap_or(INVALID_PAGE_NO);
            if sibling != expected_sibling {
                return Err(MartenError::Internal(format!(
                    "leaf {} sibling {} does not match chain ({})",
                    leaf_no, sibling, expected_sibling
                )));
            }
            if entries.is_empty() && i != 0 {
                return Err(MartenError::Internal(format!("leaf {} is empty", leaf_no)));
            }

            let mut prev_rid: Option<RecordId> = None;
            for (key, rid) in entries {
                if let Some(prev) = prev_key {
                    match prev.key_cmp(&key) {
                        Ordering::Greater => {
                            return Err(MartenError::Internal(format!(
                                "keys out of order in leaf {}",
                                leaf_no
                            )));
                        }
                        Ordering::Equal => {
                            if let Some(pr) = prev_rid {
                                if pr >= rid {
                                    return Err(MartenError::Internal(format!(
                                        "duplicate keys out of rid order in leaf {}",
                                        leaf_no
                                    )));
                                }
                            }
                        }
                        Ordering::Less => {}
                    }
                }
                prev_key = Some(key);
                prev_rid = Some(rid);
                entry_count += 1;
            }
        }

        Ok(TreeStats {
            height: level,
            leaf_count: leaves.len(),
            entry_count,
        })
    }

    fn collect_leaves(&self, page_no: PageNo, level: u32, out: &mut Vec<PageNo>) -> Result<()> {
        let fid = self.file.file_id();
        self.buf.read_page(&*self.file, page_no)?;
        let (node_level, keys, children) = self.buf.with_page(fid, page_no, |data| {
            let node = InnerNode::<K>::new(data);
            let used = node.used_children();
            let keys: Vec<K> = (0..used.saturating_sub(1)).map(|i| node.key_at(i)).collect();
            let children: Vec<PageNo> = (0..used).map(|i| node.child_at(i)).collect();
            (node.level(), keys, children)
        })?;
        self.buf.unpin_page(fid, page_no, false)?;

        if node_level != level {
            return Err(MartenError::Internal(format!(
                "inner node {} has level {}, expected {}",
                page_no, node_level, level
            )));
        }
        for pair in keys.windows(2) {
            if pair[0].key_cmp(&pair[1]) == Ordering::Greater {
                return Err(MartenError::Internal(format!(
                    "separators out of order in inner node {}",
                    page_no
                )));
            }
        }

        if level == 2 {
            out.extend(children);
        } else {
            for child in children {
                self.collect_leaves(child, level - 1, out)?;
            }
        }
        Ok(())
    }
}

impl<K: IndexKey> Drop for BTree<K> {
    fn drop(&mut self) {
        // End any live scan, flush, and leave the pool clean. Errors
        // cannot escape a destructor.
        if self.scan.is_some() {
            let _ = self.end_scan();
        }
        let _ = self.buf.evict_file(&*self.file);
        self.buf.unregister_file(self.file.file_id());
    }
}
