//! Heap files: append-mode record storage over the buffer manager.

use crate::file::PagedFile;
use crate::heap::page::HeapPage;
use bytes::Bytes;
use log::debug;
use marten_buffer::{BufferManager, PageStore};
use marten_common::config::StorageConfig;
use marten_common::types::RecordId;
use marten_common::{MartenError, Result};
use std::collections::VecDeque;
use std::sync::Arc;

/// A heap relation: records in slotted pages, addressed by
/// `(page_no, slot_no)`.
///
/// Inserts append to the last page, allocating a fresh one when it fills.
/// All page access is routed through the buffer manager; the sequential
/// [`HeapScan`] is what an index bulk-load consumes.
pub struct HeapFile {
    name: String,
    file: Arc<PagedFile>,
    buf: Arc<BufferManager>,
}

impl HeapFile {
    /// Creates a new heap relation named `name` under the data directory.
    pub fn create(name: &str, config: &StorageConfig, buf: Arc<BufferManager>) -> Result<Self> {
        let path = config.data_dir.join(name);
        let file = Arc::new(PagedFile::create(path, config.fsync_enabled)?);
        buf.register_file(file.clone());
        debug!("created heap relation {}", name);
        Ok(Self {
            name: name.to_string(),
            file,
            buf,
        })
    }

    /// Opens an existing heap relation.
    pub fn open(name: &str, config: &StorageConfig, buf: Arc<BufferManager>) -> Result<Self> {
        let path = config.data_dir.join(name);
        let file = Arc::new(PagedFile::open(path, config.fsync_enabled)?);
        buf.register_file(file.clone());
        Ok(Self {
            name: name.to_string(),
            file,
            buf,
        })
    }

    /// Name of the relation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a record, returning its id.
    pub fn insert_record(&self, record: &[u8]) -> Result<RecordId> {
        let fid = self.file.file_id();
        let num_pages = self.file.num_pages();

        // Try the last data page first.
        if num_pages > 1 {
            let page_no = num_pages - 1;
            self.buf.read_page(&*self.file, page_no)?;
            let inserted = self
                .buf
                .with_page_mut(fid, page_no, |data| HeapPage::insert_record(data, record))?;
            match inserted {
                Ok(slot_no) => {
                    self.buf.unpin_page(fid, page_no, true)?;
                    return Ok(RecordId::new(page_no, slot_no));
                }
                Err(MartenError::PageFull) => {
                    self.buf.unpin_page(fid, page_no, false)?;
                }
                Err(e) => {
                    self.buf.unpin_page(fid, page_no, false)?;
                    return Err(e);
                }
            }
        }

        let page_no = self.buf.alloc_page(&*self.file)?;
        let inserted = self
            .buf
            .with_page_mut(fid, page_no, |data| HeapPage::insert_record(data, record))?;
        match inserted {
            Ok(slot_no) => {
                self.buf.unpin_page(fid, page_no, true)?;
                Ok(RecordId::new(page_no, slot_no))
            }
            Err(e) => {
                self.buf.unpin_page(fid, page_no, false)?;
                Err(e)
            }
        }
    }

    /// Reads the record identified by `rid`.
    pub fn record(&self, rid: RecordId) -> Result<Bytes> {
        let fid = self.file.file_id();
        self.buf.read_page(&*self.file, rid.page_no)?;
        let found = self.buf.with_page(fid, rid.page_no, |data| {
            HeapPage::record(data, rid.slot_no).map(Bytes::copy_from_slice)
        })?;
        self.buf.unpin_page(fid, rid.page_no, false)?;
        found.ok_or_else(|| MartenError::RecordNotFound(rid.to_string()))
    }

    /// Returns a sequential scan over all records, in page then slot order.
    pub fn scan(&self) -> HeapScan<'_> {
        HeapScan {
            heap: self,
            next_page: 1,
            queue: VecDeque::new(),
        }
    }
}

impl Drop for HeapFile {
    fn drop(&mut self) {
        let _ = self.buf.evict_file(&*self.file);
        self.buf.unregister_file(self.file.file_id());
    }
}

/// Sequential scan over a heap relation.
///
/// Copies one page of records at a time so no pin is held between `next`
/// calls.
pub struct HeapScan<'a> {
    heap: &'a HeapFile,
    next_page: u32,
    queue: VecDeque<(RecordId, Bytes)>,
}

impl HeapScan<'_> {
    fn load_next_page(&mut self) -> Result<()> {
        let page_no = self.next_page;
        self.next_page += 1;

        let fid = self.heap.file.file_id();
        self.heap.buf.read_page(&*self.heap.file, page_no)?;
        let records = self.heap.buf.with_page(fid, page_no, |data| {
            let count = HeapPage::record_count(data);
            let mut out = Vec::with_capacity(count);
            for slot_no in 1..=count as u16 {
                if let Some(record) = HeapPage::record(data, slot_no) {
                    out.push((RecordId::new(page_no, slot_no), Bytes::copy_from_slice(record)));
                }
            }
            out
        })?;
        self.heap.buf.unpin_page(fid, page_no, false)?;

        self.queue.extend(records);
        Ok(())
    }
}

impl Iterator for HeapScan<'_> {
    type Item = Result<(RecordId, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(Ok(item));
            }
            if self.next_page >= self.heap.file.num_pages() {
                return None;
            }
            if let Err(e) = self.load_next_page() {
                return Some(Err(e));
            }
        }
    }
}
