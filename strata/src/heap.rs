//! The slotted-page heap file: fixed-width records addressed by `Rid`, with
//! a free-page list threaded through page headers.

use std::mem::size_of;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bitmap;
use crate::buffer_pool::{BufferPoolManager, PageGuard};
use crate::disk::DiskManager;
use crate::errors::StorageError;
use crate::page::{decode_header, encode_header};
use crate::{HEAP_FIRST_RECORD_PAGE, NO_PAGE, PAGE_SIZE, FileId, Page, PageId, PageNo, Rid};

const HEAP_FILE_HDR_PAGE: PageNo = 0;
const HEAP_PAGE_HDR_SIZE: usize = size_of::<HeapPageHeader>();

/// Per-file metadata, persisted on page 0 whenever the freelist or page
/// count changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapFileHeader {
    pub record_size: u32,
    pub records_per_page: u32,
    pub bitmap_size: u32,
    /// Total pages in the file, the header page included.
    pub num_pages: u32,
    /// Head of the list of pages that still have a free slot.
    pub first_free_page_no: PageNo,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct HeapPageHeader {
    num_records: u32,
    next_free_page_no: PageNo,
}

impl Page {
    fn heap_header(&self) -> HeapPageHeader {
        unsafe { std::ptr::read_unaligned(self.data.as_ptr() as *const HeapPageHeader) }
    }

    fn write_heap_header(&mut self, header: &HeapPageHeader) {
        unsafe {
            std::ptr::write_unaligned(self.data.as_mut_ptr() as *mut HeapPageHeader, *header);
        }
    }

    fn heap_bitmap(&self, hdr: &HeapFileHeader) -> &[u8] {
        self.bytes(HEAP_PAGE_HDR_SIZE, hdr.bitmap_size as usize)
    }

    fn heap_bitmap_mut(&mut self, hdr: &HeapFileHeader) -> &mut [u8] {
        self.bytes_mut(HEAP_PAGE_HDR_SIZE, hdr.bitmap_size as usize)
    }

    fn heap_slot(&self, hdr: &HeapFileHeader, slot_no: u32) -> &[u8] {
        let offset =
            HEAP_PAGE_HDR_SIZE + hdr.bitmap_size as usize + slot_no as usize * hdr.record_size as usize;
        self.bytes(offset, hdr.record_size as usize)
    }

    fn heap_slot_mut(&mut self, hdr: &HeapFileHeader, slot_no: u32) -> &mut [u8] {
        let offset =
            HEAP_PAGE_HDR_SIZE + hdr.bitmap_size as usize + slot_no as usize * hdr.record_size as usize;
        self.bytes_mut(offset, hdr.record_size as usize)
    }
}

/// A handle on one open heap file.
pub struct HeapFile {
    file_id: FileId,
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    hdr: Mutex<HeapFileHeader>,
}

fn page_capacity(record_size: usize) -> Option<(u32, u32)> {
    if record_size == 0 {
        return None;
    }
    // One bit of bitmap per slot, so usable bits bound the slot count.
    let mut n = (PAGE_SIZE - HEAP_PAGE_HDR_SIZE) * 8 / (record_size * 8 + 1);
    while n > 0 && HEAP_PAGE_HDR_SIZE + n.div_ceil(8) + n * record_size > PAGE_SIZE {
        n -= 1;
    }
    if n == 0 {
        return None;
    }
    Some((n as u32, n.div_ceil(8) as u32))
}

impl HeapFile {
    pub fn create(
        disk: Arc<DiskManager>,
        bpm: Arc<BufferPoolManager>,
        name: &str,
        record_size: usize,
    ) -> Result<Self, StorageError> {
        let (records_per_page, bitmap_size) =
            page_capacity(record_size).ok_or(StorageError::RecordTooLarge(record_size))?;
        let file_id = disk.create_file(name)?;
        let hdr = HeapFileHeader {
            record_size: record_size as u32,
            records_per_page,
            bitmap_size,
            num_pages: 1,
            first_free_page_no: NO_PAGE,
        };

        let file = Self {
            file_id,
            disk,
            bpm,
            hdr: Mutex::new(hdr.clone()),
        };
        file.persist_header(&hdr)?;
        Ok(file)
    }

    pub fn open(
        disk: Arc<DiskManager>,
        bpm: Arc<BufferPoolManager>,
        name: &str,
    ) -> Result<Self, StorageError> {
        let file_id = disk.open_file(name)?;
        let page = disk.read_page(PageId {
            file_id,
            page_no: HEAP_FILE_HDR_PAGE,
        })?;
        let hdr: HeapFileHeader = decode_header(&page)?;
        // Page numbers are handed out by the disk manager; resume from the
        // persisted count so unflushed tails are not re-allocated.
        disk.set_next_page_no(file_id, hdr.num_pages)?;
        Ok(Self {
            file_id,
            disk,
            bpm,
            hdr: Mutex::new(hdr),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn record_size(&self) -> usize {
        self.hdr.lock().unwrap().record_size as usize
    }

    pub fn header(&self) -> HeapFileHeader {
        self.hdr.lock().unwrap().clone()
    }

    fn persist_header(&self, hdr: &HeapFileHeader) -> Result<(), StorageError> {
        let mut page = Page::new(PageId {
            file_id: self.file_id,
            page_no: HEAP_FILE_HDR_PAGE,
        });
        encode_header(&mut page, hdr)?;
        self.disk.write_page(&page)?;
        Ok(())
    }

    fn validate_rid(hdr: &HeapFileHeader, rid: Rid) -> Result<(), StorageError> {
        if rid.page_no < HEAP_FIRST_RECORD_PAGE || rid.page_no >= hdr.num_pages {
            return Err(StorageError::InvalidPage(rid.page_no));
        }
        if rid.slot_no >= hdr.records_per_page {
            return Err(StorageError::InvalidSlot(rid.slot_no));
        }
        Ok(())
    }

    fn validate_record(hdr: &HeapFileHeader, buf: &[u8]) -> Result<(), StorageError> {
        if buf.len() != hdr.record_size as usize {
            return Err(StorageError::RecordSizeMismatch {
                expected: hdr.record_size as usize,
                got: buf.len(),
            });
        }
        Ok(())
    }

    fn fetch_record_page(&self, page_no: PageNo) -> Result<PageGuard<'_>, StorageError> {
        self.bpm.acquire_page(PageId {
            file_id: self.file_id,
            page_no,
        })
    }

    /// Returns a copy of the record at `rid`.
    pub fn get(&self, rid: Rid) -> Result<Vec<u8>, StorageError> {
        let hdr = self.hdr.lock().unwrap();
        Self::validate_rid(&hdr, rid)?;

        let guard = self.fetch_record_page(rid.page_no)?;
        let page = guard.read();
        if !bitmap::is_set(page.heap_bitmap(&hdr), rid.slot_no as usize) {
            return Err(StorageError::RecordNotFound(rid));
        }
        Ok(page.heap_slot(&hdr, rid.slot_no).to_vec())
    }

    /// Inserts a record into the first free slot of the freelist-head page,
    /// creating a new page when the freelist is empty.
    pub fn insert(&self, buf: &[u8]) -> Result<Rid, StorageError> {
        let mut hdr = self.hdr.lock().unwrap();
        Self::validate_record(&hdr, buf)?;

        let page_no = if hdr.first_free_page_no == NO_PAGE {
            self.create_free_page(&mut hdr)?
        } else {
            hdr.first_free_page_no
        };

        let guard = self.fetch_record_page(page_no)?;
        let mut page = guard.write();

        let slot_no = bitmap::first_zero(page.heap_bitmap(&hdr), hdr.records_per_page as usize);
        if slot_no == hdr.records_per_page as usize {
            // The freelist invariant says every member has a free slot.
            return Err(StorageError::CorruptHeader(self.file_id));
        }
        let slot_no = slot_no as u32;

        page.heap_slot_mut(&hdr, slot_no).copy_from_slice(buf);
        bitmap::set(page.heap_bitmap_mut(&hdr), slot_no as usize);
        let mut page_hdr = page.heap_header();
        page_hdr.num_records += 1;

        if page_hdr.num_records == hdr.records_per_page {
            // The page filled up: splice it off the freelist head.
            hdr.first_free_page_no = page_hdr.next_free_page_no;
            page_hdr.next_free_page_no = NO_PAGE;
            page.write_heap_header(&page_hdr);
            self.persist_header(&hdr)?;
        } else {
            page.write_heap_header(&page_hdr);
        }

        crate::strata_debug_log!(
            "[HeapFile::insert] file {} -> ({page_no}, {slot_no})",
            self.file_id
        );
        Ok(Rid { page_no, slot_no })
    }

    /// Inserts a record at a caller-chosen position. Needed to roll back
    /// deletes to their original Rid.
    pub fn insert_at(&self, rid: Rid, buf: &[u8]) -> Result<(), StorageError> {
        let mut hdr = self.hdr.lock().unwrap();
        Self::validate_record(&hdr, buf)?;
        Self::validate_rid(&hdr, rid)?;

        let guard = self.fetch_record_page(rid.page_no)?;
        let mut page = guard.write();
        if bitmap::is_set(page.heap_bitmap(&hdr), rid.slot_no as usize) {
            return Err(StorageError::SlotOccupied(rid));
        }

        page.heap_slot_mut(&hdr, rid.slot_no).copy_from_slice(buf);
        bitmap::set(page.heap_bitmap_mut(&hdr), rid.slot_no as usize);
        let mut page_hdr = page.heap_header();
        page_hdr.num_records += 1;

        if page_hdr.num_records == hdr.records_per_page {
            hdr.first_free_page_no = page_hdr.next_free_page_no;
            page_hdr.next_free_page_no = NO_PAGE;
            page.write_heap_header(&page_hdr);
            self.persist_header(&hdr)?;
        } else {
            page.write_heap_header(&page_hdr);
        }
        Ok(())
    }

    /// Deletes the record at `rid`. A previously full page rejoins the
    /// freelist at its head.
    pub fn delete(&self, rid: Rid) -> Result<(), StorageError> {
        let mut hdr = self.hdr.lock().unwrap();
        Self::validate_rid(&hdr, rid)?;

        let guard = self.fetch_record_page(rid.page_no)?;
        let mut page = guard.write();
        if !bitmap::is_set(page.heap_bitmap(&hdr), rid.slot_no as usize) {
            return Err(StorageError::RecordNotFound(rid));
        }

        let mut page_hdr = page.heap_header();
        let was_full = page_hdr.num_records == hdr.records_per_page;

        bitmap::reset(page.heap_bitmap_mut(&hdr), rid.slot_no as usize);
        page_hdr.num_records -= 1;

        if was_full {
            page_hdr.next_free_page_no = hdr.first_free_page_no;
            hdr.first_free_page_no = rid.page_no;
            page.write_heap_header(&page_hdr);
            self.persist_header(&hdr)?;
        } else {
            page.write_heap_header(&page_hdr);
        }
        Ok(())
    }

    /// Overwrites the record at `rid` in place. Records are fixed-width, so
    /// no relocation ever happens.
    pub fn update(&self, rid: Rid, buf: &[u8]) -> Result<(), StorageError> {
        let hdr = self.hdr.lock().unwrap();
        Self::validate_record(&hdr, buf)?;
        Self::validate_rid(&hdr, rid)?;

        let guard = self.fetch_record_page(rid.page_no)?;
        let mut page = guard.write();
        if !bitmap::is_set(page.heap_bitmap(&hdr), rid.slot_no as usize) {
            return Err(StorageError::RecordNotFound(rid));
        }
        page.heap_slot_mut(&hdr, rid.slot_no).copy_from_slice(buf);
        Ok(())
    }

    /// Allocates a fresh all-free page and pushes it onto the freelist head.
    fn create_free_page(&self, hdr: &mut HeapFileHeader) -> Result<PageNo, StorageError> {
        let guard = self.bpm.new_page(self.file_id)?;
        let page_no = guard.page_id().page_no;
        let mut page = guard.write();

        page.write_heap_header(&HeapPageHeader {
            num_records: 0,
            next_free_page_no: hdr.first_free_page_no,
        });
        bitmap::init(page.heap_bitmap_mut(hdr));

        hdr.num_pages += 1;
        hdr.first_free_page_no = page_no;
        self.persist_header(hdr)?;
        crate::strata_debug_log!(
            "[HeapFile::create_free_page] file {} new page {page_no}",
            self.file_id
        );
        Ok(page_no)
    }

    /// A forward scan over all occupied slots in `(page_no, slot_no)` order.
    pub fn scan(self: &Arc<Self>) -> Result<HeapScan, StorageError> {
        HeapScan::new(Arc::clone(self))
    }
}

/// Iterates over the Rids of a heap file, skipping free slots.
pub struct HeapScan {
    file: Arc<HeapFile>,
    rid: Rid,
}

impl HeapScan {
    fn new(file: Arc<HeapFile>) -> Result<Self, StorageError> {
        let mut scan = Self {
            file,
            rid: Rid {
                page_no: NO_PAGE,
                slot_no: 0,
            },
        };
        scan.next()?;
        Ok(scan)
    }

    /// Advances to the next occupied slot, saturating at the end of file.
    pub fn next(&mut self) -> Result<(), StorageError> {
        if self.is_end() {
            return Ok(());
        }

        let hdr = self.file.header();
        let (start_page, start_slot) = if self.rid.page_no == NO_PAGE {
            (HEAP_FIRST_RECORD_PAGE, 0)
        } else {
            (self.rid.page_no, self.rid.slot_no + 1)
        };

        for page_no in start_page..hdr.num_pages {
            let guard = self.file.fetch_record_page(page_no)?;
            let page = guard.read();
            let from = if page_no == start_page { start_slot } else { 0 };
            let slot_no = bitmap::next_set(
                page.heap_bitmap(&hdr),
                hdr.records_per_page as usize,
                from as usize,
            );
            if slot_no < hdr.records_per_page as usize {
                self.rid = Rid {
                    page_no,
                    slot_no: slot_no as u32,
                };
                return Ok(());
            }
        }

        self.rid = Rid {
            page_no: hdr.num_pages,
            slot_no: 0,
        };
        Ok(())
    }

    pub fn is_end(&self) -> bool {
        self.rid.page_no != NO_PAGE && self.rid.page_no >= self.file.header().num_pages
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}
