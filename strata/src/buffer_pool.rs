//! Manages the buffer pool, a collection of in-memory frames that cache disk pages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::disk::DiskManager;
use crate::errors::StorageError;
use crate::{FileId, Page, PageId};

const BUFFER_POOL_SIZE: usize = 256;

/// A single frame in the buffer pool.
#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    is_dirty: Mutex<bool>,
    pin_count: Mutex<u32>,
    recently_used: Mutex<bool>,
}

/// The buffer pool manager.
pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    frames: Vec<Arc<Frame>>,
    page_table: RwLock<HashMap<PageId, usize>>,
    free_list: Mutex<Vec<usize>>,
    clock_hand: Mutex<usize>,
}

/// An RAII guard for a pinned page. Dropping the guard unpins the page.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame: Arc<Frame>,
}

impl<'a> PageGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, Page> {
        self.frame.page.read().unwrap()
    }

    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, Page> {
        *self.frame.is_dirty.lock().unwrap() = true;
        self.frame.page.write().unwrap()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.bpm.unpin_page(self.page_id);
    }
}

impl BufferPoolManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(BUFFER_POOL_SIZE);
        let mut free_list = Vec::with_capacity(BUFFER_POOL_SIZE);
        for i in 0..BUFFER_POOL_SIZE {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(PageId {
                    file_id: 0,
                    page_no: 0,
                })),
                is_dirty: Mutex::new(false),
                pin_count: Mutex::new(0),
                recently_used: Mutex::new(false),
            }));
            free_list.push(i);
        }
        Self {
            disk,
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            clock_hand: Mutex::new(0),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Pins the page, reading it from disk if it is not cached.
    pub fn acquire_page(&self, page_id: PageId) -> Result<PageGuard<'_>, StorageError> {
        // 1. Check if the page is already in the buffer pool.
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&page_id) {
            let frame = self.frames[frame_index].clone();
            self.pin_frame(&frame);
            return Ok(PageGuard {
                bpm: self,
                page_id,
                frame,
            });
        }

        // 2. If not, find a free frame or evict one.
        let frame_index = self
            .find_victim_frame()?
            .ok_or(StorageError::PageAllocation)?;
        let frame = self.frames[frame_index].clone();

        // 3. Read the new page from disk.
        let new_page = self.disk.read_page(page_id)?;

        // 4. Update frame content and metadata.
        {
            let mut page = frame.page.write().unwrap();
            *page = new_page;
            *frame.is_dirty.lock().unwrap() = false;
            self.pin_frame(&frame);
        }

        // 5. Update the page table.
        self.page_table
            .write()
            .unwrap()
            .insert(page_id, frame_index);
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame,
        })
    }

    /// Allocates a fresh page number in the file and pins a zeroed page for it.
    pub fn new_page(&self, file_id: FileId) -> Result<PageGuard<'_>, StorageError> {
        // 1. Find a free frame or evict one.
        let frame_index = self
            .find_victim_frame()?
            .ok_or(StorageError::PageAllocation)?;
        let frame = self.frames[frame_index].clone();

        // 2. Allocate a new page number on disk.
        let page_no = self.disk.allocate_page_no(file_id)?;
        let page_id = PageId { file_id, page_no };

        // 3. Update frame content and metadata.
        {
            let mut page = frame.page.write().unwrap();
            *page = Page::new(page_id);
            *frame.is_dirty.lock().unwrap() = true;
            self.pin_frame(&frame);
        }

        // 4. Update the page table.
        self.page_table
            .write()
            .unwrap()
            .insert(page_id, frame_index);
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame,
        })
    }

    fn pin_frame(&self, frame: &Arc<Frame>) {
        let mut pin_count = frame.pin_count.lock().unwrap();
        *pin_count += 1;
        *frame.recently_used.lock().unwrap() = true;
    }

    fn unpin_page(&self, page_id: PageId) {
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&page_id) {
            let frame = &self.frames[frame_index];
            let mut pin_count = frame.pin_count.lock().unwrap();
            if *pin_count > 0 {
                *pin_count -= 1;
            }
        }
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<(), StorageError> {
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&page_id) {
            let frame = &self.frames[frame_index];
            let mut is_dirty = frame.is_dirty.lock().unwrap();
            if *is_dirty {
                let page = frame.page.read().unwrap();
                self.disk.write_page(&page)?;
                *is_dirty = false;
            }
        }
        Ok(())
    }

    pub fn flush_all_pages(&self) -> Result<(), StorageError> {
        let page_ids: Vec<PageId> = self.page_table.read().unwrap().keys().copied().collect();
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops a page from the cache without writing it back. Used for pages
    /// the index has logically freed.
    pub fn discard_page(&self, page_id: PageId) {
        if let Some(frame_index) = self.page_table.write().unwrap().remove(&page_id) {
            let frame = &self.frames[frame_index];
            *frame.is_dirty.lock().unwrap() = false;
            *frame.pin_count.lock().unwrap() = 0;
            *frame.recently_used.lock().unwrap() = false;
            self.free_list.lock().unwrap().push(frame_index);
        }
    }

    /// Drops every cached page of the file, writing dirty ones back first.
    pub fn evict_file(&self, file_id: FileId) -> Result<(), StorageError> {
        let page_ids: Vec<PageId> = self
            .page_table
            .read()
            .unwrap()
            .keys()
            .filter(|id| id.file_id == file_id)
            .copied()
            .collect();
        for page_id in page_ids {
            self.flush_page(page_id)?;
            self.discard_page(page_id);
        }
        Ok(())
    }

    fn find_victim_frame(&self) -> Result<Option<usize>, StorageError> {
        if let Some(frame_index) = self.free_list.lock().unwrap().pop() {
            return Ok(Some(frame_index));
        }

        let frame_count = self.frames.len();
        if frame_count == 0 {
            return Ok(None);
        }

        let mut clock_hand = self.clock_hand.lock().unwrap();
        // Two full passes: the first pass can clear second-chance bits, the
        // second can pick a victim.
        for _ in 0..(frame_count * 2) {
            let frame_index = *clock_hand;
            *clock_hand = (*clock_hand + 1) % frame_count;

            let frame = &self.frames[frame_index];
            let pin_count = frame.pin_count.lock().unwrap();

            if *pin_count == 0 {
                let mut recently_used = frame.recently_used.lock().unwrap();
                if *recently_used {
                    *recently_used = false;
                } else {
                    drop(recently_used);
                    drop(pin_count);
                    self.evict_frame(frame_index)?;
                    return Ok(Some(frame_index));
                }
            }
        }

        // All frames are pinned.
        Ok(None)
    }

    fn evict_frame(&self, frame_index: usize) -> Result<(), StorageError> {
        let frame = &self.frames[frame_index];
        let mut page_table = self.page_table.write().unwrap();
        let old_page_id = page_table
            .iter()
            .find(|&(_, &idx)| idx == frame_index)
            .map(|(&id, _)| id);
        if let Some(old_page_id) = old_page_id {
            let mut is_dirty = frame.is_dirty.lock().unwrap();
            if *is_dirty {
                let page = frame.page.read().unwrap();
                self.disk.write_page(&page)?;
                *is_dirty = false;
            }
            page_table.remove(&old_page_id);
        }
        Ok(())
    }

    #[cfg(test)]
    fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        self.page_table
            .read()
            .unwrap()
            .get(&page_id)
            .map(|&idx| *self.frames[idx].pin_count.lock().unwrap())
    }
}
