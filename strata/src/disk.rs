//! Page-granular file I/O for the database directory.
//!
//! Every table and index is backed by one file; the disk manager hands out
//! `FileId`s for open files and tracks the next unallocated page number per
//! file. Header pages are written through here directly (synchronously),
//! bypassing the buffer pool.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, create_dir_all};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::{FileId, PAGE_SIZE, Page, PageId, PageNo};

struct FileEntry {
    file: File,
    name: String,
    next_page_no: PageNo,
}

pub struct DiskManager {
    dir: PathBuf,
    files: Mutex<HashMap<FileId, FileEntry>>,
    open_names: Mutex<HashMap<String, FileId>>,
    next_file_id: AtomicU32,
}

impl DiskManager {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)?;
        crate::strata_debug_log!("[DiskManager::new] Database directory: {dir:?}");
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
            open_names: Mutex::new(HashMap::new()),
            next_file_id: AtomicU32::new(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.dir.join(name).exists()
    }

    /// Creates a new, empty file and opens it.
    pub fn create_file(&self, name: &str) -> io::Result<FileId> {
        let path = self.dir.join(name);
        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file {name} already exists"),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(self.register(name, file, 0))
    }

    /// Opens an existing file. Re-opening an already open file returns the
    /// same `FileId`.
    pub fn open_file(&self, name: &str) -> io::Result<FileId> {
        if let Some(&file_id) = self.open_names.lock().unwrap().get(name) {
            return Ok(file_id);
        }
        let path = self.dir.join(name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();
        let next_page_no = (file_size / PAGE_SIZE as u64) as PageNo;
        Ok(self.register(name, file, next_page_no))
    }

    /// Closes the file and removes it from the directory.
    pub fn remove_file(&self, name: &str) -> io::Result<()> {
        if let Some(file_id) = self.open_names.lock().unwrap().remove(name) {
            self.files.lock().unwrap().remove(&file_id);
        }
        fs::remove_file(self.dir.join(name))
    }

    fn register(&self, name: &str, file: File, next_page_no: PageNo) -> FileId {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().insert(
            file_id,
            FileEntry {
                file,
                name: name.to_string(),
                next_page_no,
            },
        );
        self.open_names
            .lock()
            .unwrap()
            .insert(name.to_string(), file_id);
        crate::strata_debug_log!("[DiskManager] Opened {name} as file_id {file_id}");
        file_id
    }

    fn unknown_file(file_id: FileId) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("file_id {file_id} is not open"),
        )
    }

    pub fn read_page(&self, page_id: PageId) -> io::Result<Page> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(&page_id.file_id)
            .ok_or_else(|| Self::unknown_file(page_id.file_id))?;

        let mut page = Page::new(page_id);
        let offset = page_id.page_no as u64 * PAGE_SIZE as u64;
        entry.file.seek(SeekFrom::Start(offset))?;

        // Reads past the current end of file return a zeroed page; callers
        // that just allocated the page number see a fresh page.
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = entry.file.read(&mut page.data[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(page)
    }

    pub fn write_page(&self, page: &Page) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(&page.id.file_id)
            .ok_or_else(|| Self::unknown_file(page.id.file_id))?;

        let offset = page.id.page_no as u64 * PAGE_SIZE as u64;
        entry.file.seek(SeekFrom::Start(offset))?;
        entry.file.write_all(&page.data)?;
        entry.file.sync_all()?;
        if page.id.page_no >= entry.next_page_no {
            entry.next_page_no = page.id.page_no + 1;
        }
        Ok(())
    }

    /// Hands out the next unallocated page number of the file.
    pub fn allocate_page_no(&self, file_id: FileId) -> io::Result<PageNo> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(&file_id)
            .ok_or_else(|| Self::unknown_file(file_id))?;
        let page_no = entry.next_page_no;
        entry.next_page_no += 1;
        Ok(page_no)
    }

    pub fn next_page_no(&self, file_id: FileId) -> io::Result<PageNo> {
        let files = self.files.lock().unwrap();
        let entry = files
            .get(&file_id)
            .ok_or_else(|| Self::unknown_file(file_id))?;
        Ok(entry.next_page_no)
    }

    /// Resets the allocation high-water mark, used by file handles that
    /// persist their own page count in a header.
    pub fn set_next_page_no(&self, file_id: FileId, next: PageNo) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(&file_id)
            .ok_or_else(|| Self::unknown_file(file_id))?;
        entry.next_page_no = next;
        Ok(())
    }

    pub fn file_name(&self, file_id: FileId) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&file_id)
            .map(|e| e.name.clone())
    }
}
