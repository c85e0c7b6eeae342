//! The page type shared by every storage component, plus the checksummed
//! framing used for file header pages.

use crate::errors::StorageError;
use crate::{PAGE_SIZE, PageId};
use crc32fast::Hasher;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;

/// An in-memory copy of one on-disk page.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Page {
            id,
            data: [0; PAGE_SIZE],
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.data[offset..offset + len]
    }
}

// Header pages are framed as [crc: u32][len: u32][bincode payload] so a torn
// or stale header read is detected on open instead of surfacing later as an
// inexplicable structural error.
const HEADER_FRAME_LEN: usize = 8;

pub fn encode_header<T: Serialize>(page: &mut Page, header: &T) -> Result<(), StorageError> {
    let payload = bincode::serialize(header)
        .map_err(|e| StorageError::Io(io::Error::other(format!("header encode: {e}"))))?;
    if payload.len() + HEADER_FRAME_LEN > PAGE_SIZE {
        return Err(StorageError::Io(io::Error::other("header too large")));
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    page.data[0..4].copy_from_slice(&crc.to_le_bytes());
    page.data[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    page.data[HEADER_FRAME_LEN..HEADER_FRAME_LEN + payload.len()].copy_from_slice(&payload);
    Ok(())
}

pub fn decode_header<T: DeserializeOwned>(page: &Page) -> Result<T, StorageError> {
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&page.data[0..4]);
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&page.data[4..8]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len + HEADER_FRAME_LEN > PAGE_SIZE {
        return Err(StorageError::CorruptHeader(page.id.file_id));
    }

    let payload = &page.data[HEADER_FRAME_LEN..HEADER_FRAME_LEN + len];
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != expected_crc {
        return Err(StorageError::CorruptHeader(page.id.file_id));
    }

    bincode::deserialize(payload).map_err(|_| StorageError::CorruptHeader(page.id.file_id))
}
