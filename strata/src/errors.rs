use crate::{FileId, PageNo, Rid, TxnId};
use std::io;

/// Errors raised by the storage layer. Structural variants are recoverable
/// by the caller; `CorruptHeader`, `CorruptIndex` and `Io` are fatal.
#[derive(Debug)]
pub enum StorageError {
    InvalidPage(PageNo),
    InvalidSlot(u32),
    RecordNotFound(Rid),
    SlotOccupied(Rid),
    RecordSizeMismatch { expected: usize, got: usize },
    RecordTooLarge(usize),
    PageAllocation,
    CorruptHeader(FileId),
    CorruptIndex(PageNo),
    TransactionFinished(TxnId),
    FileExists(String),
    FileNotFound(String),
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
