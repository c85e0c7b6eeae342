//! # Granite
//! A small relational database built on the `strata` storage engine:
//! catalog, typed tuples, and the executor layer that turns row operations
//! into serializable transactions. The SQL front end and network protocol
//! live outside this crate; everything here is driven through the
//! [`Database`] handle.

use std::path::Path;
use std::sync::Arc;

use strata::buffer_pool::BufferPoolManager;
use strata::disk::DiskManager;
use strata::lock_manager::LockManager;
use strata::transaction::{Transaction, TransactionManager};

pub mod catalog;
pub mod errors;
pub mod executor;
pub mod types;

use catalog::Catalog;
use errors::ExecutionError;
use executor::Context;

pub fn debug_logs_enabled() -> bool {
    std::env::var_os("GRANITE_DEBUG_LOG").is_some()
}

#[macro_export]
macro_rules! granite_debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_logs_enabled() {
            println!($($arg)*);
        }
    };
}

/// The top-level database handle. Owns every process-wide resource: the
/// disk manager, buffer pool, lock table, transaction registry, and catalog.
pub struct Database {
    pub disk: Arc<DiskManager>,
    pub bpm: Arc<BufferPoolManager>,
    pub lm: Arc<LockManager>,
    pub tm: Arc<TransactionManager>,
    pub catalog: Catalog,
}

impl Database {
    /// Opens (or creates) a database rooted at `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, ExecutionError> {
        let disk = Arc::new(DiskManager::new(dir).map_err(strata::errors::StorageError::Io)?);
        let bpm = Arc::new(BufferPoolManager::new(Arc::clone(&disk)));
        let lm = Arc::new(LockManager::new());
        let tm = Arc::new(TransactionManager::new(Arc::clone(&lm)));
        let catalog = Catalog::new(Arc::clone(&disk), Arc::clone(&bpm), Arc::clone(&tm));
        catalog.load()?;

        Ok(Self {
            disk,
            bpm,
            lm,
            tm,
            catalog,
        })
    }

    pub fn begin(&self) -> Arc<Transaction> {
        self.tm.begin()
    }

    /// Commits `txn` and flushes the buffer pool so its effects are durable.
    pub fn commit(&self, txn: &Transaction) -> Result<(), ExecutionError> {
        self.tm.commit(txn)?;
        self.bpm.flush_all_pages()?;
        Ok(())
    }

    /// Rolls `txn` back.
    pub fn abort(&self, txn: &Transaction) -> Result<(), ExecutionError> {
        self.tm.abort(txn)?;
        Ok(())
    }

    /// The per-statement context executors run under.
    pub fn context<'a>(&'a self, txn: &'a Transaction) -> Context<'a> {
        Context { txn, lm: &self.lm }
    }
}
