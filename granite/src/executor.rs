//! The executor layer: volcano-style iterators over tables plus the
//! data-changing operations, all speaking the per-row lock/undo protocol.

use strata::Rid;
use strata::lock_manager::LockManager;
use strata::transaction::Transaction;

use crate::errors::ExecutionError;
use crate::types::ColumnMeta;

pub mod dml;
pub mod join;
pub mod project;
pub mod scan;

pub use dml::{execute_delete, execute_insert, execute_update};
pub use join::NestedLoopJoinExecutor;
pub use project::ProjectionExecutor;
pub use scan::{IndexScanExecutor, SeqScanExecutor};

/// Per-statement handles threaded through every executor.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub txn: &'a Transaction,
    pub lm: &'a LockManager,
}

/// The capability set every row iterator exposes. `begin` positions the
/// iterator on its first row; `current` materializes the row the iterator
/// is positioned on.
pub trait Executor {
    fn schema(&self) -> &[ColumnMeta];
    fn tuple_len(&self) -> usize;
    fn begin(&mut self) -> Result<(), ExecutionError>;
    fn next(&mut self) -> Result<(), ExecutionError>;
    fn is_end(&self) -> bool;
    fn current(&mut self) -> Result<Option<Vec<u8>>, ExecutionError>;
    fn rid(&self) -> Rid;
}

/// Lock entry points return `false` only for a transaction that has already
/// finished; statements running inside one are a caller bug worth a typed
/// error rather than a silent no-op.
pub(crate) fn ensure_locked(locked: bool) -> Result<(), ExecutionError> {
    if locked {
        Ok(())
    } else {
        Err(ExecutionError::TransactionInactive)
    }
}

/// Drains an executor, collecting every row with its Rid.
pub fn collect_rows(
    executor: &mut dyn Executor,
) -> Result<Vec<(Rid, Vec<u8>)>, ExecutionError> {
    let mut rows = Vec::new();
    executor.begin()?;
    while !executor.is_end() {
        if let Some(tuple) = executor.current()? {
            rows.push((executor.rid(), tuple));
        }
        executor.next()?;
    }
    Ok(rows)
}
