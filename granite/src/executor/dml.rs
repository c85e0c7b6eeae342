//! Insert, delete, and update: the data-changing operations. Each one takes
//! its locks first, appends an undo record to the transaction before the
//! change, and only then touches heap and index state.

use std::sync::Arc;

use strata::Rid;
use strata::btree::ColType;
use strata::transaction::{IndexOp, IndexWriteRecord, WriteRecord, WriteType};

use super::scan::SeqScanExecutor;
use super::{Context, collect_rows, ensure_locked};
use crate::catalog::{IndexHandle, TableInfo};
use crate::errors::ExecutionError;
use crate::types::{Condition, Value, decode_tuple, encode_tuple, index_key};

/// True for the indexes whose key space is guarded by gap locks: single
/// integer columns, the only shape the range-scan planner produces.
fn gap_lockable(handle: &IndexHandle) -> bool {
    handle.meta.columns.len() == 1 && handle.meta.columns[0].ctype == ColType::Int
}

fn gap_key(handle: &IndexHandle, key: &[u8]) -> Option<i32> {
    if !gap_lockable(handle) {
        return None;
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&key[0..4]);
    Some(i32::from_ne_bytes(bytes))
}

/// Inserts one row. Returns its Rid.
pub fn execute_insert(
    ctx: Context<'_>,
    table: &Arc<TableInfo>,
    values: &[Value],
) -> Result<Rid, ExecutionError> {
    let table_fd = table.heap.file_id();
    ensure_locked(ctx.lm.lock_ix_on_table(ctx.txn, table_fd)?)?;

    let tuple = encode_tuple(values, &table.columns)?;
    let rid = table.heap.insert(&tuple)?;

    // The undo record must exist before any index is touched: if an index
    // insert aborts the statement, rollback already covers the heap insert.
    ctx.txn.append_write_record(WriteRecord::new(
        WriteType::Insert,
        table_fd,
        rid,
        tuple.clone(),
    ));

    for handle in &table.indexes {
        let key = index_key(&tuple, &handle.meta.columns);
        if let Some(k) = gap_key(handle, &key) {
            // The new key lands in some scanned gap; writers must collide
            // with any reader holding the range.
            ensure_locked(ctx.lm.lock_exclusive_on_gap(ctx.txn, table_fd, k, k)?)?;
        }
        if !handle.btree.insert(&key, rid)? {
            return Err(ExecutionError::DuplicateKey(handle.meta.name.clone()));
        }
        ctx.txn.append_index_op(IndexWriteRecord {
            index: Arc::clone(&handle.btree),
            key,
            rid,
            op: IndexOp::Insert,
        });
    }
    Ok(rid)
}

/// Deletes every row matching `conds`. Returns the number of rows removed.
pub fn execute_delete(
    ctx: Context<'_>,
    table: &Arc<TableInfo>,
    conds: &[Condition],
) -> Result<usize, ExecutionError> {
    let table_fd = table.heap.file_id();
    ensure_locked(ctx.lm.lock_ix_on_table(ctx.txn, table_fd)?)?;

    let rows = {
        let mut scan = SeqScanExecutor::new(ctx, Arc::clone(table), conds.to_vec());
        collect_rows(&mut scan)?
    };

    for (rid, _) in &rows {
        let rid = *rid;
        ensure_locked(ctx.lm.lock_exclusive_on_record(ctx.txn, rid, table_fd)?)?;
        let tuple = table.heap.get(rid)?;

        ctx.txn.append_write_record(WriteRecord::new(
            WriteType::Delete,
            table_fd,
            rid,
            tuple.clone(),
        ));

        for handle in &table.indexes {
            let key = index_key(&tuple, &handle.meta.columns);
            if let Some(k) = gap_key(handle, &key) {
                ensure_locked(ctx.lm.lock_exclusive_on_gap(ctx.txn, table_fd, k, k)?)?;
            }
            handle.btree.delete(&key)?;
            ctx.txn.append_index_op(IndexWriteRecord {
                index: Arc::clone(&handle.btree),
                key,
                rid,
                op: IndexOp::Delete,
            });
        }

        table.heap.delete(rid)?;
    }
    Ok(rows.len())
}

/// Applies `assignments` to every row matching `conds`. Returns the number
/// of rows changed.
pub fn execute_update(
    ctx: Context<'_>,
    table: &Arc<TableInfo>,
    conds: &[Condition],
    assignments: &[(String, Value)],
) -> Result<usize, ExecutionError> {
    let table_fd = table.heap.file_id();
    ensure_locked(ctx.lm.lock_ix_on_table(ctx.txn, table_fd)?)?;

    let rows = {
        let mut scan = SeqScanExecutor::new(ctx, Arc::clone(table), conds.to_vec());
        collect_rows(&mut scan)?
    };

    let mut changed = 0;
    for (rid, _) in &rows {
        let rid = *rid;
        ensure_locked(ctx.lm.lock_exclusive_on_record(ctx.txn, rid, table_fd)?)?;
        let old_tuple = table.heap.get(rid)?;

        let mut row = decode_tuple(&old_tuple, &table.columns);
        for (col_name, value) in assignments {
            let pos = table
                .columns
                .iter()
                .position(|c| &c.name == col_name)
                .ok_or_else(|| ExecutionError::ColumnNotFound(col_name.clone()))?;
            row[pos] = value.clone();
        }
        let new_tuple = encode_tuple(&row, &table.columns)?;
        if new_tuple == old_tuple {
            continue;
        }

        ctx.txn.append_write_record(WriteRecord::new(
            WriteType::Update,
            table_fd,
            rid,
            old_tuple.clone(),
        ));

        for handle in &table.indexes {
            let old_key = index_key(&old_tuple, &handle.meta.columns);
            let new_key = index_key(&new_tuple, &handle.meta.columns);
            if old_key == new_key {
                continue;
            }

            if let Some(k) = gap_key(handle, &old_key) {
                ensure_locked(ctx.lm.lock_exclusive_on_gap(ctx.txn, table_fd, k, k)?)?;
            }
            if let Some(k) = gap_key(handle, &new_key) {
                ensure_locked(ctx.lm.lock_exclusive_on_gap(ctx.txn, table_fd, k, k)?)?;
            }

            handle.btree.delete(&old_key)?;
            ctx.txn.append_index_op(IndexWriteRecord {
                index: Arc::clone(&handle.btree),
                key: old_key,
                rid,
                op: IndexOp::Delete,
            });

            if !handle.btree.insert(&new_key, rid)? {
                return Err(ExecutionError::DuplicateKey(handle.meta.name.clone()));
            }
            ctx.txn.append_index_op(IndexWriteRecord {
                index: Arc::clone(&handle.btree),
                key: new_key,
                rid,
                op: IndexOp::Insert,
            });
        }

        table.heap.update(rid, &new_tuple)?;
        changed += 1;
    }
    Ok(changed)
}
