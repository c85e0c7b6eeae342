//! Sequential and index scans. Both take `IS` on the table and `S` on every
//! record they return; the index scan additionally takes a shared gap lock
//! on the file's key space to keep phantoms out of repeated reads.

use std::sync::Arc;

use strata::Rid;
use strata::btree::{ColType, Iid, IndexScan};
use strata::errors::StorageError;
use strata::heap::HeapScan;

use super::{Context, Executor, ensure_locked};
use crate::catalog::TableInfo;
use crate::errors::ExecutionError;
use crate::types::{CompOp, Condition, ColumnMeta, Rhs, Value, encode_tuple, eval_conditions};

pub struct SeqScanExecutor<'a> {
    ctx: Context<'a>,
    table: Arc<TableInfo>,
    conds: Vec<Condition>,
    scan: Option<HeapScan>,
    rid: Rid,
}

impl<'a> SeqScanExecutor<'a> {
    pub fn new(ctx: Context<'a>, table: Arc<TableInfo>, conds: Vec<Condition>) -> Self {
        Self {
            ctx,
            table,
            conds,
            scan: None,
            rid: Rid {
                page_no: 0,
                slot_no: 0,
            },
        }
    }

    /// Advances the underlying scan to the next row passing every condition
    /// and S-locks it.
    fn settle(&mut self) -> Result<(), ExecutionError> {
        let Some(scan) = self.scan.as_mut() else {
            return Ok(());
        };
        while !scan.is_end() {
            let rid = scan.rid();
            match self.table.heap.get(rid) {
                Ok(tuple) => {
                    if eval_conditions(&self.conds, &tuple, &self.table.columns)? {
                        ensure_locked(self.ctx.lm.lock_shared_on_record(
                            self.ctx.txn,
                            rid,
                            self.table.heap.file_id(),
                        )?)?;
                        self.rid = rid;
                        return Ok(());
                    }
                }
                // The slot was freed between positioning and reading.
                Err(StorageError::RecordNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl<'a> Executor for SeqScanExecutor<'a> {
    fn schema(&self) -> &[ColumnMeta] {
        &self.table.columns
    }

    fn tuple_len(&self) -> usize {
        self.table.record_size
    }

    fn begin(&mut self) -> Result<(), ExecutionError> {
        ensure_locked(
            self.ctx
                .lm
                .lock_is_on_table(self.ctx.txn, self.table.heap.file_id())?,
        )?;
        self.scan = Some(self.table.heap.scan()?);
        self.settle()
    }

    fn next(&mut self) -> Result<(), ExecutionError> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.settle()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn current(&mut self) -> Result<Option<Vec<u8>>, ExecutionError> {
        if self.is_end() {
            return Ok(None);
        }
        Ok(Some(self.table.heap.get(self.rid)?))
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}

pub struct IndexScanExecutor<'a> {
    ctx: Context<'a>,
    table: Arc<TableInfo>,
    /// Position of the chosen index in `table.indexes`.
    index_pos: usize,
    conds: Vec<Condition>,
    scan: Option<IndexScan>,
    rid: Rid,
}

impl<'a> IndexScanExecutor<'a> {
    pub fn new(
        ctx: Context<'a>,
        table: Arc<TableInfo>,
        index_pos: usize,
        conds: Vec<Condition>,
    ) -> Self {
        Self {
            ctx,
            table,
            index_pos,
            conds,
            scan: None,
            rid: Rid {
                page_no: 0,
                slot_no: 0,
            },
        }
    }

    /// Constant Eq values for a prefix of the index columns, used for an
    /// equality probe when the whole key is pinned down.
    fn eq_key_values(&self) -> Vec<Value> {
        let handle = &self.table.indexes[self.index_pos];
        let mut values = Vec::new();
        for col in &handle.meta.columns {
            let found = self.conds.iter().find_map(|cond| match (&cond.rhs, cond.op) {
                (Rhs::Const(value), CompOp::Eq) if cond.column == col.name => {
                    Some(value.clone())
                }
                _ => None,
            });
            match found {
                Some(value) => values.push(value),
                None => break,
            }
        }
        values
    }

    /// Picks the leaf range to walk and the key interval to gap-lock. The
    /// gap bounds only describe intent; the lock itself covers the file's
    /// whole key space.
    fn plan_range(&self) -> Result<(Iid, Iid, (i32, i32)), ExecutionError> {
        let handle = &self.table.indexes[self.index_pos];
        let index = &handle.btree;
        let key_cols = &handle.meta.columns;

        let eq_values = self.eq_key_values();
        if eq_values.len() == key_cols.len() {
            let key = encode_tuple(&eq_values, key_cols)?;
            let begin = index.lower_bound(&key)?;
            let end = index.upper_bound(&key)?;
            let bounds = match eq_values.first() {
                Some(Value::Int(k)) if key_cols.len() == 1 => (*k, *k),
                _ => (i32::MIN, i32::MAX),
            };
            return Ok((begin, end, bounds));
        }

        // Single-column integer indexes also serve range predicates.
        if key_cols.len() == 1 && key_cols[0].ctype == ColType::Int {
            let col_name = &key_cols[0].name;
            let range_cond = self.conds.iter().find_map(|cond| {
                match (&cond.rhs, cond.op) {
                    (Rhs::Const(Value::Int(k)), CompOp::Gt)
                    | (Rhs::Const(Value::Int(k)), CompOp::Ge)
                    | (Rhs::Const(Value::Int(k)), CompOp::Lt)
                    | (Rhs::Const(Value::Int(k)), CompOp::Le)
                        if cond.column == *col_name =>
                    {
                        Some((cond.op, *k))
                    }
                    _ => None,
                }
            });
            if let Some((op, k)) = range_cond {
                let key = encode_tuple(&[Value::Int(k)], key_cols)?;
                let (begin, end, bounds) = match op {
                    CompOp::Gt => (index.upper_bound(&key)?, index.leaf_end()?, (k, i32::MAX)),
                    CompOp::Ge => (index.lower_bound(&key)?, index.leaf_end()?, (k, i32::MAX)),
                    CompOp::Lt => (index.leaf_begin(), index.lower_bound(&key)?, (i32::MIN, k)),
                    CompOp::Le => (index.leaf_begin(), index.upper_bound(&key)?, (i32::MIN, k)),
                    _ => unreachable!(),
                };
                return Ok((begin, end, bounds));
            }
        }

        Ok((
            index.leaf_begin(),
            index.leaf_end()?,
            (i32::MIN, i32::MAX),
        ))
    }

    fn settle(&mut self) -> Result<(), ExecutionError> {
        let Some(scan) = self.scan.as_mut() else {
            return Ok(());
        };
        while !scan.is_end() {
            let rid = scan.rid()?;
            match self.table.heap.get(rid) {
                Ok(tuple) => {
                    if eval_conditions(&self.conds, &tuple, &self.table.columns)? {
                        ensure_locked(self.ctx.lm.lock_shared_on_record(
                            self.ctx.txn,
                            rid,
                            self.table.heap.file_id(),
                        )?)?;
                        self.rid = rid;
                        return Ok(());
                    }
                }
                Err(StorageError::RecordNotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            scan.next()?;
        }
        Ok(())
    }
}

impl<'a> Executor for IndexScanExecutor<'a> {
    fn schema(&self) -> &[ColumnMeta] {
        &self.table.columns
    }

    fn tuple_len(&self) -> usize {
        self.table.record_size
    }

    fn begin(&mut self) -> Result<(), ExecutionError> {
        let table_fd = self.table.heap.file_id();
        ensure_locked(self.ctx.lm.lock_is_on_table(self.ctx.txn, table_fd)?)?;

        let (begin, end, (left, right)) = self.plan_range()?;
        ensure_locked(
            self.ctx
                .lm
                .lock_shared_on_gap(self.ctx.txn, table_fd, left, right)?,
        )?;

        let index = &self.table.indexes[self.index_pos].btree;
        self.scan = Some(index.scan(begin, end));
        self.settle()
    }

    fn next(&mut self) -> Result<(), ExecutionError> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.settle()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn current(&mut self) -> Result<Option<Vec<u8>>, ExecutionError> {
        if self.is_end() {
            return Ok(None);
        }
        Ok(Some(self.table.heap.get(self.rid)?))
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}
