//! Nested-loop join: for every outer row, the inner executor is restarted
//! and walked in full.

use strata::Rid;

use super::Executor;
use crate::errors::ExecutionError;
use crate::types::{ColumnMeta, Condition, eval_conditions, record_size};

pub struct NestedLoopJoinExecutor<'a> {
    left: Box<dyn Executor + 'a>,
    right: Box<dyn Executor + 'a>,
    conds: Vec<Condition>,
    /// Left schema followed by the right schema, offsets shifted.
    schema: Vec<ColumnMeta>,
    left_tuple: Option<Vec<u8>>,
    current: Option<Vec<u8>>,
}

impl<'a> NestedLoopJoinExecutor<'a> {
    pub fn new(
        left: Box<dyn Executor + 'a>,
        right: Box<dyn Executor + 'a>,
        conds: Vec<Condition>,
    ) -> Self {
        let left_len = record_size(left.schema());
        let mut schema: Vec<ColumnMeta> = left.schema().to_vec();
        schema.extend(right.schema().iter().map(|col| ColumnMeta {
            name: col.name.clone(),
            ctype: col.ctype,
            len: col.len,
            offset: col.offset + left_len,
        }));
        Self {
            left,
            right,
            conds,
            schema,
            left_tuple: None,
            current: None,
        }
    }

    /// Walks the inner executor (restarting it as outer rows advance) until
    /// a combined row satisfies the join conditions.
    fn settle(&mut self) -> Result<(), ExecutionError> {
        loop {
            let Some(left_tuple) = self.left_tuple.clone() else {
                self.current = None;
                return Ok(());
            };

            while !self.right.is_end() {
                if let Some(right_tuple) = self.right.current()? {
                    let mut combined = left_tuple.clone();
                    combined.extend_from_slice(&right_tuple);
                    if eval_conditions(&self.conds, &combined, &self.schema)? {
                        self.current = Some(combined);
                        return Ok(());
                    }
                }
                self.right.next()?;
            }

            self.left.next()?;
            self.left_tuple = if self.left.is_end() {
                None
            } else {
                self.left.current()?
            };
            if self.left_tuple.is_some() {
                self.right.begin()?;
            }
        }
    }
}

impl<'a> Executor for NestedLoopJoinExecutor<'a> {
    fn schema(&self) -> &[ColumnMeta] {
        &self.schema
    }

    fn tuple_len(&self) -> usize {
        record_size(&self.schema)
    }

    fn begin(&mut self) -> Result<(), ExecutionError> {
        self.left.begin()?;
        self.left_tuple = if self.left.is_end() {
            None
        } else {
            self.left.current()?
        };
        if self.left_tuple.is_some() {
            self.right.begin()?;
        }
        self.settle()
    }

    fn next(&mut self) -> Result<(), ExecutionError> {
        if self.current.is_none() {
            return Ok(());
        }
        self.right.next()?;
        self.settle()
    }

    fn is_end(&self) -> bool {
        self.current.is_none()
    }

    fn current(&mut self) -> Result<Option<Vec<u8>>, ExecutionError> {
        Ok(self.current.clone())
    }

    fn rid(&self) -> Rid {
        self.left.rid()
    }
}
