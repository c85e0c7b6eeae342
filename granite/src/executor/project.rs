//! Column projection over a child executor.

use strata::Rid;

use super::Executor;
use crate::errors::ExecutionError;
use crate::types::{ColumnMeta, record_size};

pub struct ProjectionExecutor<'a> {
    child: Box<dyn Executor + 'a>,
    /// The selected columns as they sit in the child's tuples.
    src_cols: Vec<ColumnMeta>,
    /// The output schema, re-laid-out from offset 0.
    schema: Vec<ColumnMeta>,
}

impl<'a> ProjectionExecutor<'a> {
    pub fn new(
        child: Box<dyn Executor + 'a>,
        col_names: &[&str],
    ) -> Result<Self, ExecutionError> {
        let mut src_cols = Vec::with_capacity(col_names.len());
        for name in col_names {
            let col = child
                .schema()
                .iter()
                .find(|c| c.name == *name)
                .cloned()
                .ok_or_else(|| ExecutionError::ColumnNotFound(name.to_string()))?;
            src_cols.push(col);
        }

        let mut offset = 0;
        let schema = src_cols
            .iter()
            .map(|col| {
                let out = ColumnMeta {
                    name: col.name.clone(),
                    ctype: col.ctype,
                    len: col.len,
                    offset,
                };
                offset += col.len;
                out
            })
            .collect();

        Ok(Self {
            child,
            src_cols,
            schema,
        })
    }
}

impl<'a> Executor for ProjectionExecutor<'a> {
    fn schema(&self) -> &[ColumnMeta] {
        &self.schema
    }

    fn tuple_len(&self) -> usize {
        record_size(&self.schema)
    }

    fn begin(&mut self) -> Result<(), ExecutionError> {
        self.child.begin()
    }

    fn next(&mut self) -> Result<(), ExecutionError> {
        self.child.next()
    }

    fn is_end(&self) -> bool {
        self.child.is_end()
    }

    fn current(&mut self) -> Result<Option<Vec<u8>>, ExecutionError> {
        let Some(tuple) = self.child.current()? else {
            return Ok(None);
        };
        let mut projected = Vec::with_capacity(self.tuple_len());
        for col in &self.src_cols {
            projected.extend_from_slice(&tuple[col.offset..col.offset + col.len]);
        }
        Ok(Some(projected))
    }

    fn rid(&self) -> Rid {
        self.child.rid()
    }
}
