//! Typed values, table schemas, and the fixed-width tuple codec.

use std::cmp::Ordering;

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use strata::btree::ColType;

use crate::errors::ExecutionError;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Str(String),
}

impl Value {
    pub fn col_type(&self) -> ColType {
        match self {
            Value::Int(_) => ColType::Int,
            Value::Float(_) => ColType::Float,
            Value::Str(_) => ColType::Str,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
        }
    }
}

/// One column of a table schema. `offset` is the column's byte position
/// within the fixed-width tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub ctype: ColType,
    pub len: usize,
    pub offset: usize,
}

/// A column as declared at table creation; `len` is only meaningful for
/// `Str` columns.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub ctype: ColType,
    pub len: usize,
}

impl ColumnDef {
    pub fn int(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ctype: ColType::Int,
            len: 4,
        }
    }

    pub fn float(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ctype: ColType::Float,
            len: 4,
        }
    }

    pub fn str(name: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            ctype: ColType::Str,
            len,
        }
    }
}

/// Lays out a schema: assigns byte offsets in declaration order.
pub fn build_schema(defs: &[ColumnDef]) -> Vec<ColumnMeta> {
    let mut offset = 0;
    defs.iter()
        .map(|def| {
            let len = match def.ctype {
                ColType::Int | ColType::Float => 4,
                ColType::Str => def.len,
            };
            let meta = ColumnMeta {
                name: def.name.clone(),
                ctype: def.ctype,
                len,
                offset,
            };
            offset += len;
            meta
        })
        .collect()
}

pub fn record_size(schema: &[ColumnMeta]) -> usize {
    schema.iter().map(|c| c.len).sum()
}

pub fn find_column<'a>(
    schema: &'a [ColumnMeta],
    name: &str,
) -> Result<&'a ColumnMeta, ExecutionError> {
    schema
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| ExecutionError::ColumnNotFound(name.to_string()))
}

/// Encodes a row of values into tuple bytes, checking arity and types.
/// Values are host-endian fixed-width; strings are zero-padded.
pub fn encode_tuple(values: &[Value], schema: &[ColumnMeta]) -> Result<Vec<u8>, ExecutionError> {
    if values.len() != schema.len() {
        return Err(ExecutionError::ArityMismatch {
            expected: schema.len(),
            got: values.len(),
        });
    }

    let mut tuple = Vec::with_capacity(record_size(schema));
    for (value, col) in values.iter().zip(schema) {
        if value.col_type() != col.ctype {
            return Err(ExecutionError::TypeMismatch {
                expected: col.ctype,
                got: value.col_type(),
            });
        }
        match value {
            Value::Int(v) => tuple.put_i32_ne(*v),
            Value::Float(v) => {
                // NaN has no place in a key ordering; reject it up front so
                // the index never stores one.
                if v.is_nan() {
                    return Err(ExecutionError::InvalidValue("NaN".to_string()));
                }
                tuple.put_f32_ne(*v);
            }
            Value::Str(v) => {
                let bytes = v.as_bytes();
                if bytes.len() > col.len {
                    return Err(ExecutionError::InvalidValue(format!(
                        "string longer than column {} ({} > {})",
                        col.name,
                        bytes.len(),
                        col.len
                    )));
                }
                tuple.put_slice(bytes);
                tuple.put_bytes(0, col.len - bytes.len());
            }
        }
    }
    Ok(tuple)
}

/// Decodes one column out of a tuple.
pub fn decode_value(tuple: &[u8], col: &ColumnMeta) -> Value {
    let raw = &tuple[col.offset..col.offset + col.len];
    match col.ctype {
        ColType::Int => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(raw);
            Value::Int(i32::from_ne_bytes(bytes))
        }
        ColType::Float => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(raw);
            Value::Float(f32::from_ne_bytes(bytes))
        }
        ColType::Str => {
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Value::Str(String::from_utf8_lossy(&raw[..end]).to_string())
        }
    }
}

pub fn decode_tuple(tuple: &[u8], schema: &[ColumnMeta]) -> Vec<Value> {
    schema.iter().map(|col| decode_value(tuple, col)).collect()
}

/// Concatenates the raw bytes of the given key columns, yielding the
/// composite index key for a tuple.
pub fn index_key(tuple: &[u8], key_cols: &[ColumnMeta]) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_cols.iter().map(|c| c.len).sum());
    for col in key_cols {
        key.extend_from_slice(&tuple[col.offset..col.offset + col.len]);
    }
    key
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// The right-hand side of a condition: a constant or another column.
#[derive(Debug, Clone)]
pub enum Rhs {
    Const(Value),
    Column(String),
}

/// A simple `column <op> rhs` predicate over one tuple.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: String,
    pub op: CompOp,
    pub rhs: Rhs,
}

impl Condition {
    pub fn eq_const(column: &str, value: Value) -> Self {
        Self {
            column: column.to_string(),
            op: CompOp::Eq,
            rhs: Rhs::Const(value),
        }
    }

    pub fn cmp_const(column: &str, op: CompOp, value: Value) -> Self {
        Self {
            column: column.to_string(),
            op,
            rhs: Rhs::Const(value),
        }
    }

    pub fn eq_columns(left: &str, right: &str) -> Self {
        Self {
            column: left.to_string(),
            op: CompOp::Eq,
            rhs: Rhs::Column(right.to_string()),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Result<Ordering, ExecutionError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => {
            Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal))
        }
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        _ => Err(ExecutionError::TypeMismatch {
            expected: a.col_type(),
            got: b.col_type(),
        }),
    }
}

fn op_holds(op: CompOp, ord: Ordering) -> bool {
    match op {
        CompOp::Eq => ord == Ordering::Equal,
        CompOp::Ne => ord != Ordering::Equal,
        CompOp::Lt => ord == Ordering::Less,
        CompOp::Gt => ord == Ordering::Greater,
        CompOp::Le => ord != Ordering::Greater,
        CompOp::Ge => ord != Ordering::Less,
    }
}

/// Evaluates one condition against a tuple.
pub fn eval_condition(
    cond: &Condition,
    tuple: &[u8],
    schema: &[ColumnMeta],
) -> Result<bool, ExecutionError> {
    let left_col = find_column(schema, &cond.column)?;
    let left = decode_value(tuple, left_col);
    let right = match &cond.rhs {
        Rhs::Const(value) => value.clone(),
        Rhs::Column(name) => decode_value(tuple, find_column(schema, name)?),
    };
    Ok(op_holds(cond.op, compare_values(&left, &right)?))
}

pub fn eval_conditions(
    conds: &[Condition],
    tuple: &[u8],
    schema: &[ColumnMeta],
) -> Result<bool, ExecutionError> {
    for cond in conds {
        if !eval_condition(cond, tuple, schema)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<ColumnMeta> {
        build_schema(&[
            ColumnDef::int("id"),
            ColumnDef::str("name", 8),
            ColumnDef::float("score"),
        ])
    }

    #[test]
    fn test_schema_layout() {
        let schema = schema();
        assert_eq!(schema[0].offset, 0);
        assert_eq!(schema[1].offset, 4);
        assert_eq!(schema[2].offset, 12);
        assert_eq!(record_size(&schema), 16);
    }

    #[test]
    fn test_tuple_roundtrip() {
        let schema = schema();
        let row = vec![
            Value::Int(7),
            Value::Str("ada".to_string()),
            Value::Float(2.5),
        ];
        let tuple = encode_tuple(&row, &schema).unwrap();
        assert_eq!(tuple.len(), 16);
        assert_eq!(decode_tuple(&tuple, &schema), row);
    }

    #[test]
    fn test_encode_rejects_bad_rows() {
        let schema = schema();
        assert!(matches!(
            encode_tuple(&[Value::Int(1)], &schema),
            Err(ExecutionError::ArityMismatch { .. })
        ));
        assert!(matches!(
            encode_tuple(
                &[
                    Value::Str("x".to_string()),
                    Value::Str("y".to_string()),
                    Value::Float(0.0)
                ],
                &schema
            ),
            Err(ExecutionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            encode_tuple(
                &[
                    Value::Int(1),
                    Value::Str("way too long here".to_string()),
                    Value::Float(0.0)
                ],
                &schema
            ),
            Err(ExecutionError::InvalidValue(_))
        ));
        assert!(matches!(
            encode_tuple(
                &[
                    Value::Int(1),
                    Value::Str("ok".to_string()),
                    Value::Float(f32::NAN)
                ],
                &schema
            ),
            Err(ExecutionError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_conditions() {
        let schema = schema();
        let tuple = encode_tuple(
            &[
                Value::Int(5),
                Value::Str("bob".to_string()),
                Value::Float(1.0),
            ],
            &schema,
        )
        .unwrap();

        assert!(eval_condition(
            &Condition::eq_const("id", Value::Int(5)),
            &tuple,
            &schema
        )
        .unwrap());
        assert!(!eval_condition(
            &Condition::cmp_const("id", CompOp::Gt, Value::Int(5)),
            &tuple,
            &schema
        )
        .unwrap());
        assert!(eval_condition(
            &Condition::cmp_const("name", CompOp::Ge, Value::Str("alice".to_string())),
            &tuple,
            &schema
        )
        .unwrap());
        assert!(matches!(
            eval_condition(
                &Condition::eq_const("id", Value::Str("5".to_string())),
                &tuple,
                &schema
            ),
            Err(ExecutionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_index_key_concatenates_columns() {
        let schema = schema();
        let tuple = encode_tuple(
            &[
                Value::Int(9),
                Value::Str("k".to_string()),
                Value::Float(0.0),
            ],
            &schema,
        )
        .unwrap();
        let key = index_key(&tuple, &schema[0..1]);
        assert_eq!(key, 9i32.to_ne_bytes().to_vec());
    }
}
