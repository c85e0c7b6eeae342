//! The metadata catalog: table name to heap file, schema, and index set.
//!
//! The catalog owns the open storage handles and keeps the transaction
//! manager's undo registry in sync with them. Definitions are persisted to a
//! `catalog.meta` file in the database directory so a database can be
//! reopened.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use strata::btree::BTreeIndex;
use strata::buffer_pool::BufferPoolManager;
use strata::disk::DiskManager;
use strata::heap::HeapFile;
use strata::transaction::{IndexBinding, KeyColumn, TableResources, TransactionManager};

use crate::errors::ExecutionError;
use crate::types::{ColumnDef, ColumnMeta, build_schema, index_key, record_size};

const CATALOG_FILE: &str = "catalog.meta";

/// One index of a table.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    /// File name of the index, derived from table and column names.
    pub name: String,
    /// The key columns, in key order, with their tuple offsets.
    pub columns: Vec<ColumnMeta>,
    pub col_tot_len: usize,
}

pub struct IndexHandle {
    pub meta: IndexMeta,
    pub btree: Arc<BTreeIndex>,
}

/// An open table: schema plus storage handles.
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub record_size: usize,
    pub heap: Arc<HeapFile>,
    pub indexes: Vec<IndexHandle>,
}

impl TableInfo {
    pub fn index_on<'a>(&'a self, col_names: &[&str]) -> Option<&'a IndexHandle> {
        self.indexes.iter().find(|ih| {
            ih.meta.columns.len() == col_names.len()
                && ih
                    .meta
                    .columns
                    .iter()
                    .zip(col_names)
                    .all(|(c, n)| c.name == *n)
        })
    }
}

#[derive(Serialize, Deserialize)]
struct TableDef {
    name: String,
    columns: Vec<ColumnMeta>,
    indexes: Vec<Vec<String>>,
}

#[derive(Serialize, Deserialize, Default)]
struct CatalogDef {
    tables: Vec<TableDef>,
}

pub struct Catalog {
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    tm: Arc<TransactionManager>,
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
}

fn heap_file_name(table: &str) -> String {
    format!("{table}.tbl")
}

fn index_file_name(table: &str, col_names: &[&str]) -> String {
    format!("{table}__{}.idx", col_names.join("_"))
}

impl Catalog {
    pub fn new(
        disk: Arc<DiskManager>,
        bpm: Arc<BufferPoolManager>,
        tm: Arc<TransactionManager>,
    ) -> Self {
        Self {
            disk,
            bpm,
            tm,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Reopens every table recorded in the catalog file, if one exists.
    pub fn load(&self) -> Result<(), ExecutionError> {
        let path = self.disk.dir().join(CATALOG_FILE);
        if !path.exists() {
            return Ok(());
        }
        let bytes = fs::read(&path).map_err(strata::errors::StorageError::Io)?;
        let def: CatalogDef = bincode::deserialize(&bytes).map_err(|_| {
            ExecutionError::Storage(strata::errors::StorageError::Io(std::io::Error::other(
                "corrupt catalog file",
            )))
        })?;

        for table_def in def.tables {
            let heap = Arc::new(HeapFile::open(
                Arc::clone(&self.disk),
                Arc::clone(&self.bpm),
                &heap_file_name(&table_def.name),
            )?);

            let mut indexes = Vec::new();
            for col_names in &table_def.indexes {
                let names: Vec<&str> = col_names.iter().map(String::as_str).collect();
                let file_name = index_file_name(&table_def.name, &names);
                let btree = Arc::new(BTreeIndex::open(
                    Arc::clone(&self.disk),
                    Arc::clone(&self.bpm),
                    &file_name,
                )?);
                let columns = Self::key_columns(&table_def.columns, &names)?;
                let col_tot_len = columns.iter().map(|c| c.len).sum();
                indexes.push(IndexHandle {
                    meta: IndexMeta {
                        name: file_name,
                        columns,
                        col_tot_len,
                    },
                    btree,
                });
            }

            let info = Arc::new(TableInfo {
                name: table_def.name.clone(),
                record_size: record_size(&table_def.columns),
                columns: table_def.columns,
                heap,
                indexes,
            });
            self.register_undo_resources(&info);
            self.tables
                .write()
                .unwrap()
                .insert(table_def.name, info);
        }
        Ok(())
    }

    fn save(&self) -> Result<(), ExecutionError> {
        let tables = self.tables.read().unwrap();
        let def = CatalogDef {
            tables: tables
                .values()
                .map(|info| TableDef {
                    name: info.name.clone(),
                    columns: info.columns.clone(),
                    indexes: info
                        .indexes
                        .iter()
                        .map(|ih| ih.meta.columns.iter().map(|c| c.name.clone()).collect())
                        .collect(),
                })
                .collect(),
        };
        let bytes = bincode::serialize(&def)
            .map_err(|e| strata::errors::StorageError::Io(std::io::Error::other(e)))?;
        fs::write(self.disk.dir().join(CATALOG_FILE), bytes)
            .map_err(strata::errors::StorageError::Io)?;
        Ok(())
    }

    fn key_columns(
        schema: &[ColumnMeta],
        col_names: &[&str],
    ) -> Result<Vec<ColumnMeta>, ExecutionError> {
        col_names
            .iter()
            .map(|name| {
                schema
                    .iter()
                    .find(|c| c.name == *name)
                    .cloned()
                    .ok_or_else(|| ExecutionError::ColumnNotFound(name.to_string()))
            })
            .collect()
    }

    fn register_undo_resources(&self, info: &Arc<TableInfo>) {
        let bindings = info
            .indexes
            .iter()
            .map(|ih| IndexBinding {
                index: Arc::clone(&ih.btree),
                cols: ih
                    .meta
                    .columns
                    .iter()
                    .map(|c| KeyColumn {
                        offset: c.offset,
                        len: c.len,
                    })
                    .collect(),
            })
            .collect();
        self.tm.register_table(
            info.heap.file_id(),
            TableResources {
                heap: Arc::clone(&info.heap),
                indexes: bindings,
            },
        );
    }

    pub fn create_table(
        &self,
        name: &str,
        defs: &[ColumnDef],
    ) -> Result<Arc<TableInfo>, ExecutionError> {
        if self.tables.read().unwrap().contains_key(name) {
            return Err(ExecutionError::TableExists(name.to_string()));
        }

        let columns = build_schema(defs);
        let heap = Arc::new(HeapFile::create(
            Arc::clone(&self.disk),
            Arc::clone(&self.bpm),
            &heap_file_name(name),
            record_size(&columns),
        )?);

        let info = Arc::new(TableInfo {
            name: name.to_string(),
            record_size: record_size(&columns),
            columns,
            heap,
            indexes: Vec::new(),
        });
        self.register_undo_resources(&info);
        self.tables
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&info));
        self.save()?;
        crate::granite_debug_log!("[Catalog::create_table] {name}");
        Ok(info)
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableInfo>, ExecutionError> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::TableNotFound(name.to_string()))
    }

    pub fn drop_table(&self, name: &str) -> Result<(), ExecutionError> {
        let info = {
            let mut tables = self.tables.write().unwrap();
            tables
                .remove(name)
                .ok_or_else(|| ExecutionError::TableNotFound(name.to_string()))?
        };

        self.tm.deregister_table(info.heap.file_id());
        self.bpm.evict_file(info.heap.file_id())?;
        self.disk
            .remove_file(&heap_file_name(name))
            .map_err(strata::errors::StorageError::Io)?;
        for ih in &info.indexes {
            self.bpm.evict_file(ih.btree.file_id())?;
            self.disk
                .remove_file(&ih.meta.name)
                .map_err(strata::errors::StorageError::Io)?;
        }
        self.save()?;
        Ok(())
    }

    /// Creates an index over the given columns and bulk-loads every existing
    /// row. Fails with `DuplicateKey` if two rows share a key.
    pub fn create_index(
        &self,
        table_name: &str,
        col_names: &[&str],
    ) -> Result<(), ExecutionError> {
        let info = self.table(table_name)?;
        if info.index_on(col_names).is_some() {
            return Err(ExecutionError::IndexExists(index_file_name(
                table_name, col_names,
            )));
        }

        let columns = Self::key_columns(&info.columns, col_names)?;
        let col_types = columns.iter().map(|c| c.ctype).collect();
        let col_lens = columns.iter().map(|c| c.len as u32).collect();
        let file_name = index_file_name(table_name, col_names);

        let btree = Arc::new(BTreeIndex::create(
            Arc::clone(&self.disk),
            Arc::clone(&self.bpm),
            &file_name,
            col_types,
            col_lens,
        )?);

        // Bulk load from the heap.
        let mut scan = info.heap.scan()?;
        while !scan.is_end() {
            let rid = scan.rid();
            let tuple = info.heap.get(rid)?;
            let key = index_key(&tuple, &columns);
            if !btree.insert(&key, rid)? {
                self.bpm.evict_file(btree.file_id())?;
                self.disk
                    .remove_file(&file_name)
                    .map_err(strata::errors::StorageError::Io)?;
                return Err(ExecutionError::DuplicateKey(file_name));
            }
            scan.next()?;
        }

        let col_tot_len = columns.iter().map(|c| c.len).sum();
        let mut indexes: Vec<IndexHandle> = info
            .indexes
            .iter()
            .map(|ih| IndexHandle {
                meta: ih.meta.clone(),
                btree: Arc::clone(&ih.btree),
            })
            .collect();
        indexes.push(IndexHandle {
            meta: IndexMeta {
                name: file_name,
                columns,
                col_tot_len,
            },
            btree,
        });

        let new_info = Arc::new(TableInfo {
            name: info.name.clone(),
            columns: info.columns.clone(),
            record_size: info.record_size,
            heap: Arc::clone(&info.heap),
            indexes,
        });
        self.register_undo_resources(&new_info);
        self.tables
            .write()
            .unwrap()
            .insert(table_name.to_string(), new_info);
        self.save()?;
        crate::granite_debug_log!(
            "[Catalog::create_index] {table_name} ({})",
            col_names.join(", ")
        );
        Ok(())
    }

    pub fn drop_index(
        &self,
        table_name: &str,
        col_names: &[&str],
    ) -> Result<(), ExecutionError> {
        let info = self.table(table_name)?;
        let file_name = index_file_name(table_name, col_names);
        if info.index_on(col_names).is_none() {
            return Err(ExecutionError::IndexNotFound(file_name));
        }

        let indexes: Vec<IndexHandle> = info
            .indexes
            .iter()
            .filter(|ih| ih.meta.name != file_name)
            .map(|ih| IndexHandle {
                meta: ih.meta.clone(),
                btree: Arc::clone(&ih.btree),
            })
            .collect();

        let dropped = info
            .indexes
            .iter()
            .find(|ih| ih.meta.name == file_name)
            .map(|ih| ih.btree.file_id());

        let new_info = Arc::new(TableInfo {
            name: info.name.clone(),
            columns: info.columns.clone(),
            record_size: info.record_size,
            heap: Arc::clone(&info.heap),
            indexes,
        });
        self.register_undo_resources(&new_info);
        self.tables
            .write()
            .unwrap()
            .insert(table_name.to_string(), new_info);

        if let Some(file_id) = dropped {
            self.bpm.evict_file(file_id)?;
            self.disk
                .remove_file(&file_name)
                .map_err(strata::errors::StorageError::Io)?;
        }
        self.save()?;
        Ok(())
    }
}
