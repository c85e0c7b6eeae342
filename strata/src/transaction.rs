//! Transaction lifecycle and logical undo.
//!
//! Every data-changing executor operation appends one `WriteRecord` (with an
//! ordered list of index sub-operations) to its transaction before the change
//! lands. Commit throws the log away; abort replays it newest-first to
//! restore both heap and index state. There is no durable log: recovery
//! after a crash is out of scope, rollback of live transactions is not.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::btree::BTreeIndex;
use crate::errors::StorageError;
use crate::heap::HeapFile;
use crate::lock_manager::{LockDataId, LockManager};
use crate::{FileId, Rid, TxnId};

/// 2PL transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Delete,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Insert,
    Delete,
}

/// Undo record for one index mutation.
pub struct IndexWriteRecord {
    pub index: Arc<BTreeIndex>,
    pub key: Vec<u8>,
    pub rid: Rid,
    pub op: IndexOp,
}

/// Undo record for one heap mutation, with its dependent index mutations.
/// `tuple` holds the inserted bytes for `Insert` and the pre-image for
/// `Delete`/`Update`.
pub struct WriteRecord {
    pub wtype: WriteType,
    pub table_fd: FileId,
    pub rid: Rid,
    pub tuple: Vec<u8>,
    pub index_ops: Vec<IndexWriteRecord>,
}

impl WriteRecord {
    pub fn new(wtype: WriteType, table_fd: FileId, rid: Rid, tuple: Vec<u8>) -> Self {
        Self {
            wtype,
            table_fd,
            rid,
            tuple,
            index_ops: Vec::new(),
        }
    }
}

/// A live transaction. Shared between the worker thread driving it, the lock
/// manager, and the registry, hence the interior mutability.
pub struct Transaction {
    txn_id: TxnId,
    state: Mutex<TxnState>,
    write_set: Mutex<Vec<WriteRecord>>,
    lock_set: Mutex<HashSet<LockDataId>>,
}

impl Transaction {
    pub fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            state: Mutex::new(TxnState::Default),
            write_set: Mutex::new(Vec::new()),
            lock_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock().unwrap() = state;
    }

    /// Appends a heap-level undo record. Must happen before the change it
    /// describes becomes visible to other operations of this transaction.
    pub fn append_write_record(&self, record: WriteRecord) {
        self.write_set.lock().unwrap().push(record);
    }

    /// Attaches an index undo entry to the most recent write record.
    pub fn append_index_op(&self, op: IndexWriteRecord) {
        let mut write_set = self.write_set.lock().unwrap();
        if let Some(last) = write_set.last_mut() {
            last.index_ops.push(op);
        }
    }

    pub fn add_lock(&self, id: LockDataId) {
        self.lock_set.lock().unwrap().insert(id);
    }

    pub fn write_count(&self) -> usize {
        self.write_set.lock().unwrap().len()
    }
}

/// How to build one index's key from a tuple: the key columns' byte ranges.
#[derive(Debug, Clone, Copy)]
pub struct KeyColumn {
    pub offset: usize,
    pub len: usize,
}

/// An index of a table together with its key layout, as registered for undo.
pub struct IndexBinding {
    pub index: Arc<BTreeIndex>,
    pub cols: Vec<KeyColumn>,
}

impl IndexBinding {
    pub fn key_of(&self, tuple: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.cols.iter().map(|c| c.len).sum());
        for col in &self.cols {
            key.extend_from_slice(&tuple[col.offset..col.offset + col.len]);
        }
        key
    }
}

/// The storage handles abort needs to roll a table back.
pub struct TableResources {
    pub heap: Arc<HeapFile>,
    pub indexes: Vec<IndexBinding>,
}

/// The process-wide transaction registry. Owned by the database handle; all
/// begin/commit/abort traffic funnels through it.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    lock_manager: Arc<LockManager>,
    tables: RwLock<HashMap<FileId, TableResources>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            txns: Mutex::new(HashMap::new()),
            lock_manager,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Makes a table's handles available to abort. Called by the catalog
    /// when a table is created or opened.
    pub fn register_table(&self, fd: FileId, resources: TableResources) {
        self.tables.write().unwrap().insert(fd, resources);
    }

    pub fn deregister_table(&self, fd: FileId) {
        self.tables.write().unwrap().remove(&fd);
    }

    pub fn begin(&self) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id));
        self.txns.lock().unwrap().insert(txn_id, Arc::clone(&txn));
        crate::strata_debug_log!("[TransactionManager::begin] txn {txn_id}");
        txn
    }

    pub fn transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().unwrap().get(&txn_id).cloned()
    }

    /// Commits: undo entries are dropped, locks released, state sealed.
    pub fn commit(&self, txn: &Transaction) -> Result<(), StorageError> {
        if matches!(txn.state(), TxnState::Committed | TxnState::Aborted) {
            return Err(StorageError::TransactionFinished(txn.txn_id()));
        }

        txn.write_set.lock().unwrap().clear();
        self.release_locks(txn);
        txn.set_state(TxnState::Committed);
        self.txns.lock().unwrap().remove(&txn.txn_id());
        crate::strata_debug_log!("[TransactionManager::commit] txn {}", txn.txn_id());
        Ok(())
    }

    /// Aborts: the undo log is replayed newest-first, then locks released.
    pub fn abort(&self, txn: &Transaction) -> Result<(), StorageError> {
        if matches!(txn.state(), TxnState::Committed | TxnState::Aborted) {
            return Err(StorageError::TransactionFinished(txn.txn_id()));
        }
        crate::strata_debug_log!("[TransactionManager::abort] txn {}", txn.txn_id());

        loop {
            let record = {
                let mut write_set = txn.write_set.lock().unwrap();
                write_set.pop()
            };
            let Some(record) = record else { break };
            self.rollback_record(txn, &record);
        }

        self.release_locks(txn);
        txn.set_state(TxnState::Aborted);
        self.txns.lock().unwrap().remove(&txn.txn_id());
        Ok(())
    }

    fn release_locks(&self, txn: &Transaction) {
        let locks: Vec<LockDataId> = txn.lock_set.lock().unwrap().iter().copied().collect();
        for id in locks {
            self.lock_manager.unlock(txn, id);
        }
        txn.lock_set.lock().unwrap().clear();
    }

    /// Rolls one write record back. Index sub-operations are undone first,
    /// in reverse; conflicts ("already gone", "already present") are
    /// swallowed so rollback stays idempotent. The heap record is restored
    /// last, so a restored index entry never ends up pointing at a missing
    /// tuple for longer than this function runs.
    fn rollback_record(&self, txn: &Transaction, record: &WriteRecord) {
        for index_op in record.index_ops.iter().rev() {
            let result = match index_op.op {
                IndexOp::Insert => index_op.index.delete(&index_op.key).map(|_| ()),
                IndexOp::Delete => index_op
                    .index
                    .insert(&index_op.key, index_op.rid)
                    .map(|_| ()),
            };
            if let Err(err) = result {
                crate::strata_debug_log!(
                    "[TransactionManager::abort] txn {} index undo skipped: {err:?}",
                    txn.txn_id()
                );
            }
        }

        let tables = self.tables.read().unwrap();
        let Some(resources) = tables.get(&record.table_fd) else {
            crate::strata_debug_log!(
                "[TransactionManager::abort] txn {} table {} gone, skipping record undo",
                txn.txn_id(),
                record.table_fd
            );
            return;
        };
        let heap = &resources.heap;

        match record.wtype {
            WriteType::Insert => {
                if let Err(err) = heap.delete(record.rid) {
                    crate::strata_debug_log!(
                        "[TransactionManager::abort] txn {} insert undo skipped: {err:?}",
                        txn.txn_id()
                    );
                }
            }
            WriteType::Delete => {
                match heap.insert_at(record.rid, &record.tuple) {
                    Ok(()) => {}
                    Err(StorageError::SlotOccupied(_)) => {
                        // Another undo step re-occupied the slot. Displace
                        // the occupant: strip its index entries, then
                        // overwrite it with the deleted tuple's pre-image.
                        if let Ok(existing) = heap.get(record.rid) {
                            for binding in &resources.indexes {
                                let key = binding.key_of(&existing);
                                let _ = binding.index.delete(&key);
                            }
                        }
                        if let Err(err) = heap.update(record.rid, &record.tuple) {
                            crate::strata_debug_log!(
                                "[TransactionManager::abort] txn {} delete undo overwrite failed: {err:?}",
                                txn.txn_id()
                            );
                        }
                    }
                    Err(err) => {
                        crate::strata_debug_log!(
                            "[TransactionManager::abort] txn {} delete undo failed: {err:?}",
                            txn.txn_id()
                        );
                    }
                }
                if heap.get(record.rid).is_err() {
                    // Acknowledged hazard: without a durable log there is no
                    // further fallback once the slot cannot be restored.
                    crate::strata_debug_log!(
                        "[TransactionManager::abort] txn {} could not restore record {:?}",
                        txn.txn_id(),
                        record.rid
                    );
                }
            }
            WriteType::Update => {
                match heap.update(record.rid, &record.tuple) {
                    Ok(()) => {}
                    Err(StorageError::RecordNotFound(_)) => {
                        // An earlier undo step deleted the row; put the
                        // pre-image back at its original Rid.
                        if let Err(err) = heap.insert_at(record.rid, &record.tuple) {
                            crate::strata_debug_log!(
                                "[TransactionManager::abort] txn {} update undo reinsert failed: {err:?}",
                                txn.txn_id()
                            );
                        }
                    }
                    Err(err) => {
                        crate::strata_debug_log!(
                            "[TransactionManager::abort] txn {} update undo failed: {err:?}",
                            txn.txn_id()
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{BTreeIndex, ColType};
    use crate::buffer_pool::BufferPoolManager;
    use crate::disk::DiskManager;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        tm: TransactionManager,
        heap: Arc<HeapFile>,
        index: Arc<BTreeIndex>,
    }

    // One table with a 4-byte int record that doubles as the index key.
    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(Arc::clone(&disk)));
        let heap = Arc::new(
            HeapFile::create(Arc::clone(&disk), Arc::clone(&bpm), "t.tbl", 4).unwrap(),
        );
        let index = Arc::new(
            BTreeIndex::create(disk, bpm, "t.idx", vec![ColType::Int], vec![4]).unwrap(),
        );

        let tm = TransactionManager::new(Arc::new(LockManager::new()));
        tm.register_table(
            heap.file_id(),
            TableResources {
                heap: Arc::clone(&heap),
                indexes: vec![IndexBinding {
                    index: Arc::clone(&index),
                    cols: vec![KeyColumn { offset: 0, len: 4 }],
                }],
            },
        );
        Fixture {
            _dir: dir,
            tm,
            heap,
            index,
        }
    }

    fn tuple(v: i32) -> Vec<u8> {
        v.to_ne_bytes().to_vec()
    }

    fn insert_with_undo(f: &Fixture, txn: &Transaction, v: i32) -> Rid {
        let bytes = tuple(v);
        let rid = f.heap.insert(&bytes).unwrap();
        txn.append_write_record(WriteRecord::new(
            WriteType::Insert,
            f.heap.file_id(),
            rid,
            bytes.clone(),
        ));
        f.index.insert(&bytes, rid).unwrap();
        txn.append_index_op(IndexWriteRecord {
            index: Arc::clone(&f.index),
            key: bytes,
            rid,
            op: IndexOp::Insert,
        });
        rid
    }

    #[test]
    fn test_ids_are_monotonic() {
        let f = setup();
        let t1 = f.tm.begin();
        let t2 = f.tm.begin();
        assert!(t2.txn_id() > t1.txn_id());
    }

    #[test]
    fn test_commit_seals_transaction() {
        let f = setup();
        let txn = f.tm.begin();
        insert_with_undo(&f, &txn, 1);

        f.tm.commit(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.write_count(), 0);
        assert!(matches!(
            f.tm.commit(&txn),
            Err(StorageError::TransactionFinished(_))
        ));
    }

    #[test]
    fn test_abort_rolls_back_insert() {
        let f = setup();
        let txn = f.tm.begin();
        let rid = insert_with_undo(&f, &txn, 42);

        f.tm.abort(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Aborted);
        assert!(f.heap.get(rid).is_err());
        assert_eq!(f.index.get(&tuple(42)).unwrap(), None);
    }

    #[test]
    fn test_abort_restores_delete_at_original_rid() {
        let f = setup();

        // Committed row.
        let setup_txn = f.tm.begin();
        let rid = insert_with_undo(&f, &setup_txn, 7);
        f.tm.commit(&setup_txn).unwrap();

        // Delete it in a transaction that aborts.
        let txn = f.tm.begin();
        let old = f.heap.get(rid).unwrap();
        txn.append_write_record(WriteRecord::new(
            WriteType::Delete,
            f.heap.file_id(),
            rid,
            old.clone(),
        ));
        f.index.delete(&old).unwrap();
        txn.append_index_op(IndexWriteRecord {
            index: Arc::clone(&f.index),
            key: old.clone(),
            rid,
            op: IndexOp::Delete,
        });
        f.heap.delete(rid).unwrap();

        f.tm.abort(&txn).unwrap();
        assert_eq!(f.heap.get(rid).unwrap(), old);
        assert_eq!(f.index.get(&tuple(7)).unwrap(), Some(rid));
    }

    #[test]
    fn test_abort_restores_update_pre_image() {
        let f = setup();

        let setup_txn = f.tm.begin();
        let rid = insert_with_undo(&f, &setup_txn, 10);
        f.tm.commit(&setup_txn).unwrap();

        let txn = f.tm.begin();
        let old = f.heap.get(rid).unwrap();
        let new = tuple(11);
        txn.append_write_record(WriteRecord::new(
            WriteType::Update,
            f.heap.file_id(),
            rid,
            old.clone(),
        ));
        f.index.delete(&old).unwrap();
        txn.append_index_op(IndexWriteRecord {
            index: Arc::clone(&f.index),
            key: old.clone(),
            rid,
            op: IndexOp::Delete,
        });
        f.index.insert(&new, rid).unwrap();
        txn.append_index_op(IndexWriteRecord {
            index: Arc::clone(&f.index),
            key: new.clone(),
            rid,
            op: IndexOp::Insert,
        });
        f.heap.update(rid, &new).unwrap();

        f.tm.abort(&txn).unwrap();
        assert_eq!(f.heap.get(rid).unwrap(), old);
        assert_eq!(f.index.get(&tuple(10)).unwrap(), Some(rid));
        assert_eq!(f.index.get(&tuple(11)).unwrap(), None);
    }

    #[test]
    fn test_abort_replays_lifo() {
        let f = setup();

        // Insert then update the same row in one transaction; abort must
        // undo the update first and the insert second, leaving nothing.
        let txn = f.tm.begin();
        let rid = insert_with_undo(&f, &txn, 1);
        let old = f.heap.get(rid).unwrap();
        let new = tuple(2);
        txn.append_write_record(WriteRecord::new(
            WriteType::Update,
            f.heap.file_id(),
            rid,
            old.clone(),
        ));
        f.index.delete(&old).unwrap();
        txn.append_index_op(IndexWriteRecord {
            index: Arc::clone(&f.index),
            key: old,
            rid,
            op: IndexOp::Delete,
        });
        f.index.insert(&new, rid).unwrap();
        txn.append_index_op(IndexWriteRecord {
            index: Arc::clone(&f.index),
            key: new,
            rid,
            op: IndexOp::Insert,
        });
        f.heap.update(rid, &tuple(2)).unwrap();

        f.tm.abort(&txn).unwrap();
        assert!(f.heap.get(rid).is_err());
        assert_eq!(f.index.get(&tuple(1)).unwrap(), None);
        assert_eq!(f.index.get(&tuple(2)).unwrap(), None);
    }

    #[test]
    fn test_abort_without_writes_is_clean() {
        let f = setup();
        let txn = f.tm.begin();
        f.tm.abort(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Aborted);
    }
}
