//! Manages hierarchical locks on database resources.
//!
//! Tables take the full `IS/IX/S/SIX/X` mode set; records and key-space gaps
//! take only `S`/`X`. The policy is strict two-phase locking with no-wait
//! conflict handling: a request that cannot be granted immediately aborts
//! the requesting transaction instead of blocking.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::transaction::{Transaction, TxnState};
use crate::{FileId, Rid, TxnId};

/// Lock modes, strongest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// Identifies a lockable resource.
///
/// Gap locks deliberately collapse onto one resource per file: any two range
/// scans or inserts on the same file conflict, which is conservative but
/// keeps phantom protection airtight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table(FileId),
    Record(FileId, Rid),
    Gap(FileId),
}

/// The strongest mode currently granted on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GroupLockMode {
    #[default]
    None,
    IS,
    IX,
    S,
    SIX,
    X,
}

fn strength(mode: LockMode) -> u8 {
    match mode {
        LockMode::IntentionShared => 0,
        LockMode::IntentionExclusive => 1,
        LockMode::Shared => 2,
        LockMode::SharedIntentionExclusive => 3,
        LockMode::Exclusive => 4,
    }
}

fn group_of(mode: LockMode) -> GroupLockMode {
    match mode {
        LockMode::IntentionShared => GroupLockMode::IS,
        LockMode::IntentionExclusive => GroupLockMode::IX,
        LockMode::Shared => GroupLockMode::S,
        LockMode::SharedIntentionExclusive => GroupLockMode::SIX,
        LockMode::Exclusive => GroupLockMode::X,
    }
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    requests: Vec<LockRequest>,
    group_mode: GroupLockMode,
    shared_count: usize,
    ix_count: usize,
}

impl LockRequestQueue {
    fn holder_mode(&self, txn_id: TxnId) -> Option<LockMode> {
        self.requests
            .iter()
            .find(|r| r.granted && r.txn_id == txn_id)
            .map(|r| r.mode)
    }

    fn grant(&mut self, txn_id: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared_count += 1,
            LockMode::IntentionExclusive => self.ix_count += 1,
            _ => {}
        }
        let group = group_of(mode);
        if group_strength(group) > group_strength(self.group_mode) {
            self.group_mode = group;
        }
        self.requests.push(LockRequest {
            txn_id,
            mode,
            granted: true,
        });
    }

    fn upgrade(&mut self, txn_id: TxnId, to: LockMode) {
        for request in self.requests.iter_mut() {
            if request.txn_id == txn_id {
                match (request.mode, to) {
                    (LockMode::Shared, LockMode::Exclusive) => self.shared_count -= 1,
                    (LockMode::Shared, LockMode::SharedIntentionExclusive) => self.ix_count += 1,
                    (LockMode::IntentionShared, LockMode::Shared) => self.shared_count += 1,
                    (LockMode::IntentionShared, LockMode::IntentionExclusive) => self.ix_count += 1,
                    (LockMode::IntentionExclusive, LockMode::SharedIntentionExclusive) => {
                        self.shared_count += 1
                    }
                    (from, LockMode::Exclusive) => {
                        if matches!(from, LockMode::Shared | LockMode::SharedIntentionExclusive) {
                            self.shared_count -= 1;
                        }
                        if matches!(
                            from,
                            LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
                        ) {
                            self.ix_count -= 1;
                        }
                    }
                    _ => {}
                }
                request.mode = to;
                break;
            }
        }
        self.group_mode = group_of(to);
    }
}

fn group_strength(group: GroupLockMode) -> u8 {
    match group {
        GroupLockMode::None => 0,
        GroupLockMode::IS => 1,
        GroupLockMode::IX => 2,
        GroupLockMode::S => 3,
        GroupLockMode::SIX => 4,
        GroupLockMode::X => 5,
    }
}

/// Why a lock request terminated its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    UpgradeConflict,
    DeadlockPrevention,
}

/// Raised when a lock request cannot proceed; the owning transaction is
/// expected to abort.
#[derive(Debug)]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

/// The lock manager. One coarse mutex serializes every queue mutation; there
/// are no condition variables because nothing ever waits.
#[derive(Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockRequestQueue>>,
}

/// Checks 2PL state before any acquisition. A finished transaction gets a
/// quiet `false`; a shrinking one is aborted; a fresh one starts growing.
fn check_lock(txn: &Transaction) -> Result<bool, TransactionAbort> {
    match txn.state() {
        TxnState::Committed | TxnState::Aborted => Ok(false),
        TxnState::Shrinking => Err(TransactionAbort {
            txn_id: txn.txn_id(),
            reason: AbortReason::LockOnShrinking,
        }),
        TxnState::Default => {
            txn.set_state(TxnState::Growing);
            Ok(true)
        }
        TxnState::Growing => Ok(true),
    }
}

fn deadlock(txn: &Transaction) -> TransactionAbort {
    crate::strata_debug_log!(
        "[LockManager] no-wait conflict, aborting txn {}",
        txn.txn_id()
    );
    TransactionAbort {
        txn_id: txn.txn_id(),
        reason: AbortReason::DeadlockPrevention,
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared_on_record(
        &self,
        txn: &Transaction,
        rid: Rid,
        fd: FileId,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Record(fd, rid);
        let queue = table.entry(id).or_default();

        // A record S or X already held by this transaction covers the read.
        if let Some(mode) = queue.holder_mode(txn.txn_id()) {
            if matches!(mode, LockMode::Shared | LockMode::Exclusive) {
                return Ok(true);
            }
        }

        if matches!(queue.group_mode, GroupLockMode::X) {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::Shared);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_exclusive_on_record(
        &self,
        txn: &Transaction,
        rid: Rid,
        fd: FileId,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Record(fd, rid);
        let queue = table.entry(id).or_default();

        if let Some(mode) = queue.holder_mode(txn.txn_id()) {
            match mode {
                LockMode::Exclusive => return Ok(true),
                LockMode::Shared => {
                    if queue.group_mode == GroupLockMode::X {
                        return Err(deadlock(txn));
                    }
                    // S -> X only for the sole shared holder.
                    if queue.shared_count == 1 {
                        queue.upgrade(txn.txn_id(), LockMode::Exclusive);
                        return Ok(true);
                    }
                    return Err(deadlock(txn));
                }
                _ => return Err(deadlock(txn)),
            }
        }

        if queue.group_mode != GroupLockMode::None {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::Exclusive);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_shared_on_table(
        &self,
        txn: &Transaction,
        fd: FileId,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Table(fd);
        let queue = table.entry(id).or_default();

        if let Some(mode) = queue.holder_mode(txn.txn_id()) {
            match mode {
                LockMode::Shared
                | LockMode::SharedIntentionExclusive
                | LockMode::Exclusive => return Ok(true),
                // IS -> S needs the group free of writers.
                LockMode::IntentionShared
                    if matches!(queue.group_mode, GroupLockMode::IS | GroupLockMode::S) =>
                {
                    queue.upgrade(txn.txn_id(), LockMode::Shared);
                    return Ok(true);
                }
                // IX -> SIX needs every IX in the queue to be ours.
                LockMode::IntentionExclusive if queue.ix_count == 1 => {
                    queue.upgrade(txn.txn_id(), LockMode::SharedIntentionExclusive);
                    return Ok(true);
                }
                _ => return Err(deadlock(txn)),
            }
        }

        if matches!(
            queue.group_mode,
            GroupLockMode::X | GroupLockMode::IX | GroupLockMode::SIX
        ) {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::Shared);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_exclusive_on_table(
        &self,
        txn: &Transaction,
        fd: FileId,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Table(fd);
        let queue = table.entry(id).or_default();

        if let Some(mode) = queue.holder_mode(txn.txn_id()) {
            if mode == LockMode::Exclusive {
                return Ok(true);
            }
            // Any mode upgrades to X when we are alone in the queue.
            if queue.requests.len() == 1 {
                queue.upgrade(txn.txn_id(), LockMode::Exclusive);
                return Ok(true);
            }
            return Err(deadlock(txn));
        }

        if queue.group_mode != GroupLockMode::None {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::Exclusive);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_is_on_table(
        &self,
        txn: &Transaction,
        fd: FileId,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Table(fd);
        let queue = table.entry(id).or_default();

        // Nothing is weaker than IS; any held mode already covers it.
        if queue.holder_mode(txn.txn_id()).is_some() {
            return Ok(true);
        }

        if queue.group_mode == GroupLockMode::X {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::IntentionShared);
        txn.add_lock(id);
        Ok(true)
    }

    pub fn lock_ix_on_table(
        &self,
        txn: &Transaction,
        fd: FileId,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Table(fd);
        let queue = table.entry(id).or_default();

        if let Some(mode) = queue.holder_mode(txn.txn_id()) {
            match mode {
                LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
                | LockMode::Exclusive => return Ok(true),
                // S -> SIX only for the sole shared holder.
                LockMode::Shared if queue.shared_count == 1 => {
                    queue.upgrade(txn.txn_id(), LockMode::SharedIntentionExclusive);
                    return Ok(true);
                }
                LockMode::IntentionShared
                    if matches!(queue.group_mode, GroupLockMode::IS | GroupLockMode::IX) =>
                {
                    queue.upgrade(txn.txn_id(), LockMode::IntentionExclusive);
                    return Ok(true);
                }
                _ => return Err(deadlock(txn)),
            }
        }

        if matches!(
            queue.group_mode,
            GroupLockMode::S | GroupLockMode::SIX | GroupLockMode::X
        ) {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::IntentionExclusive);
        txn.add_lock(id);
        Ok(true)
    }

    /// Shared lock on a key-space interval of the file. The bounds take part
    /// in the call signature but not in the resource identity (see
    /// `LockDataId::Gap`).
    pub fn lock_shared_on_gap(
        &self,
        txn: &Transaction,
        fd: FileId,
        _left_key: i32,
        _right_key: i32,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Gap(fd);
        let queue = table.entry(id).or_default();

        if let Some(mode) = queue.holder_mode(txn.txn_id()) {
            if matches!(mode, LockMode::Shared | LockMode::Exclusive) {
                return Ok(true);
            }
        }

        if queue.group_mode == GroupLockMode::X {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::Shared);
        txn.add_lock(id);
        Ok(true)
    }

    /// Exclusive lock on a key-space interval of the file.
    pub fn lock_exclusive_on_gap(
        &self,
        txn: &Transaction,
        fd: FileId,
        _left_key: i32,
        _right_key: i32,
    ) -> Result<bool, TransactionAbort> {
        let mut table = self.lock_table.lock().unwrap();
        if !check_lock(txn)? {
            return Ok(false);
        }

        let id = LockDataId::Gap(fd);
        let queue = table.entry(id).or_default();

        if let Some(mode) = queue.holder_mode(txn.txn_id()) {
            match mode {
                LockMode::Exclusive => return Ok(true),
                LockMode::Shared if queue.shared_count == 1 => {
                    queue.upgrade(txn.txn_id(), LockMode::Exclusive);
                    return Ok(true);
                }
                _ => return Err(deadlock(txn)),
            }
        }

        if queue.group_mode != GroupLockMode::None {
            return Err(deadlock(txn));
        }

        queue.grant(txn.txn_id(), LockMode::Exclusive);
        txn.add_lock(id);
        Ok(true)
    }

    /// Releases one lock. The first release flips the transaction into its
    /// shrinking phase. Releasing from a finished transaction is a no-op.
    pub fn unlock(&self, txn: &Transaction, id: LockDataId) -> bool {
        let mut table = self.lock_table.lock().unwrap();

        match txn.state() {
            TxnState::Committed | TxnState::Aborted => return false,
            TxnState::Growing => txn.set_state(TxnState::Shrinking),
            _ => {}
        }

        let Some(queue) = table.get_mut(&id) else {
            return true;
        };
        let Some(pos) = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn.txn_id())
        else {
            return true;
        };

        let mode = queue.requests[pos].mode;
        if matches!(
            mode,
            LockMode::Shared | LockMode::SharedIntentionExclusive
        ) {
            queue.shared_count -= 1;
        }
        if matches!(
            mode,
            LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        ) {
            queue.ix_count -= 1;
        }
        queue.requests.remove(pos);

        if queue.requests.is_empty() {
            table.remove(&id);
            return true;
        }

        // Recompute the summary as the strongest surviving mode.
        let strongest = queue
            .requests
            .iter()
            .max_by_key(|r| strength(r.mode))
            .map(|r| r.mode);
        queue.group_mode = strongest.map_or(GroupLockMode::None, group_of);
        true
    }

    #[cfg(test)]
    fn queue_state(&self, id: LockDataId) -> Option<(usize, usize, usize)> {
        let table = self.lock_table.lock().unwrap();
        table
            .get(&id)
            .map(|q| (q.requests.len(), q.shared_count, q.ix_count))
    }
}
