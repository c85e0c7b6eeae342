mod common;

use std::sync::Arc;
use std::thread;

use common::{create_users, insert_committed, scan_users, setup, user_row};
use granite::Database;
use granite::errors::ExecutionError;
use granite::executor::{
    Executor, IndexScanExecutor, execute_delete, execute_insert, execute_update,
};
use granite::types::{CompOp, Condition, Value, decode_tuple};
use serial_test::serial;
use strata::lock_manager::AbortReason;

fn expect_deadlock_prevention(err: ExecutionError) {
    match err {
        ExecutionError::TransactionAborted(abort) => {
            assert_eq!(abort.reason, AbortReason::DeadlockPrevention);
        }
        other => panic!("expected a no-wait abort, got {other:?}"),
    }
}

#[test]
fn conflicting_write_aborts_immediately() {
    let t = setup();
    create_users(&t.db, false);
    insert_committed(&t.db, "users", &user_row(1, "row", 0.0));

    let info = t.db.catalog.table("users").unwrap();

    // T1 takes X on the record via an update; T2's delete needs the same
    // record and must abort instead of waiting.
    let t1 = t.db.begin();
    execute_update(
        t.db.context(&t1),
        &info,
        &[Condition::eq_const("id", Value::Int(1))],
        &[("name".to_string(), Value::Str("t1".to_string()))],
    )
    .unwrap();

    let t2 = t.db.begin();
    let err = execute_delete(
        t.db.context(&t2),
        &info,
        &[Condition::eq_const("id", Value::Int(1))],
    )
    .unwrap_err();
    expect_deadlock_prevention(err);
    t.db.abort(&t2).unwrap();

    t.db.commit(&t1).unwrap();
    assert_eq!(scan_users(&t.db), vec![(1, "t1".to_string())]);
}

#[test]
fn reader_blocks_writer_from_upgrading() {
    let t = setup();
    create_users(&t.db, false);
    insert_committed(&t.db, "users", &user_row(1, "row", 0.0));

    let info = t.db.catalog.table("users").unwrap();

    // Both transactions read the row, then one tries to write it. The S -> X
    // upgrade must fail because of the co-reader.
    let t1 = t.db.begin();
    let t2 = t.db.begin();
    assert_eq!(common::scan_users_in(&t.db, &t1).len(), 1);
    assert_eq!(common::scan_users_in(&t.db, &t2).len(), 1);

    let err = execute_delete(
        t.db.context(&t1),
        &info,
        &[Condition::eq_const("id", Value::Int(1))],
    )
    .unwrap_err();
    expect_deadlock_prevention(err);
    t.db.abort(&t1).unwrap();
    t.db.commit(&t2).unwrap();
}

#[test]
fn index_scan_gap_lock_blocks_phantom_insert() {
    let t = setup();
    create_users(&t.db, true);
    for id in [10, 12, 20] {
        insert_committed(&t.db, "users", &user_row(id, "row", 0.0));
    }

    let info = t.db.catalog.table("users").unwrap();
    let range_conds = vec![
        Condition::cmp_const("id", CompOp::Ge, Value::Int(10)),
        Condition::cmp_const("id", CompOp::Le, Value::Int(20)),
    ];

    let scan_ids = |txn: &Arc<strata::transaction::Transaction>| -> Vec<i32> {
        let mut scan = IndexScanExecutor::new(
            t.db.context(txn),
            Arc::clone(&info),
            0,
            range_conds.clone(),
        );
        let mut ids = Vec::new();
        scan.begin().unwrap();
        while !scan.is_end() {
            let tuple = scan.current().unwrap().unwrap();
            match decode_tuple(&tuple, &info.columns)[0] {
                Value::Int(id) => ids.push(id),
                _ => unreachable!(),
            }
            scan.next().unwrap();
        }
        ids
    };

    // T1 scans the range and thereby holds the file's gap in shared mode.
    let t1 = t.db.begin();
    let first = scan_ids(&t1);
    assert_eq!(first, vec![10, 12, 20]);

    // T2 tries to insert key 15 into the scanned range: the exclusive gap
    // request collides and aborts T2 on the spot.
    let t2 = t.db.begin();
    let err = execute_insert(t.db.context(&t2), &info, &user_row(15, "phantom", 0.0))
        .unwrap_err();
    expect_deadlock_prevention(err);
    t.db.abort(&t2).unwrap();

    // T1 re-reads the identical row set.
    let second = scan_ids(&t1);
    assert_eq!(first, second);
    t.db.commit(&t1).unwrap();

    // With T1 gone the insert goes through.
    insert_committed(&t.db, "users", &user_row(15, "late", 0.0));
    let ids: Vec<i32> = scan_users(&t.db).into_iter().map(|(id, _)| id).collect();
    assert!(ids.contains(&15));
}

#[test]
#[serial]
fn parallel_writers_on_disjoint_keys_all_commit() {
    let t = setup();
    create_users(&t.db, false);
    let db: &Database = &t.db;

    thread::scope(|scope| {
        for worker in 0..4i32 {
            scope.spawn(move || {
                for i in 0..25i32 {
                    let id = worker * 100 + i;
                    let txn = db.begin();
                    let info = db.catalog.table("users").unwrap();
                    execute_insert(db.context(&txn), &info, &user_row(id, "w", 0.0))
                        .unwrap();
                    db.commit(&txn).unwrap();
                }
            });
        }
    });

    assert_eq!(scan_users(db).len(), 100);
}

#[test]
#[serial]
fn contended_updates_serialize_through_no_wait_retries() {
    let t = setup();
    create_users(&t.db, false);
    insert_committed(&t.db, "users", &user_row(1, "0", 0.0));
    let db: &Database = &t.db;

    // Four workers each try to bump the row's name-encoded counter once,
    // retrying on no-wait aborts. Strict 2PL makes the increments serialize.
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(move || loop {
                let txn = db.begin();
                let info = db.catalog.table("users").unwrap();
                let result = (|| -> Result<(), ExecutionError> {
                    use granite::executor::SeqScanExecutor;
                    let mut scan =
                        SeqScanExecutor::new(db.context(&txn), Arc::clone(&info), Vec::new());
                    scan.begin()?;
                    let tuple = scan
                        .current()?
                        .ok_or_else(|| ExecutionError::InvalidValue("row missing".into()))?;
                    let current: i32 = match &decode_tuple(&tuple, &info.columns)[1] {
                        Value::Str(s) => s.parse().unwrap(),
                        _ => unreachable!(),
                    };
                    execute_update(
                        db.context(&txn),
                        &info,
                        &[Condition::eq_const("id", Value::Int(1))],
                        &[("name".to_string(), Value::Str((current + 1).to_string()))],
                    )?;
                    Ok(())
                })();
                match result {
                    Ok(()) => {
                        db.commit(&txn).unwrap();
                        return;
                    }
                    Err(_) => {
                        db.abort(&txn).unwrap();
                        thread::yield_now();
                    }
                }
            });
        }
    });

    assert_eq!(scan_users(db), vec![(1, "4".to_string())]);
}
