mod common;

use std::sync::Arc;

use common::{create_users, insert_committed, scan_users, scan_users_in, setup, user_row};
use granite::executor::{Executor, IndexScanExecutor, execute_delete, execute_insert, execute_update};
use granite::types::{Condition, Value};
use strata::transaction::TxnState;

#[test]
fn abort_undoes_insert_in_heap_and_index() {
    let t = setup();
    create_users(&t.db, true);
    insert_committed(&t.db, "users", &user_row(1, "keep", 0.0));

    let txn = t.db.begin();
    let info = t.db.catalog.table("users").unwrap();
    execute_insert(t.db.context(&txn), &info, &user_row(2, "gone", 0.0)).unwrap();
    assert_eq!(scan_users_in(&t.db, &txn).len(), 2);
    t.db.abort(&txn).unwrap();
    assert_eq!(txn.state(), TxnState::Aborted);

    assert_eq!(scan_users(&t.db), vec![(1, "keep".to_string())]);
    assert!(info.indexes[0].btree.get(&2i32.to_ne_bytes()).unwrap().is_none());
}

#[test]
fn abort_restores_deleted_row_at_same_rid() {
    let t = setup();
    create_users(&t.db, true);
    insert_committed(&t.db, "users", &user_row(7, "victim", 1.5));

    let info = t.db.catalog.table("users").unwrap();
    let original_rid = info.indexes[0]
        .btree
        .get(&7i32.to_ne_bytes())
        .unwrap()
        .unwrap();
    let original_bytes = info.heap.get(original_rid).unwrap();

    let txn = t.db.begin();
    let removed = execute_delete(
        t.db.context(&txn),
        &info,
        &[Condition::eq_const("id", Value::Int(7))],
    )
    .unwrap();
    assert_eq!(removed, 1);
    assert!(info.heap.get(original_rid).is_err());

    t.db.abort(&txn).unwrap();

    // Bytes-for-bytes back at the original Rid, and the index agrees.
    assert_eq!(info.heap.get(original_rid).unwrap(), original_bytes);
    assert_eq!(
        info.indexes[0].btree.get(&7i32.to_ne_bytes()).unwrap(),
        Some(original_rid)
    );
}

#[test]
fn abort_restores_update_pre_image() {
    let t = setup();
    create_users(&t.db, true);
    insert_committed(&t.db, "users", &user_row(3, "before", 0.5));

    let txn = t.db.begin();
    let info = t.db.catalog.table("users").unwrap();
    execute_update(
        t.db.context(&txn),
        &info,
        &[Condition::eq_const("id", Value::Int(3))],
        &[
            ("id".to_string(), Value::Int(30)),
            ("name".to_string(), Value::Str("after".to_string())),
        ],
    )
    .unwrap();
    assert_eq!(scan_users_in(&t.db, &txn), vec![(30, "after".to_string())]);
    t.db.abort(&txn).unwrap();

    assert_eq!(scan_users(&t.db), vec![(3, "before".to_string())]);
    assert!(info.indexes[0].btree.get(&30i32.to_ne_bytes()).unwrap().is_none());
    assert!(info.indexes[0].btree.get(&3i32.to_ne_bytes()).unwrap().is_some());
}

#[test]
fn abort_undoes_a_mixed_statement_sequence() {
    let t = setup();
    create_users(&t.db, true);
    for id in 1..=4 {
        insert_committed(&t.db, "users", &user_row(id, &format!("u{id}"), 0.0));
    }
    let before = scan_users(&t.db);

    // One transaction inserts, updates, and deletes across the table, then
    // aborts. Every effect must unwind, newest first.
    let txn = t.db.begin();
    let info = t.db.catalog.table("users").unwrap();
    let ctx = t.db.context(&txn);
    execute_insert(ctx, &info, &user_row(5, "u5", 0.0)).unwrap();
    execute_update(
        ctx,
        &info,
        &[Condition::eq_const("id", Value::Int(2))],
        &[("id".to_string(), Value::Int(22))],
    )
    .unwrap();
    execute_delete(ctx, &info, &[Condition::eq_const("id", Value::Int(3))]).unwrap();
    execute_delete(ctx, &info, &[Condition::eq_const("id", Value::Int(5))]).unwrap();
    t.db.abort(&txn).unwrap();

    let mut after = scan_users(&t.db);
    after.sort();
    let mut expected = before;
    expected.sort();
    assert_eq!(after, expected);

    // Index state matches too: exactly ids 1..=4 are present.
    for id in 1..=4i32 {
        assert!(info.indexes[0].btree.get(&id.to_ne_bytes()).unwrap().is_some());
    }
    for id in [5i32, 22] {
        assert!(info.indexes[0].btree.get(&id.to_ne_bytes()).unwrap().is_none());
    }
}

#[test]
fn committed_work_is_untouched_by_later_abort() {
    let t = setup();
    create_users(&t.db, false);

    let t1 = t.db.begin();
    let info = t.db.catalog.table("users").unwrap();
    execute_insert(t.db.context(&t1), &info, &user_row(1, "stay", 0.0)).unwrap();
    t.db.commit(&t1).unwrap();

    let t2 = t.db.begin();
    execute_insert(t.db.context(&t2), &info, &user_row(2, "temp", 0.0)).unwrap();
    t.db.abort(&t2).unwrap();

    assert_eq!(scan_users(&t.db), vec![(1, "stay".to_string())]);
}

#[test]
fn rid_reuse_after_abort_keeps_scans_consistent() {
    let t = setup();
    create_users(&t.db, true);
    for id in 1..=3 {
        insert_committed(&t.db, "users", &user_row(id, "row", 0.0));
    }

    // Abort a delete of everything, twice. Rids are reused by the undo, so
    // repeated cycles must not grow the file or duplicate index entries.
    let info = t.db.catalog.table("users").unwrap();
    let pages_before = info.heap.header().num_pages;
    for _ in 0..2 {
        let txn = t.db.begin();
        execute_delete(t.db.context(&txn), &info, &[]).unwrap();
        t.db.abort(&txn).unwrap();
    }

    assert_eq!(info.heap.header().num_pages, pages_before);
    let mut ids: Vec<i32> = scan_users(&t.db).into_iter().map(|(id, _)| id).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3]);

    let txn = t.db.begin();
    let mut scan =
        IndexScanExecutor::new(t.db.context(&txn), Arc::clone(&info), 0, Vec::new());
    let mut count = 0;
    scan.begin().unwrap();
    while !scan.is_end() {
        count += 1;
        scan.next().unwrap();
    }
    t.db.commit(&txn).unwrap();
    assert_eq!(count, 3);
}

#[test]
fn finished_transactions_reject_further_outcomes() {
    let t = setup();
    let txn = t.db.begin();
    t.db.commit(&txn).unwrap();
    assert!(t.db.commit(&txn).is_err());
    assert!(t.db.abort(&txn).is_err());
}
