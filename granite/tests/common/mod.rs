use granite::Database;
use granite::types::{ColumnDef, Value};
use std::sync::Arc;
use strata::transaction::Transaction;
use tempfile::TempDir;

pub struct TestDb {
    pub db: Database,
    _dir: TempDir,
}

pub fn setup() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    TestDb { db, _dir: dir }
}

/// `users(id int, name str(12), score float)`, optionally indexed on `id`.
pub fn create_users(db: &Database, with_index: bool) {
    db.catalog
        .create_table(
            "users",
            &[
                ColumnDef::int("id"),
                ColumnDef::str("name", 12),
                ColumnDef::float("score"),
            ],
        )
        .unwrap();
    if with_index {
        db.catalog.create_index("users", &["id"]).unwrap();
    }
}

pub fn user_row(id: i32, name: &str, score: f32) -> Vec<Value> {
    vec![
        Value::Int(id),
        Value::Str(name.to_string()),
        Value::Float(score),
    ]
}

/// Inserts one row in its own committed transaction.
pub fn insert_committed(db: &Database, table: &str, values: &[Value]) {
    let txn = db.begin();
    let info = db.catalog.table(table).unwrap();
    granite::executor::execute_insert(db.context(&txn), &info, values).unwrap();
    db.commit(&txn).unwrap();
}

/// All `(id, name)` pairs currently visible through a fresh committed scan.
pub fn scan_users(db: &Database) -> Vec<(i32, String)> {
    let txn = db.begin();
    let rows = scan_users_in(db, &txn);
    db.commit(&txn).unwrap();
    rows
}

pub fn scan_users_in(db: &Database, txn: &Arc<Transaction>) -> Vec<(i32, String)> {
    use granite::executor::{Executor, SeqScanExecutor};
    use granite::types::decode_tuple;

    let info = db.catalog.table("users").unwrap();
    let mut scan = SeqScanExecutor::new(db.context(txn), Arc::clone(&info), Vec::new());
    let mut out = Vec::new();
    scan.begin().unwrap();
    while !scan.is_end() {
        let tuple = scan.current().unwrap().unwrap();
        let row = decode_tuple(&tuple, &info.columns);
        match (&row[0], &row[1]) {
            (Value::Int(id), Value::Str(name)) => out.push((*id, name.clone())),
            _ => unreachable!(),
        }
        scan.next().unwrap();
    }
    out
}
