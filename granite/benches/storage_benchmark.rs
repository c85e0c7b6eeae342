use criterion::{Criterion, black_box, criterion_group, criterion_main};
use granite::Database;
use granite::executor::execute_insert;
use granite::types::{ColumnDef, Value};
use tempfile::tempdir;

fn bench_heap_inserts(c: &mut Criterion) {
    c.bench_function("heap_insert_committed", |b| {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.catalog
            .create_table("bench", &[ColumnDef::int("id"), ColumnDef::str("payload", 64)])
            .unwrap();
        let info = db.catalog.table("bench").unwrap();

        let mut next_id = 0i32;
        b.iter(|| {
            let txn = db.begin();
            execute_insert(
                db.context(&txn),
                &info,
                &[
                    Value::Int(next_id),
                    Value::Str("x".repeat(32)),
                ],
            )
            .unwrap();
            db.commit(&txn).unwrap();
            next_id += 1;
            black_box(next_id);
        });
    });
}

fn bench_indexed_lookup(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    db.catalog
        .create_table("bench", &[ColumnDef::int("id"), ColumnDef::str("payload", 64)])
        .unwrap();
    db.catalog.create_index("bench", &["id"]).unwrap();
    let info = db.catalog.table("bench").unwrap();

    let txn = db.begin();
    for id in 0..10_000i32 {
        execute_insert(
            db.context(&txn),
            &info,
            &[Value::Int(id), Value::Str("payload".to_string())],
        )
        .unwrap();
    }
    db.commit(&txn).unwrap();

    c.bench_function("btree_point_lookup", |b| {
        let mut key = 0i32;
        b.iter(|| {
            let rid = info.indexes[0]
                .btree
                .get(&key.to_ne_bytes())
                .unwrap()
                .unwrap();
            black_box(rid);
            key = (key + 7919) % 10_000;
        });
    });
}

criterion_group!(benches, bench_heap_inserts, bench_indexed_lookup);
criterion_main!(benches);
