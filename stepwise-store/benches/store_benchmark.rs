use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stepwise_store::codec::{self, ColumnKind};
use stepwise_store::journal::{encode_frame, scan_frames, JournalOp, JournalRecord, RowOp};
use stepwise_store::table::StoredRow;
use stepwise_store::{Batch, ColumnSpec, NdArray, Projection, Record, Selection, Store, StoreConfig, TableRole, Value};

fn scalar_table(store: &mut Store) {
    let columns: Vec<ColumnSpec> = (0..10)
        .map(|i| ColumnSpec::new(format!("f{i}"), ColumnKind::Float))
        .collect();
    store.create_table("Bench", TableRole::Storing, &columns).unwrap();
}

fn scalar_record(v: f64) -> Record {
    (0..10).fold(Record::new(), |r, i| r.with(format!("f{i}"), v + i as f64))
}

fn bench_insert_scalar(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::new(dir.path(), "bench_insert", true).unwrap();
    scalar_table(&mut store);

    c.bench_function("insert_10_floats", |b| {
        b.iter(|| {
            black_box(store.insert("Bench", black_box(scalar_record(1.0))).unwrap());
        })
    });
}

fn bench_insert_batch(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::new(dir.path(), "bench_batch", true).unwrap();
    scalar_table(&mut store);
    let batch = (0..10).fold(Batch::new(), |b, i| {
        b.with(format!("f{i}"), (0..10_000).map(|n| n as f64))
    });

    c.bench_function("insert_batch_10k", |b| {
        b.iter(|| {
            black_box(store.insert_batch("Bench", black_box(batch.clone())).unwrap());
        })
    });
}

fn bench_array_encode(c: &mut Criterion) {
    let array = Value::Array(NdArray::vector((0..3 * 1024).map(|n| n as f64).collect()));

    c.bench_function("array_encode_3k", |b| {
        b.iter(|| {
            black_box(codec::encode(ColumnKind::Array, black_box(&array)).unwrap());
        })
    });
}

fn bench_array_decode(c: &mut Criterion) {
    let array = Value::Array(NdArray::vector((0..3 * 1024).map(|n| n as f64).collect()));
    let encoded = codec::encode(ColumnKind::Array, &array).unwrap().unwrap();

    c.bench_function("array_decode_3k", |b| {
        b.iter(|| {
            black_box(codec::decode(ColumnKind::Array, black_box(&encoded)).unwrap());
        })
    });
}

fn bench_frame_scan(c: &mut Criterion) {
    let mut bytes = Vec::new();
    for sequence in 0..1000u64 {
        let record = JournalRecord {
            sequence,
            ops: vec![JournalOp::Rows(RowOp::Insert {
                table: 1,
                rows: vec![StoredRow::placeholder(sequence as i64 + 1)],
            })],
        };
        bytes.extend_from_slice(&encode_frame(&record).unwrap());
    }

    c.bench_function("scan_1000_frames", |b| {
        b.iter(|| {
            black_box(scan_frames(black_box(&bytes), 0, None).unwrap());
        })
    });
}

fn bench_read_rows(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::new(dir.path(), "bench_read", true).unwrap();
    scalar_table(&mut store);
    for n in 0..1000 {
        store.insert("Bench", scalar_record(n as f64)).unwrap();
    }

    c.bench_function("get_columns_1000", |b| {
        b.iter(|| {
            black_box(
                store
                    .get_columns("Bench", &Selection::All, &Projection::fields(["f0", "f5"]))
                    .unwrap(),
            );
        })
    });
}

fn bench_reopen(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::new(dir.path(), "bench_reopen", true).unwrap();
    scalar_table(&mut store);
    let batch = (0..10).fold(Batch::new(), |b, i| {
        b.with(format!("f{i}"), (0..100_000).map(|n| n as f64))
    });
    store.insert_batch("Bench", batch).unwrap();
    let config: StoreConfig = store.config().clone();
    store.close(false).unwrap();

    c.bench_function("reopen_100k_rows", |b| {
        b.iter(|| {
            black_box(Store::open_read_only(config.clone()).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_insert_scalar,
    bench_insert_batch,
    bench_array_encode,
    bench_array_decode,
    bench_frame_scan,
    bench_read_rows,
    bench_reopen,
);
criterion_main!(benches);
