use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use std::sync::{Arc, Mutex};
use tessera_core::{paint_ops, BoardDocument, BoardOp, ChangeOrigin, Shape, Tile, TileLayer};

fn terrain_field(size: i32) -> Vec<Tile> {
    let mut tiles = Vec::new();
    for y in 0..size {
        for x in 0..size {
            tiles.push(Tile::new(x, y, "grass", TileLayer::Terrain));
        }
    }
    tiles
}

fn bench_local_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("Board Document");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add_shape_local", |b| {
        // Grows with every iteration; measures steady-state insert cost.
        let doc = BoardDocument::new("bench");
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let shape = Shape::rect(format!("s{}", n), 10.0, 10.0, 50.0, 50.0);
            doc.apply(black_box(&[BoardOp::AddShape { shape }])).unwrap();
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Board Document");
    group.throughput(Throughput::Elements(1));

    let source = BoardDocument::new("bench");
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let _sub = source
        .observe_updates(move |origin, update| {
            if origin == ChangeOrigin::Local {
                sink.lock().unwrap().push(update.to_vec());
            }
        })
        .unwrap();
    let ops: Vec<BoardOp> = terrain_field(8)
        .into_iter()
        .map(|tile| BoardOp::AddTile { tile })
        .collect();
    source.apply(&ops).unwrap();
    let delta = captured.lock().unwrap()[0].clone();

    group.bench_function("apply_remote_delta", |b| {
        // Re-applying the same delta is idempotent.
        let dest = BoardDocument::new("bench");
        b.iter(|| {
            dest.apply_remote_update(black_box(&delta)).unwrap();
        })
    });

    group.finish();
}

fn bench_autotile(c: &mut Criterion) {
    let mut group = c.benchmark_group("Autotile");
    let tiles = terrain_field(32);

    group.bench_function("paint_ops_32x32", |b| {
        b.iter(|| black_box(paint_ops(black_box(&tiles), 16, 16, "sand", TileLayer::Terrain)))
    });

    group.finish();
}

criterion_group!(benches, bench_local_apply, bench_apply_remote, bench_autotile);
criterion_main!(benches);
