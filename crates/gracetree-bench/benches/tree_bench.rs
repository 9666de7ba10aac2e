//! Combining-tree fan-in: one full epoch of reports per iteration.

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gracetree_core::tree::CombiningTree;
use gracetree_core::tree::geometry::Geometry;

const SHAPES: [(usize, usize, usize); 4] = [(64, 16, 64), (256, 16, 64), (1024, 16, 16), (4096, 64, 64)];

fn bench_report_fan_in(c: &mut Criterion) {
    let mut group = c.benchmark_group("report_fan_in");
    for &(contexts, leaf, fanout) in &SHAPES {
        let tree = CombiningTree::new(Geometry::compute(contexts, leaf, fanout).unwrap());
        for ctx in 0..contexts {
            tree.set_context_online(ctx, true);
        }
        let targets: Vec<(usize, u64)> = (0..contexts)
            .map(|ctx| (tree.leaf_of(ctx), tree.context_bit(ctx)))
            .collect();

        group.throughput(Throughput::Elements(contexts as u64));
        let label = format!("{contexts}x{leaf}x{fanout}");
        let mut gp = 0u64;
        group.bench_function(BenchmarkId::new("epoch", label), |b| {
            b.iter(|| {
                gp += 1;
                tree.initialize_epoch(gp);
                for &(node, mask) in &targets {
                    black_box(tree.report_quiescent_state(node, mask, gp));
                }
                tree.complete_epoch(gp);
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2));
    targets = bench_report_fan_in
);
criterion_main!(benches);
