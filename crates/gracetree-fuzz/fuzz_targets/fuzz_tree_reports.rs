#![no_main]
use gracetree_core::tree::geometry::Geometry;
use gracetree_core::tree::{CombiningTree, ReportOutcome};
use libfuzzer_sys::fuzz_target;

// Arbitrary shape, membership and report order: the root must clear exactly
// once, on the last expected report, and duplicates must be stale.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let contexts = 1 + usize::from(u16::from_le_bytes([data[0], data[1]]) % 512);
    let fanout_leaf = 2 + usize::from(data[2] % 63);
    let fanout = 2 + usize::from(data[3] % 63);
    let Ok(geometry) = Geometry::compute(contexts, fanout_leaf, fanout) else {
        return;
    };
    let tree = CombiningTree::new(geometry);
    let body = &data[4..];

    let online: Vec<bool> = (0..contexts)
        .map(|c| body.get(c / 8).is_none_or(|b| b & (1 << (c % 8)) != 0))
        .collect();
    for (ctx, &up) in online.iter().enumerate() {
        tree.set_context_online(ctx, up);
    }
    tree.initialize_epoch(1);

    let mut order: Vec<usize> = (0..contexts).filter(|&c| online[c]).collect();
    for (i, &b) in body.iter().enumerate() {
        if order.len() > 1 {
            let j = usize::from(b) % order.len();
            order.swap(i % order.len(), j);
        }
    }

    let mut cleared = 0;
    for (i, &ctx) in order.iter().enumerate() {
        let (leaf, bit) = (tree.leaf_of(ctx), tree.context_bit(ctx));
        if tree.report_quiescent_state(leaf, bit, 1) == ReportOutcome::RootCleared {
            cleared += 1;
            assert_eq!(i + 1, order.len());
        }
        assert_eq!(tree.report_quiescent_state(leaf, bit, 1), ReportOutcome::Stale);
    }
    assert_eq!(cleared, usize::from(!order.is_empty()));
    assert!(tree.root_quiescent());
});
