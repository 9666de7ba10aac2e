#![no_main]
use std::sync::{Arc, Mutex};

use gracetree_core::callbacks::CallbackQueue;
use libfuzzer_sys::fuzz_target;

// Drive one queue through arbitrary segment operations. Every callback must
// run exactly once, in enqueue order, once its epoch has completed.
fuzz_target!(|data: &[u8]| {
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut queue = CallbackQueue::new();
    let mut completed = 0u64;
    let mut next_id = 0u32;

    for chunk in data.chunks(2) {
        let op = chunk[0] % 6;
        let arg = chunk.get(1).copied().unwrap_or(0);
        match op {
            0 => {
                let ran = Arc::clone(&ran);
                let id = next_id;
                next_id += 1;
                queue.enqueue(Box::new(move || ran.lock().unwrap().push(id)));
            }
            1 => {
                queue.accelerate(completed + 1 + u64::from(arg % 2));
            }
            2 => {
                completed += u64::from(arg % 3);
                queue.advance(completed);
            }
            3 => {
                for cb in queue.take_ready(usize::from(arg % 8)) {
                    cb();
                }
            }
            4 => {
                let detached = queue.detach();
                assert!(queue.is_empty());
                queue.adopt(detached);
            }
            _ => queue.lower_epochs(completed + 1),
        }
        assert_eq!(queue.len(), queue.segment_lens().iter().sum::<usize>());
    }

    queue.accelerate(completed + 1);
    queue.advance(u64::MAX);
    for cb in queue.take_ready(usize::MAX) {
        cb();
    }
    assert!(queue.is_empty());

    let ran = ran.lock().unwrap();
    assert_eq!(ran.len(), next_id as usize);
    assert!(ran.windows(2).all(|w| w[0] < w[1]));
});
