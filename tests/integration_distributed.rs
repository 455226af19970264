use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use minishard::{smp, Config, Distributed, Foreign, Service, ShardRuntime};

struct Counter {
    value: u64,
}

impl Service for Counter {}

// Shard id + 1 of the thread that dropped the recorder (0 = not yet).
static DROP_SHARD: AtomicUsize = AtomicUsize::new(0);

struct DropRecorder;

impl Drop for DropRecorder {
    fn drop(&mut self) {
        DROP_SHARD.store(smp::this_shard_id() + 1, Ordering::SeqCst);
    }
}

// Counter service on 3 shards: invoke_on_all increments each local
// instance once, map_reduce sums to the shard count. A Foreign handle
// created on shard 1 and dropped on shard 0 is released on shard 1.
#[test]
fn distributed_map_reduce_and_foreign_release() {
    let cfg = Config {
        smp: Some(3),
        handle_sigint: false,
        ..Config::default()
    };
    let rt = ShardRuntime::new(&cfg).expect("runtime setup");
    let code = rt.run(|| {
        let service = Rc::new(RefCell::new(Distributed::<Counter>::new()));

        let inc_svc = service.clone();
        let sum_svc = service.clone();
        let stop_svc = service.clone();
        let fut = service
            .borrow_mut()
            .start(|| Counter { value: 0 })
            .and_then(move |_| {
                let fanout = inc_svc.borrow().invoke_on_all(|c| c.value += 1);
                fanout
            })
            .and_then(move |_| {
                let folded = sum_svc
                    .borrow()
                    .map_reduce(0u64, |c| c.value, |a, b| a + b);
                folded
            })
            .and_then(|total| {
                assert_eq!(total, 3, "one increment per shard");
                // Pin a value to shard 1, drop its handle here on shard 0.
                smp::submit_to(1, || Foreign::new(DropRecorder))
            })
            .and_then(|handle| {
                assert_eq!(handle.origin_shard(), 1);
                assert!(!handle.on_origin());
                drop(handle);
                // FIFO per (0, 1) pair: this call runs after the
                // dispatched release.
                smp::submit_to(1, || DROP_SHARD.load(Ordering::SeqCst))
            })
            .and_then(move |dropped_on| {
                assert_eq!(dropped_on, 2, "released on its origin shard");
                let stopped = stop_svc.borrow_mut().stop();
                stopped
            })
            .then(|_| ());
        fut
    });
    assert_eq!(code, 0);
}
