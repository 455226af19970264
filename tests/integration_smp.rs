use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use minishard::future::when_all;
use minishard::{smp, timer, Config, ShardRuntime};

// Cross-shard RPC on 4 shards: completion order matches submission order,
// permits return to 128, and the 128-permit semaphore suspends the
// overflow submitters instead of failing them.
#[test]
fn cross_shard_rpc_order_permits_and_backpressure() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let cfg = Config {
        smp: Some(4),
        handle_sigint: false,
        ..Config::default()
    };
    let rt = ShardRuntime::new(&cfg).expect("runtime setup");
    let code = rt.run(|| {
        // Every destination resolves with the submitted value, self
        // included.
        let self_check: Vec<_> = (0..4)
            .map(|i| smp::submit_to(i, move || i * 11).then(move |v| assert_eq!(v, i * 11)))
            .collect();

        // 100 calls from shard 0 to shard 2; all resolve with 10, in
        // submission order, on shard 0.
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut calls = Vec::new();
        for k in 0..100 {
            let order = order.clone();
            calls.push(smp::submit_to(2, || 7 + 3).then(move |v| {
                assert_eq!(v, 10);
                order.borrow_mut().push(k);
            }));
        }
        let rpc = when_all(calls).then(move |_| {
            assert_eq!(*order.borrow(), (0..100).collect::<Vec<_>>());
            assert_eq!(
                smp::submit_permits_available(2),
                smp::QUEUE_LENGTH,
                "queue permits return after completion"
            );
        });

        // Saturate the (0 -> 1) queue with 200 sleeping tasks: exactly
        // 128 may be in flight, the other 72 suspend on the semaphore.
        let mut sleepers = Vec::new();
        for _ in 0..200 {
            sleepers.push(smp::submit_to_async(1, || {
                timer::sleep(Duration::from_millis(1))
            }));
        }
        assert_eq!(smp::submit_permits_available(1), 0);
        assert_eq!(smp::submit_waiters(1), 72);
        let backpressure = when_all(sleepers).then(|_| {
            assert_eq!(smp::submit_permits_available(1), smp::QUEUE_LENGTH);
            assert_eq!(smp::submit_waiters(1), 0);
        });

        when_all(vec![when_all(self_check), rpc, backpressure]).then(|_| ())
    });
    assert_eq!(code, 0);
}
