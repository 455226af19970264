use std::time::Duration;

use minishard::future::Future;
use minishard::{Config, ShardRuntime};

// SIGINT is routed to shard 0 and, by default, initiates a clean
// shutdown with exit code 0.
#[test]
fn sigint_initiates_clean_shutdown() {
    let cfg = Config {
        smp: Some(2),
        ..Config::default()
    };
    let rt = ShardRuntime::new(&cfg).expect("runtime setup");

    std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(200));
        unsafe { libc::raise(libc::SIGINT) };
    });

    let code = rt.run(|| {
        // Nothing to do; shutdown must come from the signal.
        let (never, promise) = Future::<()>::new();
        std::mem::forget(promise);
        never
    });
    assert_eq!(code, 0);
}
