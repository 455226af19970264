use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use minishard::future::Future;
use minishard::{smp, timer, Config, ShardRuntime, Timer};

// Periodic 10 ms timer: ~10 firings in 105 ms, none after cancel. The
// runtime exit code passes through exit_all().
#[test]
fn periodic_timer_and_exit_code() {
    let cfg = Config {
        smp: Some(1),
        handle_sigint: false,
        ..Config::default()
    };
    let rt = ShardRuntime::new(&cfg).expect("runtime setup");
    let code = rt.run(|| {
        let counter = Rc::new(Cell::new(0u32));
        let periodic = Rc::new(RefCell::new(Timer::new()));
        {
            let counter = counter.clone();
            periodic
                .borrow_mut()
                .set_callback(move || counter.set(counter.get() + 1));
        }
        periodic.borrow_mut().arm_periodic(Duration::from_millis(10));

        let cancel_handle = periodic.clone();
        timer::sleep(Duration::from_millis(105))
            .and_then(move |_| {
                // Expired periods catch up before this callback runs, so
                // the count is exact even under scheduling jitter.
                let seen = counter.get();
                assert!(
                    (10..=11).contains(&seen),
                    "expected 10-11 firings, got {seen}"
                );
                assert!(cancel_handle.borrow_mut().cancel());
                timer::sleep(Duration::from_millis(50)).then(move |_| {
                    assert_eq!(counter.get(), seen, "no firings after cancel");
                    smp::exit_all(5);
                })
            })
            .discard();

        // Shutdown comes from exit_all(); keep the main future pending.
        let (never, promise) = Future::<()>::new();
        std::mem::forget(promise);
        never
    });
    assert_eq!(code, 5);
}
