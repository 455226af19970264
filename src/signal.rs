//! Signal routing
//!
//! A single router thread owns the process signal handlers and forwards
//! deliveries to shard 0: the signal number goes down a channel drained
//! by shard 0's backend, and the shard's wake notifier kicks it out of a
//! blocking wait. `Backend::receive_signal` futures resolve from there.
//!
//! By default SIGINT and SIGTERM initiate a clean shutdown; set
//! `Config::handle_sigint` to false to install custom waiters instead.

use std::sync::{Mutex, Once};

use crossbeam_channel::Sender;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::backend::NotifierHandle;

static SINK: Mutex<Option<(Sender<i32>, NotifierHandle)>> = Mutex::new(None);
static ROUTER: Once = Once::new();

/// Point the router at shard 0's channel and wake notifier. Called when
/// shard 0's backend is constructed; the latest sink wins.
pub(crate) fn install_sink(tx: Sender<i32>, wake: NotifierHandle) {
    *SINK.lock().expect("signal sink poisoned") = Some((tx, wake));
}

/// Spawn the router thread. Idempotent.
pub(crate) fn start_router() {
    ROUTER.call_once(|| {
        std::thread::Builder::new()
            .name("signal-router".into())
            .spawn(|| {
                let mut signals =
                    Signals::new([SIGINT, SIGTERM]).expect("failed to install signal handlers");
                for signal in signals.forever() {
                    tracing::debug!(signal, "routing signal to shard 0");
                    let sink = SINK.lock().expect("signal sink poisoned");
                    if let Some((tx, wake)) = sink.as_ref() {
                        if tx.send(signal).is_ok() {
                            wake.signal();
                        }
                    }
                }
            })
            .expect("failed to spawn signal router");
    });
}
