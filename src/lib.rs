//! minishard: a shard-per-core async runtime
//!
//! This crate provides the execution substrate for shared-nothing servers:
//! - One reactor (event loop) per OS thread, one thread per shard
//! - Continuation-chained futures with deterministic error propagation
//! - Lock-free fixed-capacity message queues between every shard pair
//! - Byte streams over pollable file descriptors and DMA-style file I/O
//!
//! ## Execution model
//!
//! Each shard runs a single-threaded cooperative scheduler. Code never
//! blocks; every suspension point returns a [`Future`]. Parallelism exists
//! only across shards, mediated by the [`smp`] message queues.
//!
//! ```rust,no_run
//! use minishard::{smp, Config, ShardRuntime};
//!
//! let rt = ShardRuntime::new(&Config::default()).unwrap();
//! let code = rt.run(|| {
//!     smp::submit_to(1, || 7 + 3).then(|v| {
//!         println!("shard 1 says {v}");
//!     })
//! });
//! std::process::exit(code);
//! ```
//!
//! ## Shutdown
//!
//! Any shard may call [`smp::exit_all`]; shard 0 broadcasts the exit to
//! every other shard, exit hooks registered with `Reactor::at_exit` run in
//! reverse registration order, and `ShardRuntime::run` returns the exit
//! code once every shard thread has been joined.

pub mod backend;
pub mod blocking;
pub mod buffer;
pub mod config;
pub mod distributed;
pub mod file;
pub mod foreign;
pub mod future;
pub mod net;
pub mod pollable;
pub mod reactor;
pub mod signal;
pub mod smp;
pub mod stream;
pub mod sync;
pub mod task;
pub mod timer;

// Re-export core types
pub use buffer::{Buf, DmaBuffer};
pub use config::Config;
pub use distributed::{Distributed, Service};
pub use foreign::Foreign;
pub use future::{join_all, make_failed_future, make_ready_future, when_all, Future, Promise};
pub use pollable::PollableFd;
pub use reactor::Reactor;
pub use smp::ShardRuntime;
pub use stream::{InputStream, OutputStream};
pub use sync::Semaphore;
pub use task::Task;
pub use timer::{sleep, Timer};

/// Error types for the runtime
pub mod error {
    use thiserror::Error;

    /// Errors carried inside futures.
    ///
    /// Contract violations (resolving a promise twice, arming an armed
    /// timer, touching an uninitialised service instance) are bugs and
    /// panic instead of producing an `Error`.
    #[derive(Debug, Error)]
    pub enum Error {
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        /// The producing promise was dropped without being resolved.
        #[error("broken promise")]
        BrokenPromise,

        /// A semaphore wait was abandoned because the semaphore was broken
        /// during shutdown.
        #[error("wait cancelled")]
        WaitCancelled,

        #[error("operation timed out")]
        Timeout,

        /// An error that crossed a shard boundary without a lossless
        /// representation, e.g. a panic inside a shipped closure.
        #[error("remote shard error: {message}")]
        Remote { message: String },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}
