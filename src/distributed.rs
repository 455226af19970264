//! Sharded services
//!
//! `Distributed<T>` manages one instance of `T` per shard. Slot *i* is
//! owned by shard *i*: construction, method invocation and destruction of
//! that instance all happen there. The handle itself only routes:
//! closures and results are owned (`Send`) values copied into the
//! message, never references across shards.

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::future::{join_all, make_ready_future, when_all, Future};
use crate::smp;

/// A service with one instance per shard.
pub trait Service: 'static {
    /// Invoked on the owning shard before the instance is destroyed.
    fn stop(&mut self) -> Future<()> {
        make_ready_future(())
    }
}

/// Lifecycle and fan-out for one `T` per shard.
///
/// Must be explicitly stopped: dropping a started `Distributed` without
/// [`stop`](Distributed::stop) is a bug and panics.
pub struct Distributed<T: Service> {
    instances: Arc<Vec<AtomicPtr<T>>>,
    started: bool,
}

impl<T: Service> Default for Distributed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Service> Distributed<T> {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(Vec::new()),
            started: false,
        }
    }

    fn slots(count: usize) -> Arc<Vec<AtomicPtr<T>>> {
        Arc::new((0..count).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect())
    }

    /// Construct one instance per shard by running `factory` on each.
    /// Resolves when every instance exists.
    pub fn start<F>(&mut self, factory: F) -> Future<()>
    where
        F: Fn() -> T + Clone + Send + 'static,
    {
        assert!(!self.started, "service started twice");
        let count = smp::shard_count();
        self.instances = Self::slots(count);
        self.started = true;
        let futs = (0..count)
            .map(|i| {
                let factory = factory.clone();
                let instances = self.instances.clone();
                smp::submit_to(i, move || {
                    let ptr = Box::into_raw(Box::new(factory()));
                    instances[i].store(ptr, Ordering::Release);
                })
            })
            .collect();
        when_all(futs)
    }

    /// Construct a single instance, on shard 0 only.
    pub fn start_single<F>(&mut self, factory: F) -> Future<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        assert!(!self.started, "service started twice");
        self.instances = Self::slots(smp::shard_count());
        self.started = true;
        let instances = self.instances.clone();
        smp::submit_to(0, move || {
            let ptr = Box::into_raw(Box::new(factory()));
            instances[0].store(ptr, Ordering::Release);
        })
    }

    /// Stop and destroy every instance on its owning shard.
    pub fn stop(&mut self) -> Future<()> {
        assert!(self.started, "stop() before start()");
        self.started = false;
        let futs = (0..self.instances.len())
            .map(|i| {
                let instances = self.instances.clone();
                smp::submit_to_async(i, move || {
                    let ptr = instances[i].swap(std::ptr::null_mut(), Ordering::AcqRel);
                    if ptr.is_null() {
                        return make_ready_future(());
                    }
                    // Owned again by the shard that created it.
                    let mut inst = unsafe { Box::from_raw(ptr) };
                    let stopped = inst.stop();
                    stopped.then(move |_| drop(inst))
                })
            })
            .collect();
        when_all(futs)
    }

    /// Run `f` against shard `id`'s instance, resolving with its return
    /// value on the calling shard.
    pub fn invoke_on<R, F>(&self, id: usize, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        assert!(self.started, "invoke_on() before start()");
        let instances = self.instances.clone();
        smp::submit_to(id, move || {
            let ptr = instances[id].load(Ordering::Acquire);
            assert!(!ptr.is_null(), "service instance missing on shard {id}");
            // The pointer is only dereferenced on the owning shard, and
            // shard tasks run sequentially.
            f(unsafe { &mut *ptr })
        })
    }

    /// Like [`invoke_on`](Distributed::invoke_on) for methods that return
    /// a future; it is awaited on the owning shard.
    pub fn invoke_on_async<R, F>(&self, id: usize, f: F) -> Future<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> Future<R> + Send + 'static,
    {
        assert!(self.started, "invoke_on_async() before start()");
        let instances = self.instances.clone();
        smp::submit_to_async(id, move || {
            let ptr = instances[id].load(Ordering::Acquire);
            assert!(!ptr.is_null(), "service instance missing on shard {id}");
            f(unsafe { &mut *ptr })
        })
    }

    /// Fan `f` out to every instance and join.
    pub fn invoke_on_all<F>(&self, f: F) -> Future<()>
    where
        F: Fn(&mut T) + Clone + Send + 'static,
    {
        let futs = (0..self.instances.len())
            .map(|i| self.invoke_on(i, f.clone()).then(|_| ()))
            .collect();
        when_all(futs)
    }

    /// Apply `map` on every shard and left-fold the results through
    /// `reduce`, starting from `initial`.
    pub fn map_reduce<R, M, Red>(&self, initial: R, map: M, reduce: Red) -> Future<R>
    where
        R: Send + 'static,
        M: Fn(&mut T) -> R + Clone + Send + 'static,
        Red: Fn(R, R) -> R + 'static,
    {
        let futs = (0..self.instances.len())
            .map(|i| self.invoke_on(i, map.clone()))
            .collect();
        join_all(futs).then(move |values| values.into_iter().fold(initial, reduce))
    }

    /// Run `f` against the calling shard's instance. Panics when the
    /// instance is not initialised here. Do not re-enter.
    pub fn with_local<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let id = smp::this_shard_id();
        assert!(
            self.local_is_initialized(),
            "service instance missing on shard {id}"
        );
        let ptr = self.instances[id].load(Ordering::Acquire);
        f(unsafe { &mut *ptr })
    }

    pub fn local_is_initialized(&self) -> bool {
        let id = smp::this_shard_id();
        id < self.instances.len() && !self.instances[id].load(Ordering::Acquire).is_null()
    }
}

impl<T: Service> Drop for Distributed<T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(!self.started, "distributed service dropped without stop()");
        }
    }
}
