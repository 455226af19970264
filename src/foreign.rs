//! Owning handles pinned to their origin shard
//!
//! Shard-local objects must be destroyed on the shard that created them,
//! so their destructors can touch shard-local state without locks.
//! `Foreign<T>` wraps a value together with its origin shard id: the
//! handle moves freely across shards, but dropping it off-origin
//! dispatches the release back home, and by-reference access off-origin
//! is refused; copy to local instead.

use std::ops::Deref;

use crate::smp;

pub struct Foreign<T: Send + 'static> {
    value: Option<T>,
    origin: usize,
}

impl<T: Send + 'static> Foreign<T> {
    /// Wrap `value`, recording the calling shard as its origin.
    pub fn new(value: T) -> Self {
        Self {
            value: Some(value),
            origin: smp::this_shard_id(),
        }
    }

    pub fn origin_shard(&self) -> usize {
        self.origin
    }

    pub fn on_origin(&self) -> bool {
        smp::this_shard_id() == self.origin
    }

    /// Copy the value to the current shard, leaving the origin copy
    /// untouched.
    pub fn make_local_copy(&self) -> T
    where
        T: Clone,
    {
        self.value.as_ref().expect("foreign value already released").clone()
    }

    /// Extract the value. Only valid on the origin shard.
    pub fn into_inner(mut self) -> T {
        assert!(self.on_origin(), "into_inner() off the origin shard");
        self.value.take().expect("foreign value already released")
    }
}

impl<T: Send + 'static> Deref for Foreign<T> {
    type Target = T;

    /// By-reference access, origin shard only.
    fn deref(&self) -> &T {
        assert!(
            self.on_origin(),
            "foreign value dereferenced off its origin shard"
        );
        self.value.as_ref().expect("foreign value already released")
    }
}

impl<T: Send + 'static> Drop for Foreign<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        if self.on_origin() {
            drop(value);
        } else {
            smp::submit_to(self.origin, move || drop(value)).discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_util::with_reactor;
    use std::rc::Rc;

    #[test]
    fn on_origin_releases_inline() {
        with_reactor(|_r| {
            let handle = Foreign::new(vec![1, 2, 3]);
            assert!(handle.on_origin());
            assert_eq!(handle.origin_shard(), 0);
            assert_eq!(*handle, vec![1, 2, 3]);
            assert_eq!(handle.into_inner(), vec![1, 2, 3]);
        });
    }

    #[test]
    fn make_local_copy_leaves_original() {
        with_reactor(|_r| {
            let handle = Foreign::new(String::from("pinned"));
            let copy = handle.make_local_copy();
            assert_eq!(copy, "pinned");
            assert_eq!(&*handle, "pinned");
        });
    }

    #[test]
    fn drop_count_is_exactly_one() {
        struct Counted(Rc<std::cell::Cell<u32>>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }
        // Rc is fine here: the value never leaves shard 0.
        unsafe impl Send for Counted {}

        with_reactor(|_r| {
            let drops = Rc::new(std::cell::Cell::new(0));
            let handle = Foreign::new(Counted(drops.clone()));
            drop(handle);
            assert_eq!(drops.get(), 1);
        });
    }
}
