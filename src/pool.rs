//! Fixed-capacity object pools.
//!
//! Slots are allocated once at construction and handed out through a
//! lock-free free list, so the steady state never touches the allocator.
//! A [`Pooled`] guard gives exclusive access to one slot and gives it back
//! when dropped, after running [`Reusable::recycle`] on the contents.

use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

use crossbeam::queue::ArrayQueue;
use triomphe::Arc;

/// Hook run on a slot right before it goes back to the free list.
pub trait Reusable {
    fn recycle(&mut self) {}
}

struct RawPool<T> {
    name: String,
    free_list: ArrayQueue<usize>,
    slots: Box<[UnsafeCell<T>]>,
}

// SAFETY: a slot index is owned by at most one `Pooled` at a time (it is
// either in the free list or inside exactly one guard), so concurrent access
// to distinct slots never aliases.
unsafe impl<T: Send> Send for RawPool<T> {}
unsafe impl<T: Send> Sync for RawPool<T> {}

impl<T> RawPool<T> {
    #[inline]
    fn dealloc(&self, index: usize) {
        let rv = self.free_list.push(index);
        debug_assert!(rv.is_ok(), "{}: slot {index} released twice", self.name);
    }
}

/// A shared handle to a pool. Cloning the handle does not clone the slots.
pub struct ObjectPool<T> {
    inner: Arc<RawPool<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl<T: Reusable + Send> ObjectPool<T> {
    /// Creates a pool of `nslot` objects built by `init`.
    pub fn new_with(name: impl Into<String>, nslot: usize, mut init: impl FnMut() -> T) -> Self {
        let nslot = nslot.max(1);
        let mut slots = Vec::with_capacity(nslot);
        for _ in 0..nslot {
            slots.push(UnsafeCell::new(init()));
        }

        let free_list = ArrayQueue::new(nslot);
        for i in 0..nslot {
            // the queue has exactly `nslot` places
            let _ = free_list.push(i);
        }

        Self {
            inner: Arc::new(RawPool {
                name: name.into(),
                free_list,
                slots: slots.into_boxed_slice(),
            }),
        }
    }

    /// Takes a slot out of the pool, `None` when the pool is exhausted.
    ///
    /// The slot keeps whatever a previous user left in it after recycling.
    #[inline]
    pub fn alloc(&self) -> Option<Pooled<T>> {
        let index = self.inner.free_list.pop()?;
        Some(Pooled {
            index,
            pool: Arc::clone(&self.inner),
        })
    }
}

impl<T: Reusable + Default + Send> ObjectPool<T> {
    pub fn new(name: impl Into<String>, nslot: usize) -> Self {
        Self::new_with(name, nslot, T::default)
    }
}

impl<T> ObjectPool<T> {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of free slots at the time of the call.
    pub fn available(&self) -> usize {
        self.inner.free_list.len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}

/// Exclusive ownership of one pool slot.
pub struct Pooled<T: Reusable> {
    index: usize,
    pool: Arc<RawPool<T>>,
}

// SAFETY: the guard is the only path to its slot.
unsafe impl<T: Reusable + Send> Send for Pooled<T> {}
unsafe impl<T: Reusable + Sync> Sync for Pooled<T> {}

impl<T: Reusable> Pooled<T> {
    /// Index of the slot inside its pool.
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Checks whether this guard was handed out by `pool`.
    pub fn belongs_to(&self, pool: &ObjectPool<T>) -> bool {
        Arc::ptr_eq(&self.pool, &pool.inner)
    }
}

impl<T: Reusable> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: see `RawPool` Send/Sync impls.
        unsafe { &*self.pool.slots[self.index].get() }
    }
}

impl<T: Reusable> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `RawPool` Send/Sync impls.
        unsafe { &mut *self.pool.slots[self.index].get() }
    }
}

impl<T: Reusable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("slot", &self.index)
            .field("value", &**self)
            .finish()
    }
}

impl<T: Reusable> Drop for Pooled<T> {
    fn drop(&mut self) {
        self.deref_mut().recycle();
        self.pool.dealloc(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default, Debug)]
    struct Slot {
        value: u32,
    }

    impl Reusable for Slot {
        fn recycle(&mut self) {
            self.value = 0;
        }
    }

    #[test]
    fn test_exhaustion_and_return() {
        let pool: ObjectPool<Slot> = ObjectPool::new("test", 2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), 2);
        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.alloc().unwrap();
        assert_ne!(c.slot(), b.slot());
    }

    #[test]
    fn test_recycle_runs_on_drop() {
        let pool: ObjectPool<Slot> = ObjectPool::new("test", 1);
        let mut a = pool.alloc().unwrap();
        a.value = 42;
        drop(a);
        let a = pool.alloc().unwrap();
        assert_eq!(a.value, 0);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        static RECYCLED: AtomicUsize = AtomicUsize::new(0);

        #[derive(Default)]
        struct Counted;
        impl Reusable for Counted {
            fn recycle(&mut self) {
                RECYCLED.fetch_add(1, Ordering::Relaxed);
            }
        }

        let pool: ObjectPool<Counted> = ObjectPool::new("mt", 8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(obj) = pool.alloc() {
                            drop(obj);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.available(), 8);
        assert!(RECYCLED.load(Ordering::Relaxed) > 0);
    }
}
