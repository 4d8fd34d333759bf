/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Creates and recycles objects held by a Pool.
pub trait PoolFactory<T>: Send + Sync {
    fn create(&self) -> T;
    fn reset(&self, obj: &mut T);
}

struct PoolInner<T, F: PoolFactory<T>> {
    factory: F,
    capacity: usize,
    free: Mutex<Vec<T>>,
    heap_allocations: AtomicU64,
}

/// A fixed-capacity object pool with heap fallback.
///
/// At most `capacity` objects are retained for reuse; when the pool is empty
/// get() falls back to a fresh allocation rather than blocking. Objects check
/// themselves back in when their Pooled handle drops, on every exit path.
pub struct Pool<T, F: PoolFactory<T>>(Arc<PoolInner<T, F>>);

impl<T, F: PoolFactory<T>> Pool<T, F> {
    pub fn new(capacity: usize, factory: F) -> Self {
        let inner = PoolInner {
            factory,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity)),
            heap_allocations: AtomicU64::new(0),
        };
        {
            let mut free = inner.free.lock();
            for _ in 0..capacity {
                free.push(inner.factory.create());
            }
        }
        Self(Arc::new(inner))
    }

    pub fn get(&self) -> Pooled<T, F> {
        let obj = self.0.free.lock().pop().unwrap_or_else(|| {
            self.0.heap_allocations.fetch_add(1, Ordering::Relaxed);
            self.0.factory.create()
        });
        Pooled { obj: Some(obj), pool: Arc::downgrade(&self.0) }
    }

    /// Number of objects currently checked in.
    pub fn available(&self) -> usize {
        self.0.free.lock().len()
    }

    /// Number of times the pool was empty and an extra allocation was made.
    pub fn heap_allocations(&self) -> u64 {
        self.0.heap_allocations.load(Ordering::Relaxed)
    }
}

impl<T, F: PoolFactory<T>> Clone for Pool<T, F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// An object borrowed from a Pool, returned on drop.
pub struct Pooled<T, F: PoolFactory<T>> {
    obj: Option<T>,
    pool: Weak<PoolInner<T, F>>,
}

impl<T, F: PoolFactory<T>> Deref for Pooled<T, F> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        self.obj.as_ref().unwrap()
    }
}

impl<T, F: PoolFactory<T>> DerefMut for Pooled<T, F> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().unwrap()
    }
}

impl<T, F: PoolFactory<T>> Drop for Pooled<T, F> {
    fn drop(&mut self) {
        if let Some(mut obj) = self.obj.take() {
            if let Some(pool) = self.pool.upgrade() {
                let mut free = pool.free.lock();
                if free.len() < pool.capacity {
                    pool.factory.reset(&mut obj);
                    free.push(obj);
                }
                // Above capacity the object is simply dropped; it came from
                // the heap-fallback path.
            }
        }
    }
}

unsafe impl<T: Send, F: PoolFactory<T>> Send for Pooled<T, F> {}

/// Factory producing reusable byte buffers of a fixed block size.
pub struct BufferFactory {
    block_size: usize,
}

impl BufferFactory {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

impl PoolFactory<Vec<u8>> for BufferFactory {
    fn create(&self) -> Vec<u8> {
        vec![0; self.block_size]
    }

    fn reset(&self, obj: &mut Vec<u8>) {
        obj.clear();
        obj.resize(self.block_size, 0);
    }
}

/// A pool of equal-size datagram buffers.
pub type BufferPool = Pool<Vec<u8>, BufferFactory>;

/// A datagram buffer checked out of a BufferPool.
pub type PooledBuffer = Pooled<Vec<u8>, BufferFactory>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_return() {
        let pool = BufferPool::new(2, BufferFactory::new(64));
        assert_eq!(pool.available(), 2);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(a.len(), 64);
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.heap_allocations(), 0);
    }

    #[test]
    fn heap_fallback_on_exhaustion() {
        let pool = BufferPool::new(1, BufferFactory::new(16));
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.heap_allocations(), 1);
        drop(b);
        drop(a);
        // Only `capacity` buffers are retained.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn reset_restores_block_size() {
        let pool = BufferPool::new(1, BufferFactory::new(32));
        {
            let mut a = pool.get();
            a.truncate(3);
        }
        assert_eq!(pool.get().len(), 32);
    }
}
