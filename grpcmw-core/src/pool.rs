//! A small object pool for mutable codec state.
//!
//! Instances are handed out through [`PoolGuard`], which gives the holder
//! exclusive access and puts the instance back when it goes out of scope,
//! including on early returns and unwinding. Pooled values may be in any
//! state when handed out; callers reset them before use.

use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Idle instances kept per pool unless configured otherwise.
pub const DEFAULT_MAX_IDLE: usize = 64;

/// Concurrency-safe pool of reusable values.
///
/// There is no fairness or ordering guarantee between callers. Instances
/// beyond `max_idle` are dropped on release instead of being retained.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self::with_max_idle(DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Take an idle instance, or build one with `make` when none is idle.
    ///
    /// The lock is held only while popping, never while `make` runs.
    pub fn acquire(&self, make: impl FnOnce() -> T) -> PoolGuard<'_, T> {
        let item = self.idle.lock().pop().unwrap_or_else(make);
        PoolGuard {
            pool: self,
            item: Some(item),
        }
    }

    /// Number of instances currently idle.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, item: T) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// Exclusive handle on a pooled instance.
pub struct PoolGuard<'a, T> {
    pool: &'a Pool<T>,
    /// `Some` from acquisition until drop or [`PoolGuard::discard`].
    item: Option<T>,
}

impl<T> PoolGuard<'_, T> {
    /// Drop the instance instead of returning it, for state a failed use
    /// may have left inconsistent.
    pub fn discard(mut self) {
        self.item = None;
    }
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled instance used after discard"),
        }
    }
}

impl<T> DerefMut for PoolGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled instance used after discard"),
        }
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}
