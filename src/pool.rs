// SPDX-FileCopyrightText: 2024 The depot-daemon Authors
//
// SPDX-License-Identifier: EUPL-1.2

//! A bounded pool of reusable resources with a failure latch.
//!
//! [`crate::store::DaemonStore`] keeps its connections here: a fixed number
//! of slots, an async factory that opens and handshakes a fresh connection,
//! and a validity predicate that retires poisoned or aged-out ones. The
//! first factory failure latches the pool; every later acquisition fails
//! immediately with [`Error::PoolFailed`] instead of hammering a daemon
//! that is not there.
//!
//! Resources are exclusively borrowed through a [`PoolGuard`] and return to
//! the idle set when the guard drops, unless the validity predicate rejects
//! them by then. Temporary over-subscription for re-entrant callers goes
//! through [`Pool::inc_capacity`].

use crate::{Error, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::trace;

type Factory<R> = Box<dyn Fn() -> Pin<Box<dyn Future<Output = Result<R>> + Send>> + Send + Sync>;
type Validator<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

struct State<R> {
    idle: VecDeque<R>,
    in_use: usize,
    extra_capacity: usize,
    failed: bool,
}

/// Outcome of a single, purely synchronous attempt to acquire a resource.
enum Acquisition<R> {
    Ready(R),
    MakeNew,
    Pending,
    Failed,
}

/// A bounded, failure-latching resource pool. See the module docs.
pub struct Pool<R> {
    max_size: usize,
    factory: Factory<R>,
    validator: Validator<R>,
    state: Mutex<State<R>>,
    wakeup: Notify,
}

impl<R: Send + 'static> Pool<R> {
    /// Creates a pool of at most `max_size` resources (clamped to at least
    /// one). `factory` constructs a fresh resource; `validator` decides
    /// whether an idle resource may be handed out again.
    pub fn new<F, Fut, V>(max_size: usize, factory: F, validator: V) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        V: Fn(&R) -> bool + Send + Sync + 'static,
    {
        Arc::new(Self {
            max_size: max_size.max(1),
            factory: Box::new(move || Box::pin(factory())),
            validator: Box::new(validator),
            state: Mutex::new(State {
                idle: VecDeque::new(),
                in_use: 0,
                extra_capacity: 0,
                failed: false,
            }),
            wakeup: Notify::new(),
        })
    }

    /// Acquires a resource: a valid idle one if available, a fresh one if
    /// there is capacity, and otherwise blocks until a borrower releases.
    ///
    /// A factory error is returned to the caller that raced it and latches
    /// the pool; from then on every call fails with [`Error::PoolFailed`]
    /// without invoking the factory.
    pub async fn get(self: &Arc<Self>) -> Result<PoolGuard<R>> {
        loop {
            let mut notified = std::pin::pin!(self.wakeup.notified());
            // Register for wakeups before looking at the state, so a release
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            match self.try_acquire() {
                Acquisition::Failed => return Err(Error::PoolFailed),
                Acquisition::Ready(resource) => {
                    return Ok(PoolGuard {
                        pool: self.clone(),
                        resource: Some(resource),
                    });
                }
                Acquisition::MakeNew => {
                    return match (self.factory)().await {
                        Ok(resource) => Ok(PoolGuard {
                            pool: self.clone(),
                            resource: Some(resource),
                        }),
                        Err(err) => {
                            self.record_factory_failure();
                            self.wakeup.notify_waiters();
                            Err(err)
                        }
                    };
                }
                Acquisition::Pending => {}
            }

            notified.await;
        }
    }

    // The locking in `get` is split into these non-async helpers so that no
    // `MutexGuard` is ever part of `get`'s async state machine, which would
    // otherwise make its future non-`Send` across the `.await` points.
    fn try_acquire(&self) -> Acquisition<R> {
        let mut state = self.state.lock().unwrap();
        if state.failed {
            return Acquisition::Failed;
        }
        while let Some(resource) = state.idle.pop_front() {
            if (self.validator)(&resource) {
                state.in_use += 1;
                return Acquisition::Ready(resource);
            }
            trace!("dropping invalid idle resource");
        }
        if state.in_use + state.idle.len() < self.max_size + state.extra_capacity {
            state.in_use += 1;
            return Acquisition::MakeNew;
        }
        Acquisition::Pending
    }

    fn record_factory_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.failed = true;
        state.in_use -= 1;
    }

    /// Permits one extra borrower beyond `max_size` until the returned guard
    /// drops. Used around operations whose payload may re-enter the store,
    /// so the nested call cannot deadlock on a full pool.
    pub fn inc_capacity(self: &Arc<Self>) -> CapacityGuard<R> {
        self.state.lock().unwrap().extra_capacity += 1;
        self.wakeup.notify_waiters();
        CapacityGuard { pool: self.clone() }
    }

    /// Whether a factory failure has latched the pool.
    pub fn is_failed(&self) -> bool {
        self.state.lock().unwrap().failed
    }

    /// Current `(idle, in_use, extra_capacity)` counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.idle.len(), state.in_use, state.extra_capacity)
    }

    fn release(&self, resource: R, poisoned: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.in_use -= 1;
            // Resources released while the pool is over capacity (a capacity
            // bracket just ended) are closed instead of idled, keeping
            // idle + in_use within max_size + extra_capacity.
            if !poisoned
                && (self.validator)(&resource)
                && state.idle.len() + state.in_use < self.max_size + state.extra_capacity
            {
                state.idle.push_back(resource);
            }
        }
        self.wakeup.notify_waiters();
    }
}

impl<R> std::fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (idle, in_use, extra) = {
            let state = self.state.lock().unwrap();
            (state.idle.len(), state.in_use, state.extra_capacity)
        };
        f.debug_struct("Pool")
            .field("max_size", &self.max_size)
            .field("idle", &idle)
            .field("in_use", &in_use)
            .field("extra_capacity", &extra)
            .finish_non_exhaustive()
    }
}

/// Exclusive borrow of one pooled resource. Dropping it returns the
/// resource to the idle set, unless [`PoolGuard::mark_bad`] was called or
/// the validity predicate rejects it.
pub struct PoolGuard<R: Send + 'static> {
    pool: Arc<Pool<R>>,
    resource: Option<R>,
}

impl<R: Send + std::fmt::Debug + 'static> std::fmt::Debug for PoolGuard<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl<R: Send + 'static> PoolGuard<R> {
    /// Closes the resource on drop instead of returning it to the pool.
    pub fn mark_bad(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource, true);
        }
    }
}

impl<R: Send + 'static> std::ops::Deref for PoolGuard<R> {
    type Target = R;
    fn deref(&self) -> &R {
        self.resource.as_ref().expect("resource already released")
    }
}
impl<R: Send + 'static> std::ops::DerefMut for PoolGuard<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("resource already released")
    }
}

impl<R: Send + 'static> Drop for PoolGuard<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource, false);
        }
    }
}

/// Scope guard for [`Pool::inc_capacity`]; decrements on drop.
pub struct CapacityGuard<R> {
    pool: Arc<Pool<R>>,
}

impl<R> Drop for CapacityGuard<R> {
    fn drop(&mut self) {
        self.pool.state.lock().unwrap().extra_capacity -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Fake {
        serial: usize,
        good: bool,
    }

    fn counting_pool(max_size: usize, made: Arc<AtomicUsize>) -> Arc<Pool<Fake>> {
        Pool::new(
            max_size,
            move || {
                let serial = made.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(Fake {
                        serial,
                        good: true,
                    })
                }
            },
            |r: &Fake| r.good,
        )
    }

    #[tokio::test]
    async fn test_reuses_idle_resource() {
        let made = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(4, made.clone());

        let first = pool.get().await.unwrap();
        assert_eq!(0, first.serial);
        drop(first);

        let second = pool.get().await.unwrap();
        assert_eq!(0, second.serial);
        assert_eq!(1, made.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_blocks_at_capacity() {
        let made = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(1, made.clone());

        let guard = pool.get().await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.get().await.unwrap().serial });

        // The waiter cannot make progress while the only slot is borrowed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(0, waiter.await.unwrap());
        assert_eq!(1, made.load(Ordering::SeqCst), "factory ran twice");
    }

    #[tokio::test]
    async fn test_factory_failure_latches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let pool: Arc<Pool<Fake>> = Pool::new(
            2,
            move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Protocol("connection refused".into())) }
            },
            |_| true,
        );

        // The caller that raced the factory sees the underlying error.
        match pool.get().await {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected factory error, got {:?}", other),
        }
        assert!(pool.is_failed());

        // Everyone after that gets the latch, without a factory call.
        match pool.get().await {
            Err(Error::PoolFailed) => {}
            other => panic!("expected PoolFailed, got {:?}", other),
        }
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_extra_capacity_allows_reentrant_get() {
        let made = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(1, made.clone());

        let outer = pool.get().await.unwrap();
        let capacity = pool.inc_capacity();
        let inner = pool.get().await.unwrap();
        assert_ne!(outer.serial, inner.serial);

        let (idle, in_use, extra) = pool.counts();
        assert!(idle + in_use <= pool.max_size + extra);

        drop(inner);
        drop(capacity);
        drop(outer);
        // The slot freed by the capacity bracket does not linger: releasing
        // past capacity closes the surplus resource.
        let (idle, in_use, extra) = pool.counts();
        assert_eq!((1, 0, 0), (idle, in_use, extra));
    }

    #[tokio::test]
    async fn test_invalid_resources_are_dropped() {
        let made = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(2, made.clone());

        let mut guard = pool.get().await.unwrap();
        guard.good = false;
        drop(guard); // fails validation, not returned to idle

        assert_eq!((0, 0, 0), pool.counts());
        let next = pool.get().await.unwrap();
        assert_eq!(1, next.serial, "expected a fresh resource");
    }

    #[tokio::test]
    async fn test_mark_bad_closes_resource() {
        let made = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool(2, made.clone());

        let mut guard = pool.get().await.unwrap();
        guard.mark_bad();
        drop(guard);

        assert_eq!((0, 0, 0), pool.counts());
        assert_eq!(1, pool.get().await.unwrap().serial);
    }
}
