//! Fixed-size blocking pool of reusable handles.
//!
//! All `max_size` items are created up front. Items are cheap handles (the
//! pool keeps a clone of each for teardown), so `T: Clone` should share state
//! rather than copy it. An item is either idle in the queue or held by
//! exactly one [`Checkout`].

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use clamwire_core::PoolError;
use tracing::{debug, trace};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

type Validator<T> = Box<dyn Fn(T) -> T + Send + Sync>;

/// An item borrowed from a [`Pool`]. Hand it back with [`Pool::put`];
/// a checkout that is dropped instead takes its slot out of circulation.
#[must_use = "a checkout must be returned with Pool::put"]
#[derive(Debug)]
pub struct Checkout<T> {
    pool_id: usize,
    slot: usize,
    item: T,
}

impl<T> Checkout<T> {
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }
}

impl<T> Deref for Checkout<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

struct PoolState<T> {
    /// Every item ever created, by slot. Authoritative for teardown.
    items: Vec<T>,
    idle: VecDeque<usize>,
    /// Bumped by `interrupt`; waiters that see it change give up.
    interrupts: u64,
    destroyed: bool,
}

pub struct Pool<T> {
    id: usize,
    max_size: usize,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    validator: Option<Validator<T>>,
}

impl<T: Clone> Pool<T> {
    /// Create `max_size` items with `factory` and queue them all.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::EmptyItem` if the factory yields `None`.
    pub fn init(
        max_size: usize,
        mut factory: impl FnMut() -> Option<T>,
    ) -> Result<Self, PoolError> {
        let mut items = Vec::with_capacity(max_size);
        for _ in 0..max_size {
            items.push(factory().ok_or(PoolError::EmptyItem)?);
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(pool = id, max_size, "pool filled");

        Ok(Self {
            id,
            max_size,
            state: Mutex::new(PoolState {
                items,
                idle: (0..max_size).collect(),
                interrupts: 0,
                destroyed: false,
            }),
            available: Condvar::new(),
            validator: None,
        })
    }

    /// Install a hook run on every item between checkout and hand-off. The
    /// returned item replaces the pooled one, so a broken handle can be
    /// swapped for a working one. Runs under the pool lock.
    #[must_use]
    pub fn with_validator(mut self, validator: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Block until an item is free. Returns `None` if the wait is
    /// interrupted or the pool is destructed meanwhile.
    pub fn get(&self) -> Option<Checkout<T>> {
        self.checkout(None).ok().flatten()
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Exhausted` if nothing frees up in time.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<Checkout<T>>, PoolError> {
        self.checkout(Some(timeout))
    }

    fn checkout(&self, timeout: Option<Duration>) -> Result<Option<Checkout<T>>, PoolError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        let epoch = state.interrupts;

        loop {
            if state.destroyed || state.interrupts != epoch {
                trace!(pool = self.id, "checkout abandoned");
                return Ok(None);
            }

            if let Some(slot) = state.idle.pop_front() {
                let mut item = state.items[slot].clone();
                if let Some(validate) = &self.validator {
                    item = validate(item);
                    state.items[slot] = item.clone();
                }
                trace!(pool = self.id, slot, idle = state.idle.len(), "checked out");
                return Ok(Some(Checkout {
                    pool_id: self.id,
                    slot,
                    item,
                }));
            }

            state = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Exhausted(timeout));
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                _ => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Return a checked-out item. After [`destruct`](Self::destruct) the item
    /// is simply dropped.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ForeignItem` for a checkout issued by another pool
    /// and `PoolError::Overflow` if the slot is somehow already idle.
    pub fn put(&self, checkout: Checkout<T>) -> Result<(), PoolError> {
        if checkout.pool_id != self.id {
            return Err(PoolError::ForeignItem);
        }

        let mut state = self.lock();
        if state.destroyed {
            debug!(pool = self.id, slot = checkout.slot, "put after destruct, dropping item");
            return Ok(());
        }
        if state.idle.len() >= self.max_size || state.idle.contains(&checkout.slot) {
            return Err(PoolError::Overflow {
                max_size: self.max_size,
            });
        }

        state.idle.push_back(checkout.slot);
        trace!(pool = self.id, slot = checkout.slot, idle = state.idle.len(), "returned");
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Wake every thread blocked in `get`/`get_timeout`; each returns `None`.
    pub fn interrupt(&self) {
        self.lock().interrupts += 1;
        self.available.notify_all();
    }

    /// Dispose of every item ever created, checked out or not. Later calls
    /// are no-ops.
    pub fn destruct(&self, mut destructor: impl FnMut(&T)) {
        let items = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.idle.clear();
            std::mem::take(&mut state.items)
        };
        self.available.notify_all();

        debug!(pool = self.id, items = items.len(), "destructing pool");
        for item in &items {
            destructor(item);
        }
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Items currently idle in the queue.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock().idle.len()
    }

    /// Items currently held by callers.
    #[must_use]
    pub fn checked_out(&self) -> usize {
        let state = self.lock();
        state.items.len() - state.idle.len()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
