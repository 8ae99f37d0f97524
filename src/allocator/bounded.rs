//! Capacity-limited, awaitable wrapper around [`IdAllocator`].
//!
//! The wrapper caps the number of simultaneously active ids. Instead of
//! failing at the cap, [`BoundedIdAllocator::allocate`] suspends until an id is
//! freed. A level-triggered "not full" flag (`tokio::sync::watch`) is
//! recomputed after every allocate and free and wakes the waiters.
//!
//! [`IdLease`] is the RAII form: the id returns to the allocator when the
//! lease is dropped, on every exit path of the holder.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use super::range_set::{IdAllocator, ID_SPACE};
use crate::defect;
use crate::error::{MbapError, Result};

/// Transaction id allocator with a cap on active ids.
#[derive(Debug)]
pub struct BoundedIdAllocator {
    inner: Mutex<IdAllocator>,
    capacity: usize,
    not_full: watch::Sender<bool>,
}

impl BoundedIdAllocator {
    /// Create an allocator allowing `capacity` active ids (1..=65536).
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > ID_SPACE {
            return Err(MbapError::Parameter(format!(
                "capacity {} outside 1..={}",
                capacity, ID_SPACE
            )));
        }
        let (not_full, _) = watch::channel(true);
        Ok(Self {
            inner: Mutex::new(IdAllocator::new()),
            capacity,
            not_full,
        })
    }

    fn lock(&self) -> MutexGuard<'_, IdAllocator> {
        // Every mutation is a single Vec operation; a poisoned free set is
        // still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, active: usize) {
        let not_full = active < self.capacity;
        self.not_full.send_if_modified(|current| {
            let changed = *current != not_full;
            *current = not_full;
            changed
        });
    }

    /// Allocate an id if below capacity, without waiting.
    pub fn try_allocate(&self) -> Result<Option<u16>> {
        let mut inner = self.lock();
        if inner.active_count() >= self.capacity {
            return Ok(None);
        }
        let id = inner.allocate()?;
        self.publish(inner.active_count());
        Ok(Some(id))
    }

    /// Allocate an id, waiting while the allocator is at capacity.
    pub async fn allocate(&self) -> Result<u16> {
        let mut not_full = self.not_full.subscribe();
        loop {
            if let Some(id) = self.try_allocate()? {
                return Ok(id);
            }
            // The sender is owned by `self`, so the channel cannot close here.
            let _ = not_full.wait_for(|free| *free).await;
        }
    }

    /// Allocate an id wrapped in a lease that frees it on drop.
    pub async fn acquire(self: &Arc<Self>) -> Result<IdLease> {
        let id = self.allocate().await?;
        Ok(IdLease {
            allocator: Arc::clone(self),
            id,
        })
    }

    /// Return an id. Fails with invalid-operation if it is not active.
    pub fn free(&self, id: u16) -> Result<()> {
        let mut inner = self.lock();
        inner.free(id)?;
        self.publish(inner.active_count());
        Ok(())
    }

    /// Number of ids currently allocated.
    pub fn active_count(&self) -> usize {
        self.lock().active_count()
    }

    /// Maximum number of simultaneously active ids.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check whether an allocation would currently succeed without waiting.
    #[inline]
    pub fn is_full(&self) -> bool {
        !*self.not_full.borrow()
    }
}

/// An allocated transaction id, freed when dropped.
#[derive(Debug)]
pub struct IdLease {
    allocator: Arc<BoundedIdAllocator>,
    id: u16,
}

impl IdLease {
    /// The leased id.
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for IdLease {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.free(self.id) {
            defect::report("id lease", format!("releasing id {}: {}", self.id, e));
        }
    }
}
