//! Admission-controlled request scheduling.
//!
//! Bounds the number of requests concurrently holding a credential and
//! connection slot. Excess submissions park on the semaphore's FIFO wait
//! list and are released one at a time as slots free up, so work is
//! queued, never dropped.

use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded-concurrency scheduler. One per client instance.
#[derive(Debug)]
pub struct Scheduler {
    permits: Arc<Semaphore>,
    bound: usize,
    in_flight: AtomicUsize,
}

/// RAII in-flight slot. Dropping it frees the slot and admits the oldest
/// queued submission.
pub struct Slot<'a> {
    _permit: OwnedSemaphorePermit,
    scheduler: &'a Scheduler,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.scheduler.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Scheduler {
            permits: Arc::new(Semaphore::new(bound)),
            bound,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Wait for an in-flight slot. Tokio's semaphore queues waiters in
    /// arrival order, which gives the FIFO release guarantee.
    pub async fn admit(&self) -> Slot<'_> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("scheduler semaphore is never closed");
        let queued = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if queued + 1 >= self.bound {
            debug!("Scheduler saturated: {}/{} slots in use", queued + 1, self.bound);
        }
        Slot {
            _permit: permit,
            scheduler: self,
        }
    }

    /// Run `fut` inside an in-flight slot.
    pub async fn submit<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _slot = self.admit().await;
        fut.await
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
