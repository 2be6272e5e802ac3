// Worker leases: capacity tokens bounding how many worker processes run at
// once across the whole build.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Worker lease registry is closed; no further leases can be acquired")]
    Closed,
}

/// Hands out worker leases from a fixed pool of `max_workers` slots.
#[derive(Debug)]
pub struct WorkerLeaseRegistry {
    slots: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerLeaseRegistry {
    /// Create a registry. A `max_workers` of zero is treated as one.
    pub fn new(max_workers: usize) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Slots not currently leased.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Slots currently leased.
    pub fn leased(&self) -> usize {
        self.max_workers - self.available()
    }

    /// A lease for a coordinating task. It occupies no slot itself; its
    /// children do.
    pub fn root_lease(self: &Arc<Self>) -> WorkerLease {
        WorkerLease {
            registry: Arc::clone(self),
            children: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail all pending and future acquisitions. Leases already held stay
    /// valid until released.
    pub fn close(&self) {
        self.slots.close();
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, LeaseError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| LeaseError::Closed)
    }
}

/// A held lease from which child leases can be started.
#[derive(Debug)]
pub struct WorkerLease {
    registry: Arc<WorkerLeaseRegistry>,
    children: Arc<AtomicUsize>,
}

impl WorkerLease {
    /// Acquire a child lease, waiting until a slot is free.
    ///
    /// The returned [`LeaseCompletion`] gives the slot back exactly once,
    /// either through [`LeaseCompletion::lease_finish`] or when dropped.
    pub async fn start_child(&self) -> Result<LeaseCompletion, LeaseError> {
        let permit = self.registry.acquire_slot().await?;
        self.children.fetch_add(1, Ordering::SeqCst);
        Ok(LeaseCompletion {
            permit: Some(permit),
            parent_children: Arc::clone(&self.children),
        })
    }

    /// Number of child leases currently held.
    pub fn active_children(&self) -> usize {
        self.children.load(Ordering::SeqCst)
    }
}

/// A held child lease.
#[derive(Debug)]
#[must_use = "dropping a LeaseCompletion releases the worker slot immediately"]
pub struct LeaseCompletion {
    permit: Option<OwnedSemaphorePermit>,
    parent_children: Arc<AtomicUsize>,
}

impl LeaseCompletion {
    /// Release the slot.
    pub fn lease_finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.parent_children.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for LeaseCompletion {
    fn drop(&mut self) {
        self.release();
    }
}
