//! Admission control for concurrent stream sessions.
//!
//! Capacity is the advertised tuner count. Waiters are admitted in arrival
//! order; a waiter that times out leaves the queue without taking a slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded, FIFO-fair admission of sessions.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl AdmissionController {
    /// Create a controller with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait up to `timeout` for a slot.
    ///
    /// A free slot is granted immediately, even with a zero timeout.
    pub async fn try_admit(&self, timeout: Duration) -> Option<AdmissionSlot> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => {
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Admitted session ({}/{} active)", active, self.capacity);
                Some(AdmissionSlot {
                    permit: Some(permit),
                    active: Arc::clone(&self.active),
                })
            }
            Ok(Err(_)) => {
                warn!("Admission semaphore closed");
                None
            }
            Err(_) => {
                info!(
                    "Admission timed out after {:?} ({}/{} active)",
                    timeout,
                    self.active(),
                    self.capacity
                );
                None
            }
        }
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A held admission slot.
///
/// Released exactly once, either by [`AdmissionSlot::release`] or on drop.
#[derive(Debug)]
pub struct AdmissionSlot {
    permit: Option<OwnedSemaphorePermit>,
    active: Arc<AtomicUsize>,
}

impl AdmissionSlot {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(permit) = self.permit.take() {
            // Decrement before the permit wakes the next waiter.
            self.active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release_inner();
    }
}
