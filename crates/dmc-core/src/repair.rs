//! Deferred store fixes for dispatches that already left the control plane.
//!
//! Once a command is queued on the transport it cannot be taken back, so a
//! store failure while re-keying or releasing the reservation must not lose
//! the pending action. The failed call is parked here and replayed before
//! the next request or result touches the store. The queue lives in process
//! memory; share one instance between [`DeviceActionService`] and
//! [`ResultCorrelator`].
//!
//! [`DeviceActionService`]: crate::actions::DeviceActionService
//! [`ResultCorrelator`]: crate::correlator::ResultCorrelator

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{Store, StoreError};
use crate::types::{CorrelationId, DeviceId};

/// Immediate attempts made before a fix is parked.
pub const DEFAULT_INLINE_ATTEMPTS: u32 = 2;

/// A store write that still has to happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// Move the reservation to the id the transport queued under.
    Rekey {
        device_id: DeviceId,
        from: CorrelationId,
        to: CorrelationId,
    },
    /// Drop a reservation whose enqueue failed.
    Release {
        device_id: DeviceId,
        correlation_id: CorrelationId,
    },
}

impl Repair {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Repair::Rekey { device_id, .. } | Repair::Release { device_id, .. } => device_id,
        }
    }

    /// Apply once. `Ok(())` means the repair is settled and can be dropped.
    pub async fn apply(&self, store: &dyn Store) -> Result<(), StoreError> {
        match self {
            Repair::Rekey {
                device_id,
                from,
                to,
            } => match store.rekey_pending_action(device_id, from, to).await {
                // Already moved, or closed some other way
                Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },
            Repair::Release {
                device_id,
                correlation_id,
            } => store
                .release_pending_action(device_id, correlation_id)
                .await
                .map(|_| ()),
        }
    }

    /// Apply with up to `attempts` tries, returning the last error.
    pub async fn apply_with_retries(
        &self,
        store: &dyn Store,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.apply(store).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(device_id = %self.device_id(), attempt, error = %e, "Repair attempt failed");
                    attempt += 1;
                }
            }
        }
    }
}

/// Repairs waiting for the store to come back.
#[derive(Debug, Clone, Default)]
pub struct RepairQueue {
    inner: Arc<Mutex<Vec<Repair>>>,
}

impl RepairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, repair: Repair) {
        warn!(device_id = %repair.device_id(), repair = ?repair, "Store repair deferred");
        self.inner.lock().await.push(repair);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn pending(&self) -> Vec<Repair> {
        self.inner.lock().await.clone()
    }

    /// Replay every parked repair once, in order.
    ///
    /// Returns how many are still outstanding.
    pub async fn flush(&self, store: &dyn Store) -> usize {
        let mut queue = self.inner.lock().await;
        if queue.is_empty() {
            return 0;
        }

        let mut remaining = Vec::new();
        for repair in queue.drain(..) {
            match repair.apply(store).await {
                Ok(()) => info!(device_id = %repair.device_id(), repair = ?repair, "Store repair applied"),
                Err(e) => {
                    debug!(device_id = %repair.device_id(), error = %e, "Store repair still failing");
                    remaining.push(repair);
                }
            }
        }
        *queue = remaining;
        queue.len()
    }
}
