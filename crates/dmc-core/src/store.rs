//! Repository abstraction for devices, profile verification state, and device
//! actions.
//!
//! This module defines the `Store` trait consumed by every service in this
//! crate and provides an in-memory implementation for testing and
//! single-process deployments.
//!
//! Services never hold authoritative state between calls. All concurrency
//! control is expressed through atomic store operations:
//! [`Store::insert_pending_action`] (at most one open action per device),
//! [`Store::record_terminal_result`] (compare-and-set on the correlation id),
//! [`Store::append_completed_action`] (history append guarded by the same
//! one-open-action rule), and [`Store::update_verification`] (compare-and-set
//! on the retry counters a verification pass read).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

pub use crate::errors::StoreError;
use crate::types::{
    ActionRecord, ActionRef, ActionResult, CorrelationId, Device, DeviceId, ExpectedProfile,
    InstalledProfileReport, PendingAction, ProfileStatus, VerificationStatus, VerificationUpdate,
};

// ============================================================================
// Store Trait
// ============================================================================

/// Storage abstraction for control plane persistence.
#[async_trait]
pub trait Store: Send + Sync {
    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Retrieve a device by id.
    ///
    /// # Returns
    /// * `Ok(Some(device))` if found
    /// * `Ok(None)` if the device is unknown
    async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, StoreError>;

    /// Insert or replace a device record.
    async fn save_device(&self, device: Device) -> Result<(), StoreError>;

    // -------------------------------------------------------------------------
    // Profiles
    // -------------------------------------------------------------------------

    /// Profiles the administrator expects on this device.
    async fn get_expected_profiles(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ExpectedProfile>, StoreError>;

    /// Replace the expected profile set for a device.
    async fn set_expected_profiles(
        &self,
        device_id: &DeviceId,
        profiles: Vec<ExpectedProfile>,
    ) -> Result<(), StoreError>;

    /// Last self-reported installed profiles (empty if the device never reported).
    async fn get_installed_profiles(
        &self,
        device_id: &DeviceId,
    ) -> Result<InstalledProfileReport, StoreError>;

    /// Replace the self-reported installed profile list.
    async fn save_installed_profiles(
        &self,
        device_id: &DeviceId,
        report: InstalledProfileReport,
    ) -> Result<(), StoreError>;

    /// Retry counters keyed by profile identifier. Absent entries mean zero.
    async fn get_retry_counters(
        &self,
        device_id: &DeviceId,
    ) -> Result<HashMap<String, u32>, StoreError>;

    /// Persist one verification pass atomically.
    ///
    /// `read_counters` are the counters the pass was classified against. The
    /// write only happens if every classified profile still has that counter
    /// (absent counts as zero). New counters derive from the read value:
    /// verified resets to zero, retry is read + 1, failed keeps it.
    ///
    /// The update replaces the device's statuses, so profiles no longer in
    /// the update are pruned.
    ///
    /// # Returns
    /// * `Ok(())` if the pass was written
    /// * `Err(StoreError::ConcurrentUpdate)` if a counter moved since it was read
    async fn update_verification(
        &self,
        device_id: &DeviceId,
        update: &VerificationUpdate,
        read_counters: &HashMap<String, u32>,
    ) -> Result<(), StoreError>;

    /// Current verification state of every profile seen for the device.
    async fn get_profile_statuses(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ProfileStatus>, StoreError>;

    // -------------------------------------------------------------------------
    // Device Actions
    // -------------------------------------------------------------------------

    /// The device's open pending action, if any.
    async fn get_pending_action(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<PendingAction>, StoreError>;

    /// Look up an open pending action by correlation id.
    async fn get_pending_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<PendingAction>, StoreError>;

    /// All open pending actions across the fleet.
    async fn list_pending_actions(&self) -> Result<Vec<PendingAction>, StoreError>;

    /// Insert a pending action if the device has none open.
    ///
    /// # Returns
    /// * `Ok(())` if this call created the pending action
    /// * `Err(StoreError::PendingConflict)` if another action is already open
    async fn insert_pending_action(&self, action: PendingAction) -> Result<(), StoreError>;

    /// Remove an open pending action, but only if it still carries the given
    /// correlation id. Used to roll back a reservation whose delivery failed.
    ///
    /// # Returns
    /// * `Ok(true)` if a record was removed
    async fn release_pending_action(
        &self,
        device_id: &DeviceId,
        correlation_id: &CorrelationId,
    ) -> Result<bool, StoreError>;

    /// Re-key an open pending action to the id the transport actually assigned.
    async fn rekey_pending_action(
        &self,
        device_id: &DeviceId,
        from: &CorrelationId,
        to: &CorrelationId,
    ) -> Result<(), StoreError>;

    /// Move the open pending action with this correlation id into history.
    ///
    /// # Returns
    /// * `Ok(Some(record))` if this call performed the transition
    /// * `Ok(None)` if no open action carries the correlation id (already
    ///   terminal, or never existed)
    async fn record_terminal_result(
        &self,
        correlation_id: &CorrelationId,
        final_ref: ActionRef,
        result: ActionResult,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<ActionRecord>, StoreError>;

    /// Append an action that completed without delivery straight to history.
    ///
    /// # Returns
    /// * `Ok(())` if the record was appended
    /// * `Err(StoreError::PendingConflict)` if the device has an open action
    async fn append_completed_action(&self, record: ActionRecord) -> Result<(), StoreError>;

    /// Completed actions for a device, oldest first.
    async fn get_action_history(&self, device_id: &DeviceId)
        -> Result<Vec<ActionRecord>, StoreError>;

    /// Look up a completed action by correlation id.
    async fn find_history_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<ActionRecord>, StoreError>;
}

/// Counter written for a profile classified against `read`.
pub fn next_retries(status: VerificationStatus, read: u32) -> u32 {
    match status {
        VerificationStatus::Verified => 0,
        VerificationStatus::Retrying => read.saturating_add(1),
        VerificationStatus::Failed => read,
    }
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

#[derive(Default)]
struct ActionTables {
    /// Open actions, one per device
    pending: HashMap<DeviceId, PendingAction>,
    /// Completed actions in completion order
    history: Vec<ActionRecord>,
}

/// Thread-safe in-memory store implementation for testing and single-process use.
///
/// Pending and completed actions share one lock so that the terminal
/// transition is a single atomic step.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    devices: Arc<RwLock<HashMap<DeviceId, Device>>>,
    expected: Arc<RwLock<HashMap<DeviceId, Vec<ExpectedProfile>>>>,
    installed: Arc<RwLock<HashMap<DeviceId, InstalledProfileReport>>>,
    /// Verification state indexed by (device_id, profile identifier)
    statuses: Arc<RwLock<HashMap<(DeviceId, String), ProfileStatus>>>,
    actions: Arc<RwLock<ActionTables>>,
    /// When set, every operation fails as if the backend were unreachable
    offline: Arc<AtomicBool>,
    /// Number of upcoming writes to fail; reads are unaffected
    failing_writes: Arc<AtomicUsize>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an unreachable backend.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` writes, leaving the data untouched.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::OperationFailed("store offline".into()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        self.check_online()?;
        let armed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if armed.is_ok() {
            return Err(StoreError::OperationFailed("write rejected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    async fn get_device(&self, device_id: &DeviceId) -> Result<Option<Device>, StoreError> {
        self.check_online()?;
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn save_device(&self, device: Device) -> Result<(), StoreError> {
        self.check_writable()?;
        self.devices.write().await.insert(device.id, device);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Profiles
    // -------------------------------------------------------------------------

    async fn get_expected_profiles(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ExpectedProfile>, StoreError> {
        self.check_online()?;
        Ok(self
            .expected
            .read()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_expected_profiles(
        &self,
        device_id: &DeviceId,
        profiles: Vec<ExpectedProfile>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        self.expected.write().await.insert(*device_id, profiles);
        Ok(())
    }

    async fn get_installed_profiles(
        &self,
        device_id: &DeviceId,
    ) -> Result<InstalledProfileReport, StoreError> {
        self.check_online()?;
        Ok(self
            .installed
            .read()
            .await
            .get(device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_installed_profiles(
        &self,
        device_id: &DeviceId,
        report: InstalledProfileReport,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        self.installed.write().await.insert(*device_id, report);
        Ok(())
    }

    async fn get_retry_counters(
        &self,
        device_id: &DeviceId,
    ) -> Result<HashMap<String, u32>, StoreError> {
        self.check_online()?;
        let statuses = self.statuses.read().await;
        Ok(statuses
            .iter()
            .filter(|((id, _), _)| id == device_id)
            .map(|((_, identifier), status)| (identifier.clone(), status.retries))
            .collect())
    }

    async fn update_verification(
        &self,
        device_id: &DeviceId,
        update: &VerificationUpdate,
        read_counters: &HashMap<String, u32>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut statuses = self.statuses.write().await;

        let classified = update
            .verified
            .iter()
            .map(|id| (id, VerificationStatus::Verified))
            .chain(update.retry.iter().map(|id| (id, VerificationStatus::Retrying)))
            .chain(update.failed.iter().map(|id| (id, VerificationStatus::Failed)));

        let mut next = Vec::new();
        for (identifier, status) in classified {
            let read = read_counters.get(identifier).copied().unwrap_or(0);
            let current = statuses
                .get(&(*device_id, identifier.clone()))
                .map(|s| s.retries)
                .unwrap_or(0);
            if current != read {
                return Err(StoreError::ConcurrentUpdate(format!(
                    "retry counter for {identifier} on {device_id} moved from {read} to {current}"
                )));
            }
            next.push(ProfileStatus {
                identifier: identifier.clone(),
                status,
                retries: next_retries(status, read),
                updated_at: update.updated_at,
            });
        }

        statuses.retain(|(id, _), _| id != device_id);
        for status in next {
            statuses.insert((*device_id, status.identifier.clone()), status);
        }
        Ok(())
    }

    async fn get_profile_statuses(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ProfileStatus>, StoreError> {
        self.check_online()?;
        let statuses = self.statuses.read().await;
        let mut out: Vec<ProfileStatus> = statuses
            .iter()
            .filter(|((id, _), _)| id == device_id)
            .map(|(_, status)| status.clone())
            .collect();
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Device Actions
    // -------------------------------------------------------------------------

    async fn get_pending_action(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<PendingAction>, StoreError> {
        self.check_online()?;
        Ok(self.actions.read().await.pending.get(device_id).cloned())
    }

    async fn get_pending_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<PendingAction>, StoreError> {
        self.check_online()?;
        let actions = self.actions.read().await;
        Ok(actions
            .pending
            .values()
            .find(|p| p.correlation_id() == correlation_id)
            .cloned())
    }

    async fn list_pending_actions(&self) -> Result<Vec<PendingAction>, StoreError> {
        self.check_online()?;
        let actions = self.actions.read().await;
        let mut out: Vec<PendingAction> = actions.pending.values().cloned().collect();
        out.sort_by_key(|p| p.requested_at);
        Ok(out)
    }

    async fn insert_pending_action(&self, action: PendingAction) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut actions = self.actions.write().await;
        if let Some(existing) = actions.pending.get(&action.device_id) {
            return Err(StoreError::PendingConflict {
                device_id: action.device_id,
                pending: existing.kind.pending_kind(),
            });
        }
        actions.pending.insert(action.device_id, action);
        Ok(())
    }

    async fn release_pending_action(
        &self,
        device_id: &DeviceId,
        correlation_id: &CorrelationId,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut actions = self.actions.write().await;
        match actions.pending.get(device_id) {
            Some(p) if p.correlation_id() == correlation_id => {
                actions.pending.remove(device_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rekey_pending_action(
        &self,
        device_id: &DeviceId,
        from: &CorrelationId,
        to: &CorrelationId,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut actions = self.actions.write().await;
        match actions.pending.get_mut(device_id) {
            Some(p) if p.correlation_id() == from => {
                p.action_ref = p.action_ref.with_correlation_id(to.clone());
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!(
                "pending action {from} for device {device_id}"
            ))),
        }
    }

    async fn record_terminal_result(
        &self,
        correlation_id: &CorrelationId,
        final_ref: ActionRef,
        result: ActionResult,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<ActionRecord>, StoreError> {
        self.check_writable()?;
        let mut actions = self.actions.write().await;
        let device_id = match actions
            .pending
            .values()
            .find(|p| p.correlation_id() == correlation_id)
        {
            Some(p) => p.device_id,
            None => return Ok(None),
        };
        let Some(pending) = actions.pending.remove(&device_id) else {
            return Ok(None);
        };
        let record = ActionRecord::complete(pending, final_ref, result, completed_at);
        actions.history.push(record.clone());
        Ok(Some(record))
    }

    async fn append_completed_action(&self, record: ActionRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut actions = self.actions.write().await;
        if let Some(existing) = actions.pending.get(&record.device_id) {
            return Err(StoreError::PendingConflict {
                device_id: record.device_id,
                pending: existing.kind.pending_kind(),
            });
        }
        actions.history.push(record);
        Ok(())
    }

    async fn get_action_history(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ActionRecord>, StoreError> {
        self.check_online()?;
        let actions = self.actions.read().await;
        Ok(actions
            .history
            .iter()
            .filter(|r| &r.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn find_history_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<ActionRecord>, StoreError> {
        self.check_online()?;
        let actions = self.actions.read().await;
        Ok(actions
            .history
            .iter()
            .find(|r| r.correlation_id() == correlation_id)
            .cloned())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, PendingKind, ProtocolStatus};

    fn make_pending(device_id: DeviceId, kind: ActionKind, id: &str) -> PendingAction {
        PendingAction {
            device_id,
            kind,
            action_ref: ActionRef::Protocol {
                correlation_id: CorrelationId::from(id),
                status: None,
            },
            unlock_pin: None,
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_pending_conflict() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();

        store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "c1"))
            .await
            .unwrap();
        let err = store
            .insert_pending_action(make_pending(device, ActionKind::Wipe, "c2"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            StoreError::PendingConflict {
                device_id: device,
                pending: PendingKind::LockPending,
            }
        );
        // The first reservation is untouched
        let pending = store.get_pending_action(&device).await.unwrap().unwrap();
        assert_eq!(pending.correlation_id().as_str(), "c1");
    }

    #[tokio::test]
    async fn test_release_requires_matching_correlation() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "c1"))
            .await
            .unwrap();

        assert!(!store
            .release_pending_action(&device, &CorrelationId::from("other"))
            .await
            .unwrap());
        assert!(store
            .release_pending_action(&device, &CorrelationId::from("c1"))
            .await
            .unwrap());
        assert!(store.get_pending_action(&device).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rekey_pending_action() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        store
            .insert_pending_action(make_pending(device, ActionKind::Wipe, "c1"))
            .await
            .unwrap();

        store
            .rekey_pending_action(&device, &CorrelationId::from("c1"), &CorrelationId::from("q9"))
            .await
            .unwrap();

        assert!(store
            .get_pending_by_correlation(&CorrelationId::from("q9"))
            .await
            .unwrap()
            .is_some());
        let missing = store
            .rekey_pending_action(&device, &CorrelationId::from("c1"), &CorrelationId::from("x"))
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_record_terminal_result_is_compare_and_set() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        let id = CorrelationId::from("c1");
        store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "c1"))
            .await
            .unwrap();

        let final_ref = ActionRef::Protocol {
            correlation_id: id.clone(),
            status: Some(ProtocolStatus::Acknowledged),
        };
        let first = store
            .record_terminal_result(&id, final_ref.clone(), ActionResult::Succeeded, Utc::now())
            .await
            .unwrap();
        let second = store
            .record_terminal_result(&id, final_ref, ActionResult::Succeeded, Utc::now())
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(store.get_pending_action(&device).await.unwrap().is_none());
        assert_eq!(store.get_action_history(&device).await.unwrap().len(), 1);
        assert!(store.find_history_by_correlation(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_verification_counters() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        let now = Utc::now();

        let update = VerificationUpdate {
            verified: vec!["a".into()],
            failed: vec![],
            retry: vec!["b".into()],
            updated_at: now,
        };
        store
            .update_verification(&device, &update, &HashMap::new())
            .await
            .unwrap();
        let counters = store.get_retry_counters(&device).await.unwrap();
        assert_eq!(counters.get("a"), Some(&0));
        assert_eq!(counters.get("b"), Some(&1));

        let failed = VerificationUpdate {
            verified: vec!["a".into()],
            failed: vec!["b".into()],
            retry: vec![],
            updated_at: now,
        };
        store.update_verification(&device, &failed, &counters).await.unwrap();
        let statuses = store.get_profile_statuses(&device).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[1].identifier, "b");
        assert_eq!(statuses[1].status, VerificationStatus::Failed);
        assert_eq!(statuses[1].retries, 1);
    }

    #[tokio::test]
    async fn test_update_verification_rejects_moved_counter() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        let update = VerificationUpdate {
            verified: vec![],
            failed: vec![],
            retry: vec!["p".into()],
            updated_at: Utc::now(),
        };

        // Two passes classified against the same (empty) counters
        let read = HashMap::new();
        store.update_verification(&device, &update, &read).await.unwrap();
        let err = store
            .update_verification(&device, &update, &read)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentUpdate(_)));
        assert_eq!(store.get_retry_counters(&device).await.unwrap().get("p"), Some(&1));
    }

    #[tokio::test]
    async fn test_update_verification_prunes_unlisted_profiles() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        let other = DeviceId::new_random();
        let now = Utc::now();
        let both = VerificationUpdate {
            verified: vec!["keep".into()],
            failed: vec![],
            retry: vec!["drop".into()],
            updated_at: now,
        };
        store.update_verification(&device, &both, &HashMap::new()).await.unwrap();
        store.update_verification(&other, &both, &HashMap::new()).await.unwrap();

        let counters = store.get_retry_counters(&device).await.unwrap();
        let only_keep = VerificationUpdate {
            verified: vec!["keep".into()],
            failed: vec![],
            retry: vec![],
            updated_at: now,
        };
        store.update_verification(&device, &only_keep, &counters).await.unwrap();

        let statuses = store.get_profile_statuses(&device).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].identifier, "keep");
        assert_eq!(store.get_profile_statuses(&other).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_append_completed_action_respects_open_action() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        let now = Utc::now();
        let record = ActionRecord {
            device_id: device,
            kind: ActionKind::Unlock,
            action_ref: ActionRef::NoDelivery {
                correlation_id: CorrelationId::from("u1"),
            },
            unlock_pin: None,
            requested_at: now,
            completed_at: now,
            result: ActionResult::Succeeded,
        };

        store
            .insert_pending_action(make_pending(device, ActionKind::Wipe, "w1"))
            .await
            .unwrap();
        let err = store.append_completed_action(record.clone()).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::PendingConflict {
                device_id: device,
                pending: PendingKind::WipePending,
            }
        );
        assert!(store.get_action_history(&device).await.unwrap().is_empty());

        store
            .release_pending_action(&device, &CorrelationId::from("w1"))
            .await
            .unwrap();
        store.append_completed_action(record.clone()).await.unwrap();
        assert_eq!(store.get_action_history(&device).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_failing_writes_spare_reads() {
        let store = InMemoryStore::new();
        let device = DeviceId::new_random();
        store.fail_next_writes(1);

        let err = store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "l1"))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::OperationFailed("write rejected".into()));
        assert!(store.get_pending_action(&device).await.unwrap().is_none());

        store
            .insert_pending_action(make_pending(device, ActionKind::Lock, "l1"))
            .await
            .unwrap();
        assert!(store.get_pending_action(&device).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        let result = store.get_device(&DeviceId::new_random()).await;
        assert!(matches!(result, Err(StoreError::OperationFailed(_))));
        store.set_offline(false);
        assert!(store.get_device(&DeviceId::new_random()).await.unwrap().is_none());
    }
}
