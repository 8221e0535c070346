//! Profile verification engine.
//!
//! On every check-in the profiles a device reports as installed are compared
//! against the profiles an administrator expects. Each expected profile ends
//! up in exactly one of three sets:
//!
//! - **verified**: installed at or after its `earliest_install_date`
//! - **retry**: missing or stale, and its retry counter is below the budget
//! - **failed**: missing or stale with the retry budget spent
//!
//! A stale install (older than `earliest_install_date`) came from a previous
//! revision of the profile and counts the same as a missing one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::ControlPlaneConfig;
use crate::store::{Store, StoreError};
use crate::types::{
    Device, DeviceId, ExpectedProfile, InstalledProfileReport, ProfileStatus, VerificationUpdate,
};

/// Retry budget used when none is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Read-classify-write passes attempted before a counter race is reported.
const VERIFY_ATTEMPTS: u32 = 3;

/// Classify every expected profile into verified / failed / retry.
///
/// `counters` holds the current retry count per profile identifier; absent
/// entries count as zero. Each identifier is classified once even if it is
/// listed twice in `expected`. Output preserves the order of `expected`.
pub fn classify(
    expected: &[ExpectedProfile],
    installed: &InstalledProfileReport,
    counters: &HashMap<String, u32>,
    max_retries: u32,
    updated_at: DateTime<Utc>,
) -> VerificationUpdate {
    let mut update = VerificationUpdate {
        updated_at,
        ..Default::default()
    };
    let mut seen = HashSet::new();

    for profile in expected {
        if !seen.insert(profile.identifier.as_str()) {
            continue;
        }
        let current = installed
            .get(&profile.identifier)
            .is_some_and(|p| p.install_date >= profile.earliest_install_date);

        if current {
            update.verified.push(profile.identifier.clone());
            continue;
        }

        let retries = counters.get(&profile.identifier).copied().unwrap_or(0);
        if retries < max_retries {
            update.retry.push(profile.identifier.clone());
        } else {
            update.failed.push(profile.identifier.clone());
        }
    }

    update
}

/// Runs verification passes against the store.
#[derive(Clone)]
pub struct ProfileVerifier {
    store: Arc<dyn Store>,
    max_retries: u32,
    audit: AuditLogger,
}

impl ProfileVerifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_retries: DEFAULT_MAX_RETRIES,
            audit: AuditLogger::new(),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &ControlPlaneConfig) -> Self {
        Self::new(store).with_max_retries(config.verification.max_retries)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Verify a device against an installed-profile report and persist the
    /// classification.
    ///
    /// If the expected profiles cannot be loaded the error is returned as-is
    /// and nothing is written. Statuses of profiles that are no longer
    /// expected are dropped; a device with no expected profiles ends up with
    /// none. The write is conditional on the retry counters that were read,
    /// and a pass that loses a race re-reads and reclassifies.
    ///
    /// # Returns
    /// * `Ok(update)` - The sets that were persisted
    /// * `Err(StoreError)` - A repository call failed
    pub async fn verify(
        &self,
        device: &Device,
        installed: &InstalledProfileReport,
    ) -> Result<VerificationUpdate, StoreError> {
        let expected = self.store.get_expected_profiles(&device.id).await?;
        if expected.is_empty() {
            debug!(device_id = %device.id, "No expected profiles, clearing statuses");
            let update = VerificationUpdate {
                updated_at: device.detail_updated_at,
                ..Default::default()
            };
            self.store
                .update_verification(&device.id, &update, &HashMap::new())
                .await?;
            return Ok(update);
        }

        let mut attempt = 1;
        let update = loop {
            let counters = self.store.get_retry_counters(&device.id).await?;
            let update = classify(
                &expected,
                installed,
                &counters,
                self.max_retries,
                device.detail_updated_at,
            );
            match self
                .store
                .update_verification(&device.id, &update, &counters)
                .await
            {
                Ok(()) => break update,
                Err(StoreError::ConcurrentUpdate(reason)) if attempt < VERIFY_ATTEMPTS => {
                    warn!(device_id = %device.id, attempt, %reason, "Retry counters moved, reclassifying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            device_id = %device.id,
            verified = update.verified.len(),
            retry = update.retry.len(),
            failed = update.failed.len(),
            "Profile verification recorded"
        );
        self.audit
            .profiles_verified(
                device.id,
                update.verified.len(),
                update.retry.len(),
                update.failed.len(),
            )
            .await;

        Ok(update)
    }

    /// Store a check-in's installed-profile report, then verify against it.
    pub async fn ingest_check_in(
        &self,
        device: &Device,
        report: InstalledProfileReport,
    ) -> Result<VerificationUpdate, StoreError> {
        self.store
            .save_installed_profiles(&device.id, report.clone())
            .await?;
        self.verify(device, &report).await
    }

    /// Re-run verification from the last report the device stored.
    pub async fn verify_stored(&self, device_id: &DeviceId) -> Result<VerificationUpdate, StoreError> {
        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("device {device_id}")))?;
        let report = self.store.get_installed_profiles(device_id).await?;
        self.verify(&device, &report).await
    }

    /// Current verification state of every profile seen for the device.
    pub async fn profile_statuses(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<ProfileStatus>, StoreError> {
        self.store.get_profile_statuses(device_id).await
    }
}
