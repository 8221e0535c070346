//! Device action state machine: remote lock, unlock, and wipe.
//!
//! No per-device state machine lives in memory. Each request rebuilds the
//! device's state from the store, validates it, and then:
//!
//! 1. mints a correlation id,
//! 2. reserves the device with [`Store::insert_pending_action`] (at most one
//!    open action per device, enforced by the store),
//! 3. enqueues the command or script,
//! 4. rolls the reservation back if the enqueue fails, or re-keys it if the
//!    transport queued under a different id.
//!
//! Two concurrent requests for the same device therefore race on step 2 and
//! exactly one wins; the loser gets the same `ConflictingPendingAction` error
//! it would have received from the up-front conflict check.
//!
//! A command the transport accepted is always reported as accepted. If the
//! store fails during step 4 the fix goes on the [`RepairQueue`], which is
//! replayed before the next request or result.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::capability::{CapabilityResolver, Delivery};
use crate::config::ControlPlaneConfig;
use crate::correlator::DeviceState;
use crate::errors::{ActionError, TransportError};
use crate::repair::{Repair, RepairQueue, DEFAULT_INLINE_ATTEMPTS};
use crate::store::Store;
use crate::transport::{CommandTransport, ProtocolCommand, ScriptRequest};
use crate::types::{
    ActionKind, ActionRecord, ActionRef, ActionResult, Channel, CorrelationId, Device, DeviceId,
    PendingAction,
};

/// Digits in a generated unlock PIN unless configured otherwise.
pub const DEFAULT_PIN_LENGTH: usize = 6;

/// Returned to the caller when an action was accepted.
#[derive(Clone, PartialEq, Eq)]
pub struct ActionReceipt {
    pub device_id: DeviceId,
    pub kind: ActionKind,
    pub channel: Channel,
    pub correlation_id: CorrelationId,
    /// Lock: the freshly generated PIN. Unlock on protocol-managed devices:
    /// the PIN from the lock in effect.
    pub unlock_pin: Option<String>,
    /// Human-readable follow-up instruction.
    pub hint: String,
}

impl std::fmt::Debug for ActionReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionReceipt")
            .field("device_id", &self.device_id)
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("correlation_id", &self.correlation_id)
            .field("unlock_pin", &self.unlock_pin.as_ref().map(|_| "<redacted>"))
            .field("hint", &self.hint)
            .finish()
    }
}

/// Accepts lock / unlock / wipe requests and dispatches them.
#[derive(Clone)]
pub struct DeviceActionService {
    store: Arc<dyn Store>,
    transport: Arc<dyn CommandTransport>,
    resolver: CapabilityResolver,
    pin_length: usize,
    audit: AuditLogger,
    repairs: RepairQueue,
}

impl DeviceActionService {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn CommandTransport>,
        resolver: CapabilityResolver,
    ) -> Self {
        Self {
            store,
            transport,
            resolver,
            pin_length: DEFAULT_PIN_LENGTH,
            audit: AuditLogger::new(),
            repairs: RepairQueue::new(),
        }
    }

    pub fn from_config(
        store: Arc<dyn Store>,
        transport: Arc<dyn CommandTransport>,
        config: &ControlPlaneConfig,
    ) -> Self {
        Self::new(store, transport, CapabilityResolver::from_config(config))
            .with_pin_length(config.actions.unlock_pin_length)
    }

    pub fn with_pin_length(mut self, pin_length: usize) -> Self {
        self.pin_length = pin_length;
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Share a repair queue with the result correlator.
    pub fn with_repairs(mut self, repairs: RepairQueue) -> Self {
        self.repairs = repairs;
        self
    }

    pub fn repairs(&self) -> &RepairQueue {
        &self.repairs
    }

    /// Validate and dispatch a device action.
    ///
    /// Validation runs in this order and stops at the first failure, without
    /// side effects: device lookup and actionability, capability gate,
    /// pending-action conflict, lock/wipe state gates.
    ///
    /// # Returns
    /// * `Ok(ActionReceipt)` - The action is pending (or, for a PIN-display
    ///   unlock, already complete)
    /// * `Err(ActionError)` - Validation failed, or nothing was queued and the
    ///   reservation was rolled back (or its release deferred)
    pub async fn request_action(
        &self,
        device_id: &DeviceId,
        kind: ActionKind,
    ) -> Result<ActionReceipt, ActionError> {
        match self.try_request(device_id, kind).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                if e.is_validation() {
                    info!(device_id = %device_id, action = ?kind, code = e.code(), "Device action rejected");
                } else {
                    warn!(device_id = %device_id, action = ?kind, error = %e, "Device action failed");
                }
                self.audit.action_rejected(*device_id, kind, e.code()).await;
                Err(e)
            }
        }
    }

    async fn try_request(
        &self,
        device_id: &DeviceId,
        kind: ActionKind,
    ) -> Result<ActionReceipt, ActionError> {
        self.repairs.flush(self.store.as_ref()).await;

        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or(ActionError::NotFound(*device_id))?;

        let delivery = self.resolver.plan(&device, kind)?;

        if let Some(pending) = self.store.get_pending_action(device_id).await? {
            return Err(ActionError::ConflictingPendingAction(pending.kind.pending_kind()));
        }

        let history = self.store.get_action_history(device_id).await?;
        let state = DeviceState::from_history(&history);
        check_state(kind, &state)?;

        debug!(device_id = %device_id, action = ?kind, delivery = ?delivery, "Dispatching device action");

        match delivery {
            Delivery::PinDisplay => self.display_pin(&device, kind, &state).await,
            Delivery::Protocol(command_kind) => {
                let pin = if delivery.generates_pin() {
                    Some(generate_pin(self.pin_length)?)
                } else {
                    None
                };
                let correlation_id = CorrelationId::generate();
                let command = ProtocolCommand {
                    command_uuid: correlation_id.clone(),
                    kind: command_kind,
                    platform: device.platform,
                    pin: pin.clone(),
                };
                self.reserve(
                    &device,
                    kind,
                    ActionRef::Protocol {
                        correlation_id: correlation_id.clone(),
                        status: None,
                    },
                    pin.clone(),
                )
                .await?;

                let sent = self
                    .transport
                    .enqueue_protocol_command(&device.id, &command)
                    .await;
                let correlation_id = self.settle(&device, &correlation_id, sent).await?;
                Ok(self.accepted(&device, kind, Channel::Protocol, correlation_id, pin).await)
            }
            Delivery::Script(script) => {
                let correlation_id = CorrelationId::generate();
                let request = ScriptRequest {
                    execution_id: correlation_id.clone(),
                    script,
                };
                self.reserve(
                    &device,
                    kind,
                    ActionRef::Script {
                        execution_id: correlation_id.clone(),
                        exit_code: None,
                    },
                    None,
                )
                .await?;

                let sent = self
                    .transport
                    .enqueue_script_execution(&device.id, &request)
                    .await;
                let correlation_id = self.settle(&device, &correlation_id, sent).await?;
                Ok(self.accepted(&device, kind, Channel::Script, correlation_id, None).await)
            }
        }
    }

    /// Atomically claim the device for this action.
    async fn reserve(
        &self,
        device: &Device,
        kind: ActionKind,
        action_ref: ActionRef,
        unlock_pin: Option<String>,
    ) -> Result<(), ActionError> {
        self.store
            .insert_pending_action(PendingAction {
                device_id: device.id,
                kind,
                action_ref,
                unlock_pin,
                requested_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Reconcile the reservation with the enqueue outcome.
    ///
    /// On success the id the transport queued under is returned, re-keying
    /// the reservation first if it differs from the minted one. On failure
    /// the reservation is released and the transport error is returned.
    /// Store failures in either branch are deferred to the repair queue and
    /// never change the outcome reported to the caller.
    async fn settle(
        &self,
        device: &Device,
        minted: &CorrelationId,
        sent: Result<CorrelationId, TransportError>,
    ) -> Result<CorrelationId, ActionError> {
        match sent {
            Ok(assigned) if &assigned == minted => Ok(assigned),
            Ok(assigned) => {
                let repair = Repair::Rekey {
                    device_id: device.id,
                    from: minted.clone(),
                    to: assigned.clone(),
                };
                match repair
                    .apply_with_retries(self.store.as_ref(), DEFAULT_INLINE_ATTEMPTS)
                    .await
                {
                    Ok(()) => debug!(
                        device_id = %device.id,
                        minted = %minted,
                        assigned = %assigned,
                        "Pending action re-keyed to transport id"
                    ),
                    Err(e) => {
                        error!(
                            device_id = %device.id,
                            minted = %minted,
                            assigned = %assigned,
                            error = %e,
                            "Failed to re-key queued action"
                        );
                        self.repairs.push(repair).await;
                    }
                }
                Ok(assigned)
            }
            Err(e) => {
                let repair = Repair::Release {
                    device_id: device.id,
                    correlation_id: minted.clone(),
                };
                match repair
                    .apply_with_retries(self.store.as_ref(), DEFAULT_INLINE_ATTEMPTS)
                    .await
                {
                    Ok(()) => {
                        info!(device_id = %device.id, correlation_id = %minted, "Reservation rolled back")
                    }
                    Err(release_err) => {
                        error!(
                            device_id = %device.id,
                            correlation_id = %minted,
                            error = %release_err,
                            "Failed to roll back reservation"
                        );
                        self.repairs.push(repair).await;
                    }
                }
                Err(ActionError::Transport(e))
            }
        }
    }

    /// Unlock on a protocol-managed device: nothing is sent, the operator
    /// types the PIN from the lock in effect into the device.
    ///
    /// The completed action is written in one store call, so a failure
    /// leaves neither a pending action nor a history entry behind.
    async fn display_pin(
        &self,
        device: &Device,
        kind: ActionKind,
        state: &DeviceState,
    ) -> Result<ActionReceipt, ActionError> {
        let correlation_id = CorrelationId::generate();
        let now = Utc::now();
        self.store
            .append_completed_action(ActionRecord {
                device_id: device.id,
                kind,
                action_ref: ActionRef::NoDelivery {
                    correlation_id: correlation_id.clone(),
                },
                unlock_pin: None,
                requested_at: now,
                completed_at: now,
                result: ActionResult::Succeeded,
            })
            .await?;

        let receipt = self
            .accepted(device, kind, Channel::None, correlation_id.clone(), state.lock_pin.clone())
            .await;
        self.audit
            .action_completed(device.id, kind, correlation_id, ActionResult::Succeeded)
            .await;
        Ok(receipt)
    }

    async fn accepted(
        &self,
        device: &Device,
        kind: ActionKind,
        channel: Channel,
        correlation_id: CorrelationId,
        unlock_pin: Option<String>,
    ) -> ActionReceipt {
        info!(
            device_id = %device.id,
            action = ?kind,
            channel = channel.as_str(),
            correlation_id = %correlation_id,
            "Device action accepted"
        );
        self.audit
            .action_requested(device.id, kind, channel, correlation_id.clone())
            .await;

        ActionReceipt {
            device_id: device.id,
            kind,
            channel,
            hint: hint_for(device, kind, channel, unlock_pin.is_some()),
            correlation_id,
            unlock_pin,
        }
    }
}

/// Lock and wipe state gates, checked after the conflict gate.
fn check_state(kind: ActionKind, state: &DeviceState) -> Result<(), ActionError> {
    if state.wiped {
        return Err(ActionError::AlreadyWiped);
    }
    match kind {
        ActionKind::Wipe if state.locked => Err(ActionError::CannotActWhileLocked),
        ActionKind::Lock if state.locked => Err(ActionError::AlreadyLocked),
        ActionKind::Unlock if !state.locked => Err(ActionError::NotLocked),
        _ => Ok(()),
    }
}

fn hint_for(device: &Device, kind: ActionKind, channel: Channel, has_pin: bool) -> String {
    match (kind, channel) {
        (ActionKind::Unlock, Channel::None) if has_pin => format!(
            "Enter the unlock PIN on {} to unlock it.",
            device.hostname
        ),
        (ActionKind::Unlock, Channel::None) => format!(
            "No PIN is on record for {}; unlock it locally.",
            device.hostname
        ),
        (ActionKind::Lock, _) if has_pin => format!(
            "Lock queued for {}. Keep the PIN; it is required to unlock. Check progress with `status {}`.",
            device.hostname, device.id
        ),
        _ => format!(
            "{} queued for {}. Check progress with `status {}`.",
            capitalized(kind),
            device.hostname,
            device.id
        ),
    }
}

fn capitalized(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Lock => "Lock",
        ActionKind::Unlock => "Unlock",
        ActionKind::Wipe => "Wipe",
    }
}

/// Uniformly random decimal PIN from the OS random source.
pub fn generate_pin(len: usize) -> Result<String, ActionError> {
    let mut pin = String::with_capacity(len);
    let mut buf = [0u8; 16];
    while pin.len() < len {
        getrandom::getrandom(&mut buf).map_err(|e| ActionError::PinGeneration(e.to_string()))?;
        // 250 is the largest multiple of 10 below 256; reject above it to
        // keep digits unbiased.
        for b in buf.iter().filter(|b| **b < 250) {
            if pin.len() == len {
                break;
            }
            pin.push(char::from(b'0' + b % 10));
        }
    }
    Ok(pin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{
        seed_device, FailingTransport, RecordedCall, RecordingTransport, StoreOutageTransport,
    };
    use crate::store::InMemoryStore;
    use crate::types::{PendingKind, Platform};

    fn service(store: Arc<InMemoryStore>, transport: Arc<dyn CommandTransport>) -> DeviceActionService {
        DeviceActionService::new(
            store,
            transport,
            CapabilityResolver::new("dmc", Default::default()),
        )
    }

    #[test]
    fn test_generate_pin() {
        let pin = generate_pin(6).unwrap();
        assert_eq!(pin.len(), 6);
        assert!(pin.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(generate_pin(10).unwrap().len(), 10);
    }

    #[test]
    fn test_state_gates() {
        let idle = DeviceState::default();
        assert_eq!(check_state(ActionKind::Unlock, &idle), Err(ActionError::NotLocked));
        assert!(check_state(ActionKind::Lock, &idle).is_ok());
        assert!(check_state(ActionKind::Wipe, &idle).is_ok());

        let locked = DeviceState {
            locked: true,
            ..Default::default()
        };
        assert_eq!(check_state(ActionKind::Wipe, &locked), Err(ActionError::CannotActWhileLocked));
        assert_eq!(check_state(ActionKind::Lock, &locked), Err(ActionError::AlreadyLocked));
        assert!(check_state(ActionKind::Unlock, &locked).is_ok());

        let wiped = DeviceState {
            wiped: true,
            ..Default::default()
        };
        for kind in [ActionKind::Lock, ActionKind::Unlock, ActionKind::Wipe] {
            assert_eq!(check_state(kind, &wiped), Err(ActionError::AlreadyWiped));
        }
    }

    #[test]
    fn test_receipt_debug_redacts_pin() {
        let receipt = ActionReceipt {
            device_id: DeviceId::new_random(),
            kind: ActionKind::Lock,
            channel: Channel::Protocol,
            correlation_id: CorrelationId::from("c"),
            unlock_pin: Some("424242".into()),
            hint: String::new(),
        };
        assert!(!format!("{receipt:?}").contains("424242"));
    }

    #[tokio::test]
    async fn test_protocol_lock_stores_pin_with_pending_action() {
        let store = InMemoryStore::new_shared();
        let transport = Arc::new(RecordingTransport::new());
        let device = seed_device(store.as_ref(), Platform::Ios).await;

        let receipt = service(store.clone(), transport.clone())
            .request_action(&device.id, ActionKind::Lock)
            .await
            .unwrap();

        let pending = store.get_pending_action(&device.id).await.unwrap().unwrap();
        assert_eq!(pending.unlock_pin, receipt.unlock_pin);
        assert_eq!(pending.correlation_id(), &receipt.correlation_id);

        let calls = transport.calls().await;
        let [RecordedCall::Protocol { command, .. }] = calls.as_slice() else {
            panic!("expected one protocol call, got {calls:?}");
        };
        assert_eq!(command.pin, receipt.unlock_pin);
    }

    #[tokio::test]
    async fn test_rekeys_to_transport_assigned_id() {
        let store = InMemoryStore::new_shared();
        let transport = Arc::new(RecordingTransport::new().with_reassigned_ids());
        let device = seed_device(store.as_ref(), Platform::Linux).await;

        let receipt = service(store.clone(), transport.clone())
            .request_action(&device.id, ActionKind::Lock)
            .await
            .unwrap();

        assert!(receipt.correlation_id.as_str().starts_with("queued-"));
        let pending = store
            .get_pending_by_correlation(&receipt.correlation_id)
            .await
            .unwrap();
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn test_queued_command_survives_rekey_failure() {
        let store = InMemoryStore::new_shared();
        let device = seed_device(store.as_ref(), Platform::Linux).await;
        let transport = Arc::new(StoreOutageTransport::new(
            Arc::new(RecordingTransport::new().with_reassigned_ids()),
            store.clone(),
        ));
        let actions = service(store.clone(), transport);

        let receipt = actions
            .request_action(&device.id, ActionKind::Lock)
            .await
            .unwrap();
        assert_eq!(receipt.correlation_id.as_str(), "queued-0");
        assert_eq!(actions.repairs().len().await, 1);

        // The next request replays the re-key and sees the open lock
        store.set_offline(false);
        let err = actions
            .request_action(&device.id, ActionKind::Wipe)
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::ConflictingPendingAction(PendingKind::LockPending));
        assert!(actions.repairs().is_empty().await);
        let pending = store.get_pending_action(&device.id).await.unwrap().unwrap();
        assert_eq!(pending.correlation_id(), &receipt.correlation_id);
    }

    #[tokio::test]
    async fn test_failed_release_is_retried_by_next_request() {
        let store = InMemoryStore::new_shared();
        let device = seed_device(store.as_ref(), Platform::Windows).await;
        let failing = Arc::new(FailingTransport::new());
        let outage = Arc::new(StoreOutageTransport::new(failing.clone(), store.clone()));
        let actions = service(store.clone(), outage);

        let err = actions
            .request_action(&device.id, ActionKind::Wipe)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Transport(_)));
        assert_eq!(actions.repairs().len().await, 1);

        store.set_offline(false);
        assert!(store.get_pending_action(&device.id).await.unwrap().is_some());

        let recording = Arc::new(RecordingTransport::new());
        let retry = service(store.clone(), recording.clone()).with_repairs(actions.repairs().clone());
        let receipt = retry.request_action(&device.id, ActionKind::Wipe).await.unwrap();
        assert!(retry.repairs().is_empty().await);
        assert_eq!(recording.call_count().await, 1);
        let pending = store.get_pending_action(&device.id).await.unwrap().unwrap();
        assert_eq!(pending.correlation_id(), &receipt.correlation_id);
    }

    #[tokio::test]
    async fn test_pin_display_write_failure_leaves_nothing_open() {
        let store = InMemoryStore::new_shared();
        let device = seed_device(store.as_ref(), Platform::MacOs).await;
        let now = Utc::now();
        store
            .append_completed_action(ActionRecord {
                device_id: device.id,
                kind: ActionKind::Lock,
                action_ref: ActionRef::Protocol {
                    correlation_id: CorrelationId::from("lock-1"),
                    status: None,
                },
                unlock_pin: Some("246810".into()),
                requested_at: now,
                completed_at: now,
                result: ActionResult::Succeeded,
            })
            .await
            .unwrap();
        let transport = Arc::new(RecordingTransport::new());
        let actions = service(store.clone(), transport.clone());

        store.fail_next_writes(1);
        let err = actions
            .request_action(&device.id, ActionKind::Unlock)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Store(_)));
        assert!(store.get_pending_action(&device.id).await.unwrap().is_none());
        assert_eq!(store.get_action_history(&device.id).await.unwrap().len(), 1);

        let receipt = actions
            .request_action(&device.id, ActionKind::Unlock)
            .await
            .unwrap();
        assert_eq!(receipt.channel, Channel::None);
        assert_eq!(receipt.unlock_pin.as_deref(), Some("246810"));
        assert!(store.get_pending_action(&device.id).await.unwrap().is_none());
        let history = store.get_action_history(&device.id).await.unwrap();
        assert!(!DeviceState::from_history(&history).locked);
        assert_eq!(transport.call_count().await, 0);
    }
}
