//! Result correlator.
//!
//! Protocol command results and script completions arrive asynchronously,
//! possibly days after dispatch and after any number of restarts. They are
//! matched back to the pending action through its correlation id and, once
//! terminal, moved into the action history with a single compare-and-set.
//!
//! Lock and wipe state is never stored as a flag of its own; it is derived
//! from the history on every read (see [`DeviceState::from_history`]), so a
//! successful unlock "clears" the lock simply by being recorded.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::config::ControlPlaneConfig;
use crate::errors::CorrelatorError;
use crate::repair::RepairQueue;
use crate::store::{Store, StoreError};
use crate::types::{
    script_terminal_result, ActionKind, ActionRecord, ActionRef, ActionResult, Channel,
    CorrelationId, DeviceId, PendingAction, ProtocolStatus,
};

/// A result reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Protocol(ProtocolStatus),
    Script {
        exit_code: Option<i32>,
        output: Option<String>,
    },
}

impl CommandOutcome {
    pub fn channel(&self) -> Channel {
        match self {
            CommandOutcome::Protocol(_) => Channel::Protocol,
            CommandOutcome::Script { .. } => Channel::Script,
        }
    }

    /// `None` while the command is still in flight.
    pub fn terminal_result(&self) -> Option<ActionResult> {
        match self {
            CommandOutcome::Protocol(status) => status.terminal_result(),
            CommandOutcome::Script { exit_code, .. } => script_terminal_result(*exit_code),
        }
    }

    fn final_ref(&self, correlation_id: &CorrelationId) -> ActionRef {
        match self {
            CommandOutcome::Protocol(status) => ActionRef::Protocol {
                correlation_id: correlation_id.clone(),
                status: Some(*status),
            },
            CommandOutcome::Script { exit_code, .. } => ActionRef::Script {
                execution_id: correlation_id.clone(),
                exit_code: *exit_code,
            },
        }
    }
}

/// What [`ResultCorrelator::record_result`] did with a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Non-terminal status (e.g. `NotNow`); the action stays pending.
    StillPending,
    /// This call performed the terminal transition.
    Completed(ActionRecord),
    /// The action was already terminal; nothing changed.
    Duplicate,
}

/// Lock and wipe state reconstructed from a device's action history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub locked: bool,
    pub wiped: bool,
    /// PIN carried by the lock currently in effect.
    pub lock_pin: Option<String>,
}

impl DeviceState {
    /// Replay completed actions, oldest first. Failed actions change nothing.
    pub fn from_history(history: &[ActionRecord]) -> Self {
        let mut state = DeviceState::default();
        for record in history.iter().filter(|r| r.succeeded()) {
            match record.kind {
                ActionKind::Lock => {
                    state.locked = true;
                    state.lock_pin = record.unlock_pin.clone();
                }
                ActionKind::Unlock => {
                    state.locked = false;
                    state.lock_pin = None;
                }
                ActionKind::Wipe => state.wiped = true,
            }
        }
        state
    }
}

/// Operator-facing view of a device's actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceActionStatus {
    pub device_id: DeviceId,
    pub pending: Option<PendingAction>,
    /// The pending action is older than the configured staleness threshold.
    /// Informational only; the action is still pending.
    pub stuck: bool,
    pub locked: bool,
    pub wiped: bool,
    /// Most recent completed action of each kind, in completion order.
    pub last_results: Vec<ActionRecord>,
}

/// Matches asynchronous results to pending actions and serves status reads.
#[derive(Clone)]
pub struct ResultCorrelator {
    store: Arc<dyn Store>,
    stuck_after: Option<Duration>,
    audit: AuditLogger,
    repairs: RepairQueue,
}

impl ResultCorrelator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            stuck_after: None,
            audit: AuditLogger::new(),
            repairs: RepairQueue::new(),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &ControlPlaneConfig) -> Self {
        let mut correlator = Self::new(store);
        correlator.stuck_after = config.stuck_after();
        correlator
    }

    pub fn with_stuck_after(mut self, threshold: Duration) -> Self {
        self.stuck_after = Some(threshold);
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Replay deferred re-keys before matching results, so a result under a
    /// transport-assigned id finds its action.
    pub fn with_repairs(mut self, repairs: RepairQueue) -> Self {
        self.repairs = repairs;
        self
    }

    /// Record a command or script result.
    ///
    /// # Returns
    /// * `Ok(RecordOutcome)` - See variants
    /// * `Err(CorrelatorError::UnknownCorrelation)` - No pending or completed
    ///   action carries this id
    /// * `Err(CorrelatorError::ChannelMismatch)` - The result came in on the
    ///   wrong channel for the pending action
    pub async fn record_result(
        &self,
        correlation_id: &CorrelationId,
        outcome: CommandOutcome,
    ) -> Result<RecordOutcome, CorrelatorError> {
        self.repairs.flush(self.store.as_ref()).await;

        let Some(pending) = self.store.get_pending_by_correlation(correlation_id).await? else {
            if self
                .store
                .find_history_by_correlation(correlation_id)
                .await?
                .is_some()
            {
                debug!(correlation_id = %correlation_id, "Result for completed action ignored");
                return Ok(RecordOutcome::Duplicate);
            }
            warn!(correlation_id = %correlation_id, "Result for unknown correlation id");
            return Err(CorrelatorError::UnknownCorrelation(correlation_id.to_string()));
        };

        let expected = pending.action_ref.channel();
        if expected != outcome.channel() {
            return Err(CorrelatorError::ChannelMismatch {
                correlation_id: correlation_id.to_string(),
                expected: expected.as_str(),
                actual: outcome.channel().as_str(),
            });
        }

        let Some(result) = outcome.terminal_result() else {
            debug!(
                device_id = %pending.device_id,
                correlation_id = %correlation_id,
                "Non-terminal result, action stays pending"
            );
            return Ok(RecordOutcome::StillPending);
        };

        if let CommandOutcome::Script {
            output: Some(output),
            ..
        } = &outcome
        {
            debug!(correlation_id = %correlation_id, output_len = output.len(), "Script output received");
        }

        let recorded = self
            .store
            .record_terminal_result(
                correlation_id,
                outcome.final_ref(correlation_id),
                result,
                Utc::now(),
            )
            .await?;

        match recorded {
            Some(record) => {
                info!(
                    device_id = %record.device_id,
                    action = ?record.kind,
                    correlation_id = %correlation_id,
                    result = record.result.as_str(),
                    "Device action completed"
                );
                self.audit
                    .action_completed(
                        record.device_id,
                        record.kind,
                        correlation_id.clone(),
                        record.result,
                    )
                    .await;
                Ok(RecordOutcome::Completed(record))
            }
            // Another delivery of the same result won the transition.
            None => Ok(RecordOutcome::Duplicate),
        }
    }

    /// The device's open pending action, if any.
    pub async fn get_status(&self, device_id: &DeviceId) -> Result<Option<PendingAction>, StoreError> {
        self.store.get_pending_action(device_id).await
    }

    /// Pending action, lock/wipe state, and last results for a device.
    pub async fn device_status(&self, device_id: &DeviceId) -> Result<DeviceActionStatus, StoreError> {
        let pending = self.store.get_pending_action(device_id).await?;
        let history = self.store.get_action_history(device_id).await?;
        let state = DeviceState::from_history(&history);
        let now = Utc::now();

        let mut last_results: Vec<ActionRecord> = Vec::new();
        for record in history.into_iter().rev() {
            if !last_results.iter().any(|r| r.kind == record.kind) {
                last_results.push(record);
            }
        }
        last_results.reverse();

        Ok(DeviceActionStatus {
            device_id: *device_id,
            stuck: pending.as_ref().is_some_and(|p| self.is_stuck(p, now)),
            pending,
            locked: state.locked,
            wiped: state.wiped,
            last_results,
        })
    }

    /// Pending actions across the fleet older than the staleness threshold.
    /// Empty when no threshold is configured.
    pub async fn stuck_actions(&self, now: DateTime<Utc>) -> Result<Vec<PendingAction>, StoreError> {
        if self.stuck_after.is_none() {
            return Ok(Vec::new());
        }
        let pending = self.store.list_pending_actions().await?;
        Ok(pending.into_iter().filter(|p| self.is_stuck(p, now)).collect())
    }

    fn is_stuck(&self, pending: &PendingAction, now: DateTime<Utc>) -> bool {
        match self.stuck_after {
            Some(threshold) => now - pending.requested_at >= threshold,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn pending(device_id: DeviceId, kind: ActionKind, action_ref: ActionRef) -> PendingAction {
        PendingAction {
            device_id,
            kind,
            action_ref,
            unlock_pin: None,
            requested_at: Utc::now(),
        }
    }

    fn record(kind: ActionKind, result: ActionResult, pin: Option<&str>) -> ActionRecord {
        let now = Utc::now();
        ActionRecord {
            device_id: DeviceId::new_random(),
            kind,
            action_ref: ActionRef::NoDelivery {
                correlation_id: CorrelationId::generate(),
            },
            unlock_pin: pin.map(str::to_string),
            requested_at: now,
            completed_at: now,
            result,
        }
    }

    #[test]
    fn test_device_state_replay() {
        let history = vec![
            record(ActionKind::Lock, ActionResult::Succeeded, Some("111111")),
            record(ActionKind::Unlock, ActionResult::Failed, None),
        ];
        let state = DeviceState::from_history(&history);
        assert!(state.locked);
        assert_eq!(state.lock_pin.as_deref(), Some("111111"));

        let mut history = history;
        history.push(record(ActionKind::Unlock, ActionResult::Succeeded, None));
        let state = DeviceState::from_history(&history);
        assert!(!state.locked);
        assert_eq!(state.lock_pin, None);

        history.push(record(ActionKind::Wipe, ActionResult::Succeeded, None));
        assert!(DeviceState::from_history(&history).wiped);
    }

    #[tokio::test]
    async fn test_not_now_keeps_action_pending() {
        let store = InMemoryStore::new_shared();
        let device = DeviceId::new_random();
        let id = CorrelationId::from("cmd-1");
        store
            .insert_pending_action(pending(
                device,
                ActionKind::Lock,
                ActionRef::Protocol {
                    correlation_id: id.clone(),
                    status: None,
                },
            ))
            .await
            .unwrap();
        let correlator = ResultCorrelator::new(store.clone());

        let outcome = correlator
            .record_result(&id, CommandOutcome::Protocol(ProtocolStatus::NotNow))
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::StillPending);
        assert!(correlator.get_status(&device).await.unwrap().is_some());

        let outcome = correlator
            .record_result(&id, CommandOutcome::Protocol(ProtocolStatus::Acknowledged))
            .await
            .unwrap();
        let RecordOutcome::Completed(record) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(record.result, ActionResult::Succeeded);
        assert_eq!(
            record.action_ref,
            ActionRef::Protocol {
                correlation_id: id.clone(),
                status: Some(ProtocolStatus::Acknowledged),
            }
        );

        let again = correlator
            .record_result(&id, CommandOutcome::Protocol(ProtocolStatus::Acknowledged))
            .await
            .unwrap();
        assert_eq!(again, RecordOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_script_exit_codes() {
        let store = InMemoryStore::new_shared();
        let device = DeviceId::new_random();
        let id = CorrelationId::from("exec-1");
        store
            .insert_pending_action(pending(
                device,
                ActionKind::Wipe,
                ActionRef::Script {
                    execution_id: id.clone(),
                    exit_code: None,
                },
            ))
            .await
            .unwrap();
        let correlator = ResultCorrelator::new(store.clone());

        let running = correlator
            .record_result(&id, CommandOutcome::Script { exit_code: None, output: None })
            .await
            .unwrap();
        assert_eq!(running, RecordOutcome::StillPending);

        let done = correlator
            .record_result(
                &id,
                CommandOutcome::Script {
                    exit_code: Some(2),
                    output: Some("rm: permission denied".into()),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            done,
            RecordOutcome::Completed(ActionRecord { result: ActionResult::Failed, .. })
        ));

        let status = correlator.device_status(&device).await.unwrap();
        assert!(!status.wiped);
        assert!(status.pending.is_none());
        assert_eq!(status.last_results.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_mismatched_results() {
        let store = InMemoryStore::new_shared();
        let correlator = ResultCorrelator::new(store.clone());

        let err = correlator
            .record_result(
                &CorrelationId::from("nope"),
                CommandOutcome::Protocol(ProtocolStatus::Acknowledged),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CorrelatorError::UnknownCorrelation("nope".into()));

        let device = DeviceId::new_random();
        let id = CorrelationId::from("cmd-2");
        store
            .insert_pending_action(pending(
                device,
                ActionKind::Lock,
                ActionRef::Protocol {
                    correlation_id: id.clone(),
                    status: None,
                },
            ))
            .await
            .unwrap();
        let err = correlator
            .record_result(&id, CommandOutcome::Script { exit_code: Some(0), output: None })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CorrelatorError::ChannelMismatch { expected: "protocol", actual: "script", .. }
        ));
    }

    #[tokio::test]
    async fn test_stuck_detection() {
        let store = InMemoryStore::new_shared();
        let device = DeviceId::new_random();
        let mut old = pending(
            device,
            ActionKind::Lock,
            ActionRef::Protocol {
                correlation_id: CorrelationId::from("old"),
                status: None,
            },
        );
        old.requested_at = Utc::now() - Duration::days(3);
        store.insert_pending_action(old).await.unwrap();

        let without = ResultCorrelator::new(store.clone());
        assert!(without.stuck_actions(Utc::now()).await.unwrap().is_empty());
        assert!(!without.device_status(&device).await.unwrap().stuck);

        let with = ResultCorrelator::new(store.clone()).with_stuck_after(Duration::days(1));
        assert_eq!(with.stuck_actions(Utc::now()).await.unwrap().len(), 1);
        let status = with.device_status(&device).await.unwrap();
        assert!(status.stuck);
        assert!(status.pending.is_some());
    }
}
