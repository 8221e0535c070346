//! Error types for DMC Core.
//!
//! Errors are grouped per concern and folded into [`CoreError`] for callers
//! that drive several services at once. [`ActionError`] is the caller-facing
//! taxonomy for device actions and carries stable machine-readable codes.

use thiserror::Error;

use crate::types::{DeviceId, PendingKind, Platform};

// ============================================================================
// Storage Errors
// ============================================================================

/// Errors raised by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// The device already has an open pending action
    #[error("device {device_id} already has an open action ({pending})")]
    PendingConflict {
        device_id: DeviceId,
        pending: PendingKind,
    },

    /// Storage operation failed
    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    /// Stored data could not be decoded
    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    /// State changed between read and conditional write
    #[error("concurrent update: {0}")]
    ConcurrentUpdate(String),
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Errors raised while enqueueing a command or script for delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The delivery queue could not be reached
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The queue refused the command
    #[error("enqueue rejected: {0}")]
    Rejected(String),

    /// The device has no push credentials / agent registration on file
    #[error("device is not reachable over this channel: {0}")]
    NotReachable(String),
}

// ============================================================================
// Device Action Errors
// ============================================================================

/// Management capability a device action depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Protocol management for Apple platforms
    AppleMdm,
    /// Protocol management for Windows
    WindowsMdm,
    /// Fleet-wide script execution
    ScriptExecution,
    /// The device's agent must report script support
    AgentScripts,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Capability::AppleMdm => "Apple MDM",
            Capability::WindowsMdm => "Windows MDM",
            Capability::ScriptExecution => "script execution",
            Capability::AgentScripts => "agent script support",
        })
    }
}

/// Why a device is not actionable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotManagedReason {
    NotEnrolled,
    EnrollmentPending,
    ManagedElsewhere,
    NotConnected,
}

impl std::fmt::Display for NotManagedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NotManagedReason::NotEnrolled => "not enrolled",
            NotManagedReason::EnrollmentPending => "enrollment pending",
            NotManagedReason::ManagedElsewhere => "enrolled in another management solution",
            NotManagedReason::NotConnected => "not connected to this control plane",
        })
    }
}

/// Errors returned by [`DeviceActionService::request_action`].
///
/// Validation variants are produced before anything is persisted or sent.
///
/// [`DeviceActionService::request_action`]: crate::actions::DeviceActionService::request_action
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("device not found: {0}")]
    NotFound(DeviceId),

    /// Permanent; callers must not retry automatically.
    #[error("device is not managed: {0}")]
    NotManaged(NotManagedReason),

    #[error("platform {0} does not support device actions")]
    UnsupportedPlatform(Platform),

    #[error("{0} is disabled")]
    CapabilityDisabled(Capability),

    #[error("conflicting action: {0}")]
    ConflictingPendingAction(PendingKind),

    #[error("device has already been wiped")]
    AlreadyWiped,

    #[error("device is locked; unlock it first")]
    CannotActWhileLocked,

    #[error("device is already locked")]
    AlreadyLocked,

    #[error("device is not locked")]
    NotLocked,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("store error: {0}")]
    Store(StoreError),

    /// The OS random source failed while generating an unlock PIN
    #[error("could not generate unlock PIN: {0}")]
    PinGeneration(String),
}

impl From<StoreError> for ActionError {
    fn from(e: StoreError) -> Self {
        match e {
            // A lost insert race is reported exactly like the conflict gate.
            StoreError::PendingConflict { pending, .. } => ActionError::ConflictingPendingAction(pending),
            other => ActionError::Store(other),
        }
    }
}

impl ActionError {
    /// Stable machine-readable code for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            ActionError::NotFound(_) => "not_found",
            ActionError::NotManaged(_) => "not_managed",
            ActionError::UnsupportedPlatform(_) => "unsupported_platform",
            ActionError::CapabilityDisabled(_) => "capability_disabled",
            ActionError::ConflictingPendingAction(_) => "conflicting_pending_action",
            ActionError::AlreadyWiped => "already_wiped",
            ActionError::CannotActWhileLocked => "cannot_act_while_locked",
            ActionError::AlreadyLocked => "already_locked",
            ActionError::NotLocked => "not_locked",
            ActionError::Transport(_) => "transport_error",
            ActionError::Store(_) | ActionError::PinGeneration(_) => "internal",
        }
    }

    /// Whether the error came from request validation (no side effects).
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            ActionError::Transport(_) | ActionError::Store(_) | ActionError::PinGeneration(_)
        )
    }

    /// Message safe to show to an operator. Storage details are not exposed.
    pub fn user_message(&self) -> String {
        match self {
            ActionError::Store(_) | ActionError::PinGeneration(_) => "internal error".to_string(),
            ActionError::ConflictingPendingAction(kind) => format!(
                "another action is still pending on this device ({kind}); wait for it to complete"
            ),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Correlator Errors
// ============================================================================

/// Errors returned by [`ResultCorrelator::record_result`].
///
/// [`ResultCorrelator::record_result`]: crate::correlator::ResultCorrelator::record_result
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("unknown correlation id: {0}")]
    UnknownCorrelation(String),

    /// A script result arrived for a protocol command or vice versa
    #[error("result channel mismatch for {correlation_id}: expected {expected}, got {actual}")]
    ChannelMismatch {
        correlation_id: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// Unified Core Error
// ============================================================================

/// Unified error type for DMC Core operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("action error: {0}")]
    Action(#[from] ActionError),

    #[error("correlator error: {0}")]
    Correlator(#[from] CorrelatorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
