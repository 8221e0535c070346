//! Domain types shared by the verification engine, the action state machine,
//! and the result correlator.
//!
//! Everything here is plain data. Authoritative copies live in the [`Store`];
//! services load them fresh on every call and never cache them.
//!
//! [`Store`]: crate::store::Store

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable device identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Generate a fresh random device identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(DeviceId)
            .map_err(|e| format!("invalid device id {s:?}: {e}"))
    }
}

/// Identifier used to match an asynchronous command or script result back to
/// the request that produced it.
///
/// Protocol commands use it as the command UUID; script executions use it as
/// the execution id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a new correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Operating system family of an enrolled device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Ios,
    IpadOs,
    Windows,
    Linux,
    /// Anything the control plane has no delivery mechanism for (e.g. ChromeOS).
    Unknown,
}

/// Grouping of platforms by the delivery mechanism they primarily support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformClass {
    /// Supports push-triggered remote management commands.
    ProtocolManaged,
    /// Supports only agent-side script execution (plus, on Windows, a
    /// protocol wipe).
    ScriptManaged,
}

impl Platform {
    /// Platform class, or `None` for platforms with no supported mechanism.
    pub fn class(self) -> Option<PlatformClass> {
        match self {
            Platform::MacOs | Platform::Ios | Platform::IpadOs => {
                Some(PlatformClass::ProtocolManaged)
            }
            Platform::Windows | Platform::Linux => Some(PlatformClass::ScriptManaged),
            Platform::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::MacOs => "macos",
            Platform::Ios => "ios",
            Platform::IpadOs => "ipados",
            Platform::Windows => "windows",
            Platform::Linux => "linux",
            Platform::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "macos" | "darwin" => Ok(Platform::MacOs),
            "ios" => Ok(Platform::Ios),
            "ipados" => Ok(Platform::IpadOs),
            "windows" => Ok(Platform::Windows),
            "linux" => Ok(Platform::Linux),
            "unknown" => Ok(Platform::Unknown),
            _ => Err(format!("invalid platform: {s}")),
        }
    }
}

/// Enrollment lifecycle of a device's management record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    /// Enrollment started but the device has not completed it yet.
    Pending,
    Unenrolled,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Unenrolled => "unenrolled",
        }
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrolled" => Ok(EnrollmentStatus::Enrolled),
            "pending" => Ok(EnrollmentStatus::Pending),
            "unenrolled" => Ok(EnrollmentStatus::Unenrolled),
            _ => Err(format!("invalid enrollment status: {s}")),
        }
    }
}

/// Who manages the device and whether that is us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub status: EnrollmentStatus,
    /// Name of the management solution the device is enrolled under.
    pub solution_name: String,
    /// Whether the enrollment points at this control plane instance.
    pub connected_to_this_control_plane: bool,
}

/// A device as known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub hostname: String,
    pub platform: Platform,
    pub enrollment: Enrollment,
    /// Whether the device's local agent reports it can run scripts.
    pub agent_supports_scripts: bool,
    /// When the device last reported its details (check-in time).
    pub detail_updated_at: DateTime<Utc>,
}

// ============================================================================
// Profiles
// ============================================================================

/// A profile the administrator expects to be installed on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedProfile {
    pub identifier: String,
    /// Installs older than this come from a previous revision of the profile
    /// and do not count as evidence of compliance.
    pub earliest_install_date: DateTime<Utc>,
}

/// One entry of a device's self-reported installed profile list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledProfile {
    pub install_date: DateTime<Utc>,
}

/// Installed profiles keyed by profile identifier.
pub type InstalledProfileReport = HashMap<String, InstalledProfile>;

/// Per-profile verification state as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    /// Missing or stale, will be retried on the next cycle.
    Retrying,
    /// Still missing after the retry budget was spent.
    Failed,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationStatus::Verified => "verified",
            VerificationStatus::Retrying => "retrying",
            VerificationStatus::Failed => "failed",
        }
    }
}

impl FromStr for VerificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(VerificationStatus::Verified),
            "retrying" => Ok(VerificationStatus::Retrying),
            "failed" => Ok(VerificationStatus::Failed),
            _ => Err(format!("invalid verification status: {s}")),
        }
    }
}

/// Persisted verification result for one (device, profile) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStatus {
    pub identifier: String,
    pub status: VerificationStatus,
    pub retries: u32,
    pub updated_at: DateTime<Utc>,
}

/// The three disjoint sets produced by one verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationUpdate {
    pub verified: Vec<String>,
    pub failed: Vec<String>,
    pub retry: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Device Actions
// ============================================================================

/// Long-running device actions. At most one may be pending per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Lock,
    Unlock,
    Wipe,
}

impl ActionKind {
    pub fn pending_kind(self) -> PendingKind {
        match self {
            ActionKind::Lock => PendingKind::LockPending,
            ActionKind::Unlock => PendingKind::UnlockPending,
            ActionKind::Wipe => PendingKind::WipePending,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Lock => "lock",
            ActionKind::Unlock => "unlock",
            ActionKind::Wipe => "wipe",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock" => Ok(ActionKind::Lock),
            "unlock" => Ok(ActionKind::Unlock),
            "wipe" => Ok(ActionKind::Wipe),
            _ => Err(format!("invalid action kind: {s}")),
        }
    }
}

/// Which action is blocking a device, as reported back to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingKind {
    LockPending,
    UnlockPending,
    WipePending,
}

impl fmt::Display for PendingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PendingKind::LockPending => "LockPending",
            PendingKind::UnlockPending => "UnlockPending",
            PendingKind::WipePending => "WipePending",
        })
    }
}

/// Terminal status codes reported over the protocol channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolStatus {
    Acknowledged,
    Error,
    CommandFormatError,
    /// The device deferred the command; not terminal.
    NotNow,
}

impl ProtocolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolStatus::Acknowledged => "Acknowledged",
            ProtocolStatus::Error => "Error",
            ProtocolStatus::CommandFormatError => "CommandFormatError",
            ProtocolStatus::NotNow => "NotNow",
        }
    }

    /// Map to a terminal result; `None` means the command is still pending.
    pub fn terminal_result(self) -> Option<ActionResult> {
        match self {
            ProtocolStatus::Acknowledged => Some(ActionResult::Succeeded),
            ProtocolStatus::Error | ProtocolStatus::CommandFormatError => {
                Some(ActionResult::Failed)
            }
            ProtocolStatus::NotNow => None,
        }
    }
}

impl FromStr for ProtocolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Acknowledged" => Ok(ProtocolStatus::Acknowledged),
            "Error" => Ok(ProtocolStatus::Error),
            "CommandFormatError" => Ok(ProtocolStatus::CommandFormatError),
            "NotNow" => Ok(ProtocolStatus::NotNow),
            _ => Err(format!("invalid protocol status: {s}")),
        }
    }
}

/// Map a script exit code to a terminal result; `None` means still running.
pub fn script_terminal_result(exit_code: Option<i32>) -> Option<ActionResult> {
    match exit_code {
        None => None,
        Some(0) => Some(ActionResult::Succeeded),
        Some(_) => Some(ActionResult::Failed),
    }
}

/// Delivery channel an action went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Protocol,
    Script,
    /// Nothing is sent to the device (PIN-display unlock).
    None,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Protocol => "protocol",
            Channel::Script => "script",
            Channel::None => "none",
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "protocol" => Ok(Channel::Protocol),
            "script" => Ok(Channel::Script),
            "none" => Ok(Channel::None),
            _ => Err(format!("invalid channel: {s}")),
        }
    }
}

/// Reference to the in-flight delivery backing an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionRef {
    Protocol {
        correlation_id: CorrelationId,
        status: Option<ProtocolStatus>,
    },
    Script {
        execution_id: CorrelationId,
        exit_code: Option<i32>,
    },
    NoDelivery {
        correlation_id: CorrelationId,
    },
}

impl ActionRef {
    pub fn correlation_id(&self) -> &CorrelationId {
        match self {
            ActionRef::Protocol { correlation_id, .. } => correlation_id,
            ActionRef::Script { execution_id, .. } => execution_id,
            ActionRef::NoDelivery { correlation_id } => correlation_id,
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            ActionRef::Protocol { .. } => Channel::Protocol,
            ActionRef::Script { .. } => Channel::Script,
            ActionRef::NoDelivery { .. } => Channel::None,
        }
    }

    /// Same reference under a different correlation id.
    pub fn with_correlation_id(&self, id: CorrelationId) -> Self {
        match self {
            ActionRef::Protocol { status, .. } => ActionRef::Protocol {
                correlation_id: id,
                status: *status,
            },
            ActionRef::Script { exit_code, .. } => ActionRef::Script {
                execution_id: id,
                exit_code: *exit_code,
            },
            ActionRef::NoDelivery { .. } => ActionRef::NoDelivery { correlation_id: id },
        }
    }

    /// Split into the flat columns used by the SQL schema.
    pub fn to_parts(&self) -> (Channel, &CorrelationId, Option<ProtocolStatus>, Option<i32>) {
        match self {
            ActionRef::Protocol {
                correlation_id,
                status,
            } => (Channel::Protocol, correlation_id, *status, None),
            ActionRef::Script {
                execution_id,
                exit_code,
            } => (Channel::Script, execution_id, None, *exit_code),
            ActionRef::NoDelivery { correlation_id } => (Channel::None, correlation_id, None, None),
        }
    }

    /// Inverse of [`ActionRef::to_parts`].
    pub fn from_parts(
        channel: Channel,
        correlation_id: CorrelationId,
        status: Option<ProtocolStatus>,
        exit_code: Option<i32>,
    ) -> Self {
        match channel {
            Channel::Protocol => ActionRef::Protocol {
                correlation_id,
                status,
            },
            Channel::Script => ActionRef::Script {
                execution_id: correlation_id,
                exit_code,
            },
            Channel::None => ActionRef::NoDelivery { correlation_id },
        }
    }
}

/// Terminal outcome of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Succeeded,
    Failed,
}

impl ActionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionResult::Succeeded => "succeeded",
            ActionResult::Failed => "failed",
        }
    }
}

impl FromStr for ActionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(ActionResult::Succeeded),
            "failed" => Ok(ActionResult::Failed),
            _ => Err(format!("invalid action result: {s}")),
        }
    }
}

/// An accepted action still waiting for its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub device_id: DeviceId,
    pub kind: ActionKind,
    pub action_ref: ActionRef,
    /// PIN generated for a protocol lock. Never logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_pin: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl PendingAction {
    pub fn correlation_id(&self) -> &CorrelationId {
        self.action_ref.correlation_id()
    }
}

/// A completed action, kept for status queries and audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub device_id: DeviceId,
    pub kind: ActionKind,
    pub action_ref: ActionRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlock_pin: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub result: ActionResult,
}

impl ActionRecord {
    /// Close out a pending action.
    pub fn complete(
        pending: PendingAction,
        final_ref: ActionRef,
        result: ActionResult,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: pending.device_id,
            kind: pending.kind,
            action_ref: final_ref,
            unlock_pin: pending.unlock_pin,
            requested_at: pending.requested_at,
            completed_at,
            result,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        self.action_ref.correlation_id()
    }

    pub fn succeeded(&self) -> bool {
        self.result == ActionResult::Succeeded
    }
}
