//! Command transport adapter.
//!
//! The control plane hands commands to one of two delivery queues and never
//! waits for the device to execute them:
//! - the protocol command queue, drained when a push wakes the device, and
//! - the script execution queue, drained by the device's local agent.
//!
//! Correlation ids are minted by the caller and carried in the request. An
//! adapter returns the id under which it actually queued the item; well-behaved
//! adapters echo the caller's id back.

use async_trait::async_trait;
use tracing::info;

use crate::errors::TransportError;
use crate::types::{ActionKind, CorrelationId, DeviceId, Platform};

// ============================================================================
// Payloads
// ============================================================================

/// Remote management commands issued by this control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCommandKind {
    /// Apple `DeviceLock`, carries an unlock PIN
    DeviceLock,
    /// Apple `EraseDevice`
    EraseDevice,
    /// Windows MDM `RemoteWipe/doWipeProtected`
    RemoteWipe,
}

impl ProtocolCommandKind {
    pub fn request_type(self) -> &'static str {
        match self {
            ProtocolCommandKind::DeviceLock => "DeviceLock",
            ProtocolCommandKind::EraseDevice => "EraseDevice",
            ProtocolCommandKind::RemoteWipe => "./Device/Vendor/MSFT/RemoteWipe/doWipeProtected",
        }
    }
}

/// A protocol command ready to enqueue.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtocolCommand {
    pub command_uuid: CorrelationId,
    pub kind: ProtocolCommandKind,
    pub platform: Platform,
    /// Unlock PIN, set for `DeviceLock` only.
    pub pin: Option<String>,
}

impl std::fmt::Debug for ProtocolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolCommand")
            .field("command_uuid", &self.command_uuid)
            .field("kind", &self.kind)
            .field("platform", &self.platform)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Scripts bundled with the control plane for device actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinScript {
    LockWindows,
    UnlockWindows,
    LockLinux,
    UnlockLinux,
    WipeLinux,
}

impl BuiltinScript {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinScript::LockWindows => "windows_lock.ps1",
            BuiltinScript::UnlockWindows => "windows_unlock.ps1",
            BuiltinScript::LockLinux => "linux_lock.sh",
            BuiltinScript::UnlockLinux => "linux_unlock.sh",
            BuiltinScript::WipeLinux => "linux_wipe.sh",
        }
    }

    pub fn action(self) -> ActionKind {
        match self {
            BuiltinScript::LockWindows | BuiltinScript::LockLinux => ActionKind::Lock,
            BuiltinScript::UnlockWindows | BuiltinScript::UnlockLinux => ActionKind::Unlock,
            BuiltinScript::WipeLinux => ActionKind::Wipe,
        }
    }

    pub fn contents(self) -> &'static str {
        match self {
            BuiltinScript::LockWindows => {
                "Get-LocalUser | Where-Object { $_.Enabled } | Disable-LocalUser\r\n\
                 rundll32.exe user32.dll,LockWorkStation\r\n\
                 shutdown /l /f\r\n"
            }
            BuiltinScript::UnlockWindows => {
                "Get-LocalUser | Where-Object { -not $_.Enabled -and $_.Name -ne 'Guest' } | Enable-LocalUser\r\n"
            }
            BuiltinScript::LockLinux => {
                "#!/bin/sh\nset -e\n\
                 for u in $(awk -F: '$3 >= 1000 && $7 !~ /nologin|false/ {print $1}' /etc/passwd); do\n\
                 \tpasswd -l \"$u\"\n\
                 \tloginctl terminate-user \"$u\" || true\n\
                 done\n"
            }
            BuiltinScript::UnlockLinux => {
                "#!/bin/sh\nset -e\n\
                 for u in $(awk -F: '$3 >= 1000 && $7 !~ /nologin|false/ {print $1}' /etc/passwd); do\n\
                 \tpasswd -u \"$u\"\n\
                 done\n"
            }
            BuiltinScript::WipeLinux => {
                "#!/bin/sh\nset -e\n\
                 find /home -mindepth 1 -delete\n\
                 find / -xdev -mindepth 1 -maxdepth 1 ! -name proc ! -name sys ! -name dev -exec rm -rf {} +\n"
            }
        }
    }
}

/// A script execution ready to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub execution_id: CorrelationId,
    pub script: BuiltinScript,
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Enqueue-only access to the two delivery channels.
///
/// Both calls must be bounded and fast: they enqueue and return, and results
/// arrive later through the result correlator.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Queue a protocol command for the device and trigger a push.
    ///
    /// # Returns
    /// * `Ok(id)` - Correlation id the command was queued under
    /// * `Err(TransportError)` - Nothing was queued
    async fn enqueue_protocol_command(
        &self,
        device_id: &DeviceId,
        command: &ProtocolCommand,
    ) -> Result<CorrelationId, TransportError>;

    /// Queue a script execution for the device's agent.
    ///
    /// # Returns
    /// * `Ok(id)` - Execution id the script was queued under
    /// * `Err(TransportError)` - Nothing was queued
    async fn enqueue_script_execution(
        &self,
        device_id: &DeviceId,
        request: &ScriptRequest,
    ) -> Result<CorrelationId, TransportError>;
}

/// Transport that accepts everything and only traces it. Used by the demo
/// binary and for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTransport;

#[async_trait]
impl CommandTransport for LoggingTransport {
    async fn enqueue_protocol_command(
        &self,
        device_id: &DeviceId,
        command: &ProtocolCommand,
    ) -> Result<CorrelationId, TransportError> {
        info!(
            device_id = %device_id,
            command_uuid = %command.command_uuid,
            request_type = command.kind.request_type(),
            "Enqueued protocol command"
        );
        Ok(command.command_uuid.clone())
    }

    async fn enqueue_script_execution(
        &self,
        device_id: &DeviceId,
        request: &ScriptRequest,
    ) -> Result<CorrelationId, TransportError> {
        info!(
            device_id = %device_id,
            execution_id = %request.execution_id,
            script = request.script.name(),
            "Enqueued script execution"
        );
        Ok(request.execution_id.clone())
    }
}
