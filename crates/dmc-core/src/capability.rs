//! Device capability resolution and the per-platform delivery matrix.
//!
//! Which channel an action goes through depends on both the platform and the
//! action. Windows, for example, locks through a script but wipes through a
//! protocol command. The matrix is resolved once, up front, into a
//! [`Delivery`] value and the rest of the request path only matches on that.

use crate::config::{ControlPlaneConfig, FeatureConfig};
use crate::errors::{ActionError, Capability, NotManagedReason};
use crate::transport::{BuiltinScript, ProtocolCommandKind};
use crate::types::{ActionKind, Device, EnrollmentStatus, Platform, PlatformClass};

/// How an action reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Protocol(ProtocolCommandKind),
    Script(BuiltinScript),
    /// Nothing is sent; the operator is shown the PIN from the last lock.
    PinDisplay,
}

impl Delivery {
    /// Delivery mechanism for `kind` on `platform`, or `None` if the platform
    /// has no mechanism at all.
    pub fn for_action(platform: Platform, kind: ActionKind) -> Option<Delivery> {
        use ActionKind::*;
        use Platform::*;

        let delivery = match (platform, kind) {
            (MacOs | Ios | IpadOs, Lock) => Delivery::Protocol(ProtocolCommandKind::DeviceLock),
            (MacOs | Ios | IpadOs, Unlock) => Delivery::PinDisplay,
            (MacOs | Ios | IpadOs, Wipe) => Delivery::Protocol(ProtocolCommandKind::EraseDevice),

            (Windows, Lock) => Delivery::Script(BuiltinScript::LockWindows),
            (Windows, Unlock) => Delivery::Script(BuiltinScript::UnlockWindows),
            (Windows, Wipe) => Delivery::Protocol(ProtocolCommandKind::RemoteWipe),

            (Linux, Lock) => Delivery::Script(BuiltinScript::LockLinux),
            (Linux, Unlock) => Delivery::Script(BuiltinScript::UnlockLinux),
            (Linux, Wipe) => Delivery::Script(BuiltinScript::WipeLinux),

            (Unknown, _) => return None,
        };
        Some(delivery)
    }

    /// Whether a fresh unlock PIN is generated for this delivery.
    pub fn generates_pin(self) -> bool {
        matches!(self, Delivery::Protocol(ProtocolCommandKind::DeviceLock))
    }
}

/// What the control plane can currently do with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// `None` if the device is not actionable or its platform is unsupported.
    pub class: Option<PlatformClass>,
    /// Whether script executions would currently be accepted for the device.
    pub scripts_supported: bool,
}

/// Resolves platform class, actionability, and capability gates.
#[derive(Debug, Clone)]
pub struct CapabilityResolver {
    solution_name: String,
    features: FeatureConfig,
}

impl CapabilityResolver {
    pub fn new(solution_name: impl Into<String>, features: FeatureConfig) -> Self {
        Self {
            solution_name: solution_name.into(),
            features,
        }
    }

    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self::new(config.management_solution_name.clone(), config.features.clone())
    }

    /// Summarize the device's platform class and script support.
    pub fn resolve(&self, device: &Device) -> DeviceCapabilities {
        let class = match self.check_actionable(device) {
            Ok(class) => Some(class),
            Err(_) => None,
        };
        DeviceCapabilities {
            class,
            scripts_supported: class.is_some()
                && self.features.scripts_enabled
                && device.agent_supports_scripts,
        }
    }

    /// Verify the device is enrolled with this control plane and on a
    /// supported platform.
    pub fn check_actionable(&self, device: &Device) -> Result<PlatformClass, ActionError> {
        let enrollment = &device.enrollment;
        match enrollment.status {
            EnrollmentStatus::Unenrolled => {
                return Err(ActionError::NotManaged(NotManagedReason::NotEnrolled))
            }
            EnrollmentStatus::Pending => {
                return Err(ActionError::NotManaged(NotManagedReason::EnrollmentPending))
            }
            EnrollmentStatus::Enrolled => {}
        }
        if enrollment.solution_name != self.solution_name {
            return Err(ActionError::NotManaged(NotManagedReason::ManagedElsewhere));
        }
        if !enrollment.connected_to_this_control_plane {
            return Err(ActionError::NotManaged(NotManagedReason::NotConnected));
        }
        device
            .platform
            .class()
            .ok_or(ActionError::UnsupportedPlatform(device.platform))
    }

    /// Check the fleet-level switch (and agent support) the delivery needs.
    pub fn require(&self, device: &Device, delivery: Delivery) -> Result<(), ActionError> {
        match delivery {
            Delivery::Protocol(_) | Delivery::PinDisplay => {
                let (enabled, capability) = match device.platform {
                    Platform::Windows => (self.features.windows_mdm_enabled, Capability::WindowsMdm),
                    _ => (self.features.apple_mdm_enabled, Capability::AppleMdm),
                };
                if !enabled {
                    return Err(ActionError::CapabilityDisabled(capability));
                }
            }
            Delivery::Script(_) => {
                if !self.features.scripts_enabled {
                    return Err(ActionError::CapabilityDisabled(Capability::ScriptExecution));
                }
                if !device.agent_supports_scripts {
                    return Err(ActionError::CapabilityDisabled(Capability::AgentScripts));
                }
            }
        }
        Ok(())
    }

    /// Run the actionability and capability gates and pick the delivery.
    pub fn plan(&self, device: &Device, kind: ActionKind) -> Result<Delivery, ActionError> {
        self.check_actionable(device)?;
        let delivery = Delivery::for_action(device.platform, kind)
            .ok_or(ActionError::UnsupportedPlatform(device.platform))?;
        self.require(device, delivery)?;
        Ok(delivery)
    }
}
