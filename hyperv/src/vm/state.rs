use core::fmt;

use serde::{Deserialize, Serialize};

/// VM enabled state (Msvm_ComputerSystem.EnabledState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u16)]
pub enum VmState {
    /// Unknown state.
    #[default]
    Unknown = 0,
    /// VM is running.
    Running = 2,
    /// VM is powered off.
    Off = 3,
    /// VM is in the process of shutting down.
    ShuttingDown = 4,
    /// Not applicable.
    NotApplicable = 5,
    /// VM is disabled.
    Disabled = 6,
    /// VM is paused.
    Paused = 32768,
    /// VM is suspended/saved.
    Suspended = 32769,
    /// VM is starting.
    Starting = 32770,
    /// VM is taking a snapshot.
    Snapshotting = 32771,
    /// VM is saving state.
    Saving = 32773,
    /// VM is stopping.
    Stopping = 32774,
    /// VM is pausing.
    Pausing = 32776,
    /// VM is resuming.
    Resuming = 32777,
}

impl VmState {
    /// Parse from WMI EnabledState value.
    pub fn from_enabled_state(value: u16) -> Self {
        match value {
            2 => VmState::Running,
            3 => VmState::Off,
            4 => VmState::ShuttingDown,
            5 => VmState::NotApplicable,
            6 => VmState::Disabled,
            32768 => VmState::Paused,
            32769 => VmState::Suspended,
            32770 => VmState::Starting,
            32771 => VmState::Snapshotting,
            32773 => VmState::Saving,
            32774 => VmState::Stopping,
            32776 => VmState::Pausing,
            32777 => VmState::Resuming,
            _ => VmState::Unknown,
        }
    }

    /// Check if VM can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, VmState::Off | VmState::Suspended | VmState::Paused)
    }

    /// Powered off, the only state the host destroys cleanly from.
    pub fn is_off(&self) -> bool {
        matches!(self, VmState::Off | VmState::Disabled)
    }

    /// Check if VM is in a transitional state.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            VmState::Starting
                | VmState::Stopping
                | VmState::Saving
                | VmState::Pausing
                | VmState::Resuming
                | VmState::ShuttingDown
                | VmState::Snapshotting
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Unknown => "Unknown",
            VmState::Running => "Running",
            VmState::Off => "Off",
            VmState::ShuttingDown => "Shutting Down",
            VmState::NotApplicable => "Not Applicable",
            VmState::Disabled => "Disabled",
            VmState::Paused => "Paused",
            VmState::Suspended => "Saved",
            VmState::Starting => "Starting",
            VmState::Snapshotting => "Taking Snapshot",
            VmState::Saving => "Saving",
            VmState::Stopping => "Stopping",
            VmState::Pausing => "Pausing",
            VmState::Resuming => "Resuming",
        };
        write!(f, "{}", s)
    }
}

/// VM generation (Gen1 = BIOS, Gen2 = UEFI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Generation {
    /// Generation 1 VM (BIOS-based, IDE boot).
    Gen1,
    /// Generation 2 VM (UEFI-based, SCSI boot only).
    #[default]
    Gen2,
}

impl Generation {
    /// Parse the numeric form used in desired state.
    pub fn from_number(value: u8) -> Option<Self> {
        match value {
            1 => Some(Generation::Gen1),
            2 => Some(Generation::Gen2),
            _ => None,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Generation::Gen1 => 1,
            Generation::Gen2 => 2,
        }
    }

    /// Get the WMI VirtualSystemSubType value.
    pub fn to_subtype(&self) -> &'static str {
        match self {
            Generation::Gen1 => "Microsoft:Hyper-V:SubType:1",
            Generation::Gen2 => "Microsoft:Hyper-V:SubType:2",
        }
    }

    /// Parse from WMI VirtualSystemSubType value.
    pub fn from_subtype(subtype: &str) -> Self {
        if subtype.ends_with(":2") {
            Generation::Gen2
        } else {
            Generation::Gen1
        }
    }

    /// Whether the emulated IDE bus exists on this platform.
    pub fn supports_ide(&self) -> bool {
        matches!(self, Generation::Gen1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Gen1 => write!(f, "Generation 1"),
            Generation::Gen2 => write!(f, "Generation 2"),
        }
    }
}

/// Requested state for VM state change operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestedState {
    /// Start the VM.
    Running = 2,
    /// Power off the VM (hard stop).
    Off = 3,
}

/// How a VM is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    /// Graceful shutdown through guest integration services.
    Graceful,
    /// Force power off.
    Force,
}

impl fmt::Display for ShutdownType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownType::Graceful => write!(f, "graceful"),
            ShutdownType::Force => write!(f, "force"),
        }
    }
}

/// What the host does with the VM when the host starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AutomaticStartAction {
    /// Do nothing on host start.
    #[default]
    Nothing,
    /// Automatically start if VM was running.
    StartIfRunning,
    /// Always start the VM.
    Start,
}

impl AutomaticStartAction {
    /// Msvm_VirtualSystemSettingData.AutomaticStartupAction value.
    pub fn to_value(&self) -> u16 {
        match self {
            AutomaticStartAction::Nothing => 2,
            AutomaticStartAction::StartIfRunning => 3,
            AutomaticStartAction::Start => 4,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            3 => AutomaticStartAction::StartIfRunning,
            4 => AutomaticStartAction::Start,
            _ => AutomaticStartAction::Nothing,
        }
    }
}

/// What the host does with the VM when the host shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AutomaticStopAction {
    /// Turn off the VM.
    #[default]
    TurnOff,
    /// Save the VM state.
    Save,
    /// Graceful shutdown.
    ShutDown,
}

impl AutomaticStopAction {
    /// Msvm_VirtualSystemSettingData.AutomaticShutdownAction value.
    pub fn to_value(&self) -> u16 {
        match self {
            AutomaticStopAction::TurnOff => 2,
            AutomaticStopAction::Save => 3,
            AutomaticStopAction::ShutDown => 4,
        }
    }

    pub fn from_value(value: u16) -> Self {
        match value {
            3 => AutomaticStopAction::Save,
            4 => AutomaticStopAction::ShutDown,
            _ => AutomaticStopAction::TurnOff,
        }
    }
}

/// Start and stop policy applied together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AutomaticActions {
    pub start: AutomaticStartAction,
    pub stop: AutomaticStopAction,
}

impl AutomaticActions {
    /// Msvm_VirtualSystemSettingData properties carrying these actions.
    pub fn setting_values(&self) -> [(&'static str, u16); 2] {
        [
            ("AutomaticStartupAction", self.start.to_value()),
            ("AutomaticShutdownAction", self.stop.to_value()),
        ]
    }
}
