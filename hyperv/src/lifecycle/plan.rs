//! Update planning: replacement decision, core setting diffs and
//! set reconciliation of disks and adapters.

use core::fmt;

use crate::error::Result;
use crate::host::{HostCapabilities, VmConfiguration};
use crate::storage::{ControllerType, HardDriveSpec};
use crate::vm::{AutomaticActions, MemoryConfiguration, ProcessorCount, VirtualMachineSpec};

/// Field whose change forces the VM to be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceReason {
    MachineName,
    Generation,
    Triggers,
}

impl fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceReason::MachineName => write!(f, "machineName"),
            ReplaceReason::Generation => write!(f, "generation"),
            ReplaceReason::Triggers => write!(f, "triggers"),
        }
    }
}

/// How an update is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePlan {
    /// Delete the old VM and create the new one.
    Replace(Vec<ReplaceReason>),
    /// Mutate the existing VM.
    InPlace,
}

impl UpdatePlan {
    pub fn between(previous: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Self {
        let mut reasons = Vec::new();
        if previous.machine_name != desired.machine_name {
            reasons.push(ReplaceReason::MachineName);
        }
        if previous.generation != desired.generation {
            reasons.push(ReplaceReason::Generation);
        }
        if previous.triggers != desired.triggers {
            reasons.push(ReplaceReason::Triggers);
        }
        if reasons.is_empty() {
            UpdatePlan::InPlace
        } else {
            UpdatePlan::Replace(reasons)
        }
    }
}

/// Entries to detach and attach to turn the live set into the desired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetChanges<T> {
    pub detach: Vec<T>,
    pub attach: Vec<T>,
}

impl<T> SetChanges<T> {
    pub fn is_empty(&self) -> bool {
        self.detach.is_empty() && self.attach.is_empty()
    }
}

/// Reconcile one attachment set.
///
/// Detaches what the previous state owned, the desired state drops, and
/// the host still has. Attaches what the desired state wants and the host
/// lacks. Entries present on the host but never tracked are left alone.
pub fn reconcile<T: PartialEq + Clone>(previous: &[T], desired: &[T], live: &[T]) -> SetChanges<T> {
    let detach = previous
        .iter()
        .filter(|p| !desired.contains(p) && live.contains(p))
        .cloned()
        .collect();
    let attach = desired
        .iter()
        .filter(|d| !live.contains(d))
        .cloned()
        .collect();
    SetChanges { detach, attach }
}

/// Core settings that differ between the host and the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreChanges {
    pub memory: Option<MemoryConfiguration>,
    pub processors: Option<ProcessorCount>,
    pub automatic_actions: Option<AutomaticActions>,
}

impl CoreChanges {
    /// Compare against the live configuration, after host rounding.
    pub fn between(live: &VmConfiguration, desired: &VirtualMachineSpec) -> Result<Self> {
        let memory = desired.memory_configuration()?.aligned();
        let processors = desired.processors()?;
        let actions = desired.automatic_actions();
        Ok(Self {
            memory: (memory != live.memory).then_some(memory),
            processors: (processors != live.processors).then_some(processors),
            automatic_actions: (actions != live.automatic_actions).then_some(actions),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_none() && self.processors.is_none() && self.automatic_actions.is_none()
    }

    /// Properties the host cannot change while the VM runs.
    pub fn requiring_stop(&self, capabilities: &HostCapabilities) -> Vec<&'static str> {
        let mut properties = Vec::new();
        if self.memory.is_some() && !capabilities.live_memory_resize {
            properties.push("memorySize");
        }
        if self.processors.is_some() && !capabilities.live_processor_change {
            properties.push("processorCount");
        }
        properties
    }
}

/// Emulated IDE drives cannot be hot-plugged.
pub fn disk_changes_require_stop(changes: &SetChanges<HardDriveSpec>) -> bool {
    changes
        .detach
        .iter()
        .chain(&changes.attach)
        .any(|d| d.controller_type == ControllerType::Ide)
}
