use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::NetworkAdapterSpec;
use crate::storage::HardDriveSpec;
use crate::vm::{
    AutomaticActions, AutomaticStartAction, AutomaticStopAction, DynamicMemory, Generation,
    MemoryConfiguration, MemoryMB, ProcessorCount, VmState,
};

fn default_generation() -> u8 {
    2
}

fn default_processor_count() -> u32 {
    1
}

fn default_memory_size() -> u64 {
    1024
}

/// Desired state of a virtual machine.
///
/// Raw numeric fields mirror the inbound record; call [`validate`](Self::validate)
/// or one of the typed accessors to get range-checked values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Unique VM name on the host.
    pub machine_name: String,
    #[serde(default = "default_generation")]
    pub generation: u8,
    #[serde(default = "default_processor_count")]
    pub processor_count: u32,
    /// Startup memory in MB.
    #[serde(default = "default_memory_size")]
    pub memory_size: u64,
    #[serde(default)]
    pub dynamic_memory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_memory: Option<u64>,
    #[serde(default)]
    pub auto_start_action: AutomaticStartAction,
    #[serde(default)]
    pub auto_stop_action: AutomaticStopAction,
    #[serde(default)]
    pub hard_drives: Vec<HardDriveSpec>,
    #[serde(default)]
    pub network_adapters: Vec<NetworkAdapterSpec>,
    /// Opaque values; any change forces the VM to be recreated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<serde_json::Value>,
}

impl VirtualMachineSpec {
    /// Spec with every optional field at its default.
    pub fn new(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
            generation: default_generation(),
            processor_count: default_processor_count(),
            memory_size: default_memory_size(),
            dynamic_memory: false,
            minimum_memory: None,
            maximum_memory: None,
            auto_start_action: AutomaticStartAction::default(),
            auto_stop_action: AutomaticStopAction::default(),
            hard_drives: Vec::new(),
            network_adapters: Vec::new(),
            triggers: Vec::new(),
        }
    }

    /// Create a new builder.
    pub fn builder(machine_name: impl Into<String>) -> VirtualMachineSpecBuilder {
        VirtualMachineSpecBuilder {
            spec: Self::new(machine_name),
        }
    }

    /// Validated generation.
    pub fn vm_generation(&self) -> Result<Generation> {
        Generation::from_number(self.generation).ok_or_else(|| {
            Error::validation(
                "generation",
                format!("generation must be 1 or 2, got {}", self.generation),
            )
        })
    }

    /// Validated processor count.
    pub fn processors(&self) -> Result<ProcessorCount> {
        ProcessorCount::new(self.processor_count).ok_or_else(|| {
            Error::validation(
                "processorCount",
                format!(
                    "processor count must be between {} and {}, got {}",
                    ProcessorCount::MIN,
                    ProcessorCount::MAX,
                    self.processor_count
                ),
            )
        })
    }

    /// Validated startup memory and dynamic bounds.
    pub fn memory_configuration(&self) -> Result<MemoryConfiguration> {
        let startup = memory_field("memorySize", self.memory_size)?;

        if !self.dynamic_memory {
            if self.minimum_memory.is_some() || self.maximum_memory.is_some() {
                return Err(Error::validation(
                    "dynamicMemory",
                    "minimumMemory and maximumMemory are only allowed with dynamic memory",
                ));
            }
            return Ok(MemoryConfiguration::fixed(startup));
        }

        let (minimum, maximum) = match (self.minimum_memory, self.maximum_memory) {
            (Some(min), Some(max)) => (
                memory_field("minimumMemory", min)?,
                memory_field("maximumMemory", max)?,
            ),
            _ => {
                return Err(Error::validation(
                    "dynamicMemory",
                    "dynamic memory requires both minimumMemory and maximumMemory",
                ))
            }
        };

        if minimum > startup {
            return Err(Error::validation(
                "minimumMemory",
                format!(
                    "minimum memory {} cannot exceed startup memory {}",
                    minimum, startup
                ),
            ));
        }
        if maximum < startup {
            return Err(Error::validation(
                "maximumMemory",
                format!(
                    "maximum memory {} cannot be less than startup memory {}",
                    maximum, startup
                ),
            ));
        }

        Ok(MemoryConfiguration {
            startup,
            dynamic: Some(DynamicMemory { minimum, maximum }),
        })
    }

    pub fn automatic_actions(&self) -> AutomaticActions {
        AutomaticActions {
            start: self.auto_start_action,
            stop: self.auto_stop_action,
        }
    }

    /// Validate every field and the cross-field constraints.
    ///
    /// Runs before any host call; a failure here never leaves host state behind.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.machine_name)?;
        let generation = self.vm_generation()?;
        self.processors()?;
        self.memory_configuration()?;

        let mut slots = HashSet::new();
        for drive in &self.hard_drives {
            drive.validate(generation)?;
            if !slots.insert(drive.slot()) {
                return Err(Error::validation(
                    "hardDrives",
                    format!("slot {} is used by more than one disk", drive.slot()),
                ));
            }
        }

        for (i, adapter) in self.network_adapters.iter().enumerate() {
            adapter.validate()?;
            if self.network_adapters[..i].contains(adapter) {
                return Err(Error::validation(
                    "networkAdapters",
                    format!("adapter {} is listed more than once", adapter),
                ));
            }
        }

        Ok(())
    }
}

fn memory_field(field: &'static str, mb: u64) -> Result<MemoryMB> {
    MemoryMB::new(mb).ok_or_else(|| {
        Error::validation(
            field,
            format!(
                "{} MB is outside the supported range {}-{} MB",
                mb,
                MemoryMB::MIN,
                MemoryMB::MAX
            ),
        )
    })
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("machineName", "VM name cannot be empty"));
    }
    if name.chars().count() > 100 {
        return Err(Error::validation(
            "machineName",
            "VM name cannot exceed 100 characters",
        ));
    }
    if name
        .chars()
        .any(|c| matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
    {
        return Err(Error::validation(
            "machineName",
            "VM name contains invalid characters",
        ));
    }
    Ok(())
}

/// Builder for [`VirtualMachineSpec`]; `build` validates.
#[derive(Debug, Clone)]
pub struct VirtualMachineSpecBuilder {
    spec: VirtualMachineSpec,
}

impl VirtualMachineSpecBuilder {
    pub fn generation(mut self, generation: Generation) -> Self {
        self.spec.generation = generation.number();
        self
    }

    pub fn processor_count(mut self, count: u32) -> Self {
        self.spec.processor_count = count;
        self
    }

    /// Set startup memory in MB.
    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.spec.memory_size = mb;
        self
    }

    /// Enable dynamic memory with the given bounds (MB).
    pub fn dynamic_memory(mut self, minimum_mb: u64, maximum_mb: u64) -> Self {
        self.spec.dynamic_memory = true;
        self.spec.minimum_memory = Some(minimum_mb);
        self.spec.maximum_memory = Some(maximum_mb);
        self
    }

    pub fn auto_start_action(mut self, action: AutomaticStartAction) -> Self {
        self.spec.auto_start_action = action;
        self
    }

    pub fn auto_stop_action(mut self, action: AutomaticStopAction) -> Self {
        self.spec.auto_stop_action = action;
        self
    }

    pub fn hard_drive(mut self, drive: HardDriveSpec) -> Self {
        self.spec.hard_drives.push(drive);
        self
    }

    pub fn network_adapter(mut self, adapter: NetworkAdapterSpec) -> Self {
        self.spec.network_adapters.push(adapter);
        self
    }

    pub fn trigger(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.spec.triggers.push(value.into());
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<VirtualMachineSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Observed state of a VM as read back from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineState {
    /// Host-assigned identifier, distinct from the name.
    pub vm_id: String,
    #[serde(default)]
    pub power_state: VmState,
    #[serde(flatten)]
    pub spec: VirtualMachineSpec,
}

impl VirtualMachineState {
    pub fn name(&self) -> &str {
        &self.spec.machine_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskSlot;

    #[test]
    fn test_defaults_from_minimal_json() {
        let spec: VirtualMachineSpec = serde_json::from_str(r#"{"machineName":"vm1"}"#).unwrap();
        assert_eq!(spec, VirtualMachineSpec::new("vm1"));
        assert_eq!(spec.generation, 2);
        assert_eq!(spec.processor_count, 1);
        assert_eq!(spec.memory_size, 1024);
        assert_eq!(spec.auto_start_action, AutomaticStartAction::Nothing);
        assert_eq!(spec.auto_stop_action, AutomaticStopAction::TurnOff);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_dynamic_memory_within_bounds_is_accepted() {
        let spec = VirtualMachineSpec::builder("vm1")
            .memory_mb(1024)
            .dynamic_memory(512, 4096)
            .build()
            .unwrap();
        let memory = spec.memory_configuration().unwrap();
        assert_eq!(memory.startup.as_mb(), 1024);
        assert_eq!(memory.dynamic.unwrap().minimum.as_mb(), 512);
        assert_eq!(memory.dynamic.unwrap().maximum.as_mb(), 4096);
    }

    #[test]
    fn test_dynamic_memory_minimum_above_startup_is_rejected() {
        let err = VirtualMachineSpec::builder("vm1")
            .memory_mb(1024)
            .dynamic_memory(2048, 4096)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "minimumMemory", .. }));
    }

    #[test]
    fn test_dynamic_memory_maximum_below_startup_is_rejected() {
        let err = VirtualMachineSpec::builder("vm1")
            .memory_mb(4096)
            .dynamic_memory(512, 2048)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "maximumMemory", .. }));
    }

    #[test]
    fn test_dynamic_memory_bounds_required_together() {
        let mut spec = VirtualMachineSpec::new("vm1");
        spec.dynamic_memory = true;
        spec.minimum_memory = Some(512);
        assert!(matches!(
            spec.validate(),
            Err(Error::Validation { field: "dynamicMemory", .. })
        ));

        let mut spec = VirtualMachineSpec::new("vm1");
        spec.maximum_memory = Some(4096);
        assert!(matches!(
            spec.validate(),
            Err(Error::Validation { field: "dynamicMemory", .. })
        ));
    }

    #[test]
    fn test_generation_must_be_one_or_two() {
        let mut spec = VirtualMachineSpec::new("vm1");
        spec.generation = 3;
        assert!(matches!(
            spec.validate(),
            Err(Error::Validation { field: "generation", .. })
        ));
        spec.generation = 1;
        assert_eq!(spec.vm_generation().unwrap(), Generation::Gen1);
    }

    #[test]
    fn test_name_rules() {
        assert!(VirtualMachineSpec::new("").validate().is_err());
        assert!(VirtualMachineSpec::new("a/b").validate().is_err());
        assert!(VirtualMachineSpec::new("x".repeat(101)).validate().is_err());
        assert!(VirtualMachineSpec::new("web-01").validate().is_ok());
    }

    #[test]
    fn test_memory_and_processor_ranges() {
        assert!(VirtualMachineSpec::builder("vm1").memory_mb(16).build().is_err());
        assert!(VirtualMachineSpec::builder("vm1")
            .processor_count(0)
            .build()
            .is_err());
        assert!(VirtualMachineSpec::builder("vm1")
            .processor_count(241)
            .build()
            .is_err());
    }

    #[test]
    fn test_duplicate_disk_slots_are_rejected() {
        let err = VirtualMachineSpec::builder("vm1")
            .hard_drive(HardDriveSpec::new("/a.vhdx"))
            .hard_drive(HardDriveSpec::new("/b.vhdx"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "hardDrives", .. }));

        assert!(VirtualMachineSpec::builder("vm1")
            .hard_drive(HardDriveSpec::new("/a.vhdx"))
            .hard_drive(HardDriveSpec::new("/b.vhdx").at(DiskSlot::scsi(0, 1)))
            .build()
            .is_ok());
    }

    #[test]
    fn test_duplicate_adapters_are_rejected() {
        let err = VirtualMachineSpec::builder("vm1")
            .network_adapter(NetworkAdapterSpec::new("external"))
            .network_adapter(NetworkAdapterSpec::new("external"))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation { field: "networkAdapters", .. }));
    }

    #[test]
    fn test_state_flattens_spec_fields() {
        let state = VirtualMachineState {
            vm_id: "1234".to_string(),
            power_state: VmState::Running,
            spec: VirtualMachineSpec::builder("vm1")
                .hard_drive(HardDriveSpec::new("/d.vhdx"))
                .build()
                .unwrap(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["vmId"], "1234");
        assert_eq!(json["machineName"], "vm1");
        assert_eq!(json["memorySize"], 1024);
        assert_eq!(json["hardDrives"][0]["path"], "/d.vhdx");

        let back: VirtualMachineState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.name(), "vm1");
    }
}
