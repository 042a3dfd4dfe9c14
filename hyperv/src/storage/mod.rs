//! Virtual hard disk attachments.
//!
//! A disk is addressed by its [`DiskSlot`]: controller bus, controller
//! number and location on that controller. The slot is the identity used
//! for every attach, detach and comparison.

mod attachment;

pub use attachment::DiskAttachmentManager;

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vm::Generation;

/// Storage controller bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ControllerType {
    /// Emulated IDE controller (Gen1 only).
    #[serde(rename = "IDE", alias = "Ide", alias = "ide")]
    Ide,
    /// Synthetic SCSI controller.
    #[default]
    #[serde(rename = "SCSI", alias = "Scsi", alias = "scsi")]
    Scsi,
}

impl ControllerType {
    /// Number of controllers of this type a VM can have.
    pub fn max_controllers(&self) -> u32 {
        match self {
            ControllerType::Ide => 2,
            ControllerType::Scsi => 4,
        }
    }

    /// Number of locations on one controller.
    pub fn max_locations(&self) -> u32 {
        match self {
            ControllerType::Ide => 2,
            ControllerType::Scsi => 64,
        }
    }

    /// ResourceSubType of the controller in the host's resource model.
    pub fn resource_subtype(&self) -> &'static str {
        match self {
            ControllerType::Ide => "Microsoft:Hyper-V:Emulated IDE Controller",
            ControllerType::Scsi => "Microsoft:Hyper-V:Synthetic SCSI Controller",
        }
    }
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerType::Ide => write!(f, "IDE"),
            ControllerType::Scsi => write!(f, "SCSI"),
        }
    }
}

/// Controller slot a disk occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiskSlot {
    pub controller_type: ControllerType,
    pub controller_number: u32,
    pub controller_location: u32,
}

impl DiskSlot {
    pub fn new(controller_type: ControllerType, controller_number: u32, controller_location: u32) -> Self {
        Self {
            controller_type,
            controller_number,
            controller_location,
        }
    }

    pub fn scsi(controller_number: u32, controller_location: u32) -> Self {
        Self::new(ControllerType::Scsi, controller_number, controller_location)
    }

    pub fn ide(controller_number: u32, controller_location: u32) -> Self {
        Self::new(ControllerType::Ide, controller_number, controller_location)
    }
}

impl fmt::Display for DiskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}",
            self.controller_type, self.controller_number, self.controller_location
        )
    }
}

/// A virtual hard disk image bound to a controller slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardDriveSpec {
    /// Filesystem location of the disk image on the host.
    pub path: String,
    #[serde(default)]
    pub controller_type: ControllerType,
    #[serde(default)]
    pub controller_number: u32,
    #[serde(default)]
    pub controller_location: u32,
}

impl HardDriveSpec {
    /// Disk on SCSI controller 0, location 0.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            controller_type: ControllerType::Scsi,
            controller_number: 0,
            controller_location: 0,
        }
    }

    /// Same disk at another slot.
    pub fn at(mut self, slot: DiskSlot) -> Self {
        self.controller_type = slot.controller_type;
        self.controller_number = slot.controller_number;
        self.controller_location = slot.controller_location;
        self
    }

    pub fn slot(&self) -> DiskSlot {
        DiskSlot::new(
            self.controller_type,
            self.controller_number,
            self.controller_location,
        )
    }

    /// Check path and slot addressing for a VM of the given generation.
    pub fn validate(&self, generation: Generation) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::validation("hardDrives.path", "disk path cannot be empty"));
        }

        let ty = self.controller_type;
        if ty == ControllerType::Ide && !generation.supports_ide() {
            return Err(Error::validation(
                "hardDrives.controllerType",
                format!("{} VMs have no IDE controller", generation),
            ));
        }
        if self.controller_number >= ty.max_controllers() {
            return Err(Error::validation(
                "hardDrives.controllerNumber",
                format!(
                    "{} controller number {} is out of range 0-{}",
                    ty,
                    self.controller_number,
                    ty.max_controllers() - 1
                ),
            ));
        }
        if self.controller_location >= ty.max_locations() {
            return Err(Error::validation(
                "hardDrives.controllerLocation",
                format!(
                    "{} controller location {} is out of range 0-{}",
                    ty,
                    self.controller_location,
                    ty.max_locations() - 1
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for HardDriveSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.slot(), self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_drive_defaults_from_json() {
        let drive: HardDriveSpec = serde_json::from_str(r#"{"path":"C:\\vm\\os.vhdx"}"#).unwrap();
        assert_eq!(drive.slot(), DiskSlot::scsi(0, 0));
        assert_eq!(drive.path, "C:\\vm\\os.vhdx");
    }

    #[test]
    fn test_hard_drive_camel_case_fields() {
        let drive: HardDriveSpec = serde_json::from_str(
            r#"{"path":"/d.vhdx","controllerType":"IDE","controllerNumber":1,"controllerLocation":1}"#,
        )
        .unwrap();
        assert_eq!(drive.slot(), DiskSlot::ide(1, 1));

        let json = serde_json::to_value(HardDriveSpec::new("/d.vhdx")).unwrap();
        assert_eq!(json["controllerType"], "SCSI");
        assert_eq!(json["controllerLocation"], 0);
    }

    #[test]
    fn test_slot_ordering_and_display() {
        assert!(DiskSlot::ide(1, 1) < DiskSlot::scsi(0, 0));
        assert!(DiskSlot::scsi(0, 1) < DiskSlot::scsi(1, 0));
        assert_eq!(DiskSlot::scsi(0, 3).to_string(), "SCSI 0:3");
    }

    #[test]
    fn test_validate_rejects_ide_on_gen2() {
        let drive = HardDriveSpec::new("/d.vhdx").at(DiskSlot::ide(0, 0));
        assert!(drive.validate(Generation::Gen1).is_ok());
        assert!(matches!(
            drive.validate(Generation::Gen2),
            Err(Error::Validation { field: "hardDrives.controllerType", .. })
        ));
    }

    #[test]
    fn test_validate_slot_ranges() {
        assert!(HardDriveSpec::new("/d.vhdx")
            .at(DiskSlot::scsi(3, 63))
            .validate(Generation::Gen2)
            .is_ok());
        assert!(HardDriveSpec::new("/d.vhdx")
            .at(DiskSlot::scsi(4, 0))
            .validate(Generation::Gen2)
            .is_err());
        assert!(HardDriveSpec::new("/d.vhdx")
            .at(DiskSlot::scsi(0, 64))
            .validate(Generation::Gen2)
            .is_err());
        assert!(HardDriveSpec::new("/d.vhdx")
            .at(DiskSlot::ide(0, 2))
            .validate(Generation::Gen1)
            .is_err());
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        assert!(HardDriveSpec::new("  ").validate(Generation::Gen2).is_err());
    }
}
