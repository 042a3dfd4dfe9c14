use tracing::{debug, info, warn};

use crate::error::{AttachmentError, AttachmentFailure, AttachmentKind, Error, Result};
use crate::host::{HostSession, VmHandle};
use crate::storage::HardDriveSpec;

/// Attaches and detaches disk images, idempotent per controller slot.
pub struct DiskAttachmentManager<'s, S: HostSession + ?Sized> {
    session: &'s mut S,
}

impl<'s, S: HostSession + ?Sized> DiskAttachmentManager<'s, S> {
    pub fn new(session: &'s mut S) -> Self {
        Self { session }
    }

    /// Disks attached right now, ordered by slot.
    pub fn list_attached(&mut self, vm: &VmHandle) -> Result<Vec<HardDriveSpec>> {
        let mut drives = self.session.list_hard_drives(vm)?;
        drives.sort_by_key(|d| d.slot());
        Ok(drives)
    }

    /// Attach `drive` at its slot.
    ///
    /// The same image already at the slot is a no-op. A different image at
    /// the slot, or an image path the host cannot see, fails with an
    /// [`AttachmentError`].
    pub fn attach(&mut self, vm: &VmHandle, drive: &HardDriveSpec) -> Result<()> {
        let slot = drive.slot();
        if let Some(existing) = self.occupant(vm, drive)? {
            if existing.path == drive.path {
                debug!(vm_name = %vm.name, %slot, "Disk already attached");
                return Ok(());
            }
            return Err(self.refuse(
                vm,
                drive,
                AttachmentFailure::SlotOccupied {
                    existing_path: existing.path,
                },
            ));
        }

        if !self.session.disk_image_exists(&drive.path)? {
            return Err(self.refuse(vm, drive, AttachmentFailure::ImageNotFound));
        }

        self.session.attach_hard_drive(vm, drive).map_err(|e| {
            AttachmentError::from_host(&vm.name, AttachmentKind::HardDrive, drive.to_string(), e)
        })?;
        info!(vm_name = %vm.name, %slot, path = %drive.path, "Disk attached");
        Ok(())
    }

    /// Detach `drive` if that image is at its slot; otherwise do nothing.
    pub fn detach(&mut self, vm: &VmHandle, drive: &HardDriveSpec) -> Result<()> {
        let slot = drive.slot();
        match self.occupant(vm, drive)? {
            None => {
                debug!(vm_name = %vm.name, %slot, "Disk already detached");
                Ok(())
            }
            Some(existing) if existing.path != drive.path => {
                warn!(
                    vm_name = %vm.name,
                    %slot,
                    expected = %drive.path,
                    found = %existing.path,
                    "Slot holds a different disk, leaving it attached"
                );
                Ok(())
            }
            Some(_) => {
                self.session.detach_hard_drive(vm, slot).map_err(|e| {
                    AttachmentError::from_host(&vm.name, AttachmentKind::HardDrive, drive.to_string(), e)
                })?;
                info!(vm_name = %vm.name, %slot, path = %drive.path, "Disk detached");
                Ok(())
            }
        }
    }

    fn occupant(&mut self, vm: &VmHandle, drive: &HardDriveSpec) -> Result<Option<HardDriveSpec>> {
        let slot = drive.slot();
        Ok(self
            .session
            .list_hard_drives(vm)?
            .into_iter()
            .find(|d| d.slot() == slot))
    }

    fn refuse(&self, vm: &VmHandle, drive: &HardDriveSpec, failure: AttachmentFailure) -> Error {
        Error::Attachment(AttachmentError {
            vm_name: vm.name.clone(),
            kind: AttachmentKind::HardDrive,
            target: drive.to_string(),
            failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostConnector, HostOperation, MemoryHost};
    use crate::storage::DiskSlot;
    use crate::vm::{Generation, VirtualMachineSpec};

    fn setup() -> (MemoryHost, VmHandle) {
        let host = MemoryHost::default();
        host.add_disk_image("/a.vhdx").add_disk_image("/b.vhdx");
        let mut session = host.connect().unwrap();
        let vm = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();
        (host, vm)
    }

    #[test]
    fn test_attach_same_disk_twice_is_noop() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut disks = DiskAttachmentManager::new(&mut session);
        let drive = HardDriveSpec::new("/a.vhdx");

        disks.attach(&vm, &drive).unwrap();
        host.clear_events();
        disks.attach(&vm, &drive).unwrap();
        assert!(host.events().is_empty());
        assert_eq!(disks.list_attached(&vm).unwrap(), vec![drive]);
    }

    #[test]
    fn test_attach_to_occupied_slot_fails() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut disks = DiskAttachmentManager::new(&mut session);
        disks.attach(&vm, &HardDriveSpec::new("/a.vhdx")).unwrap();

        let err = disks.attach(&vm, &HardDriveSpec::new("/b.vhdx")).unwrap_err();
        match err {
            Error::Attachment(AttachmentError {
                failure: AttachmentFailure::SlotOccupied { existing_path },
                ..
            }) => assert_eq!(existing_path, "/a.vhdx"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_attach_missing_image_fails() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut disks = DiskAttachmentManager::new(&mut session);
        let err = disks
            .attach(&vm, &HardDriveSpec::new("/missing.vhdx"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Attachment(AttachmentError {
                failure: AttachmentFailure::ImageNotFound,
                ..
            })
        ));
        assert!(disks.list_attached(&vm).unwrap().is_empty());
    }

    #[test]
    fn test_detach_never_attached_slot_is_noop() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut disks = DiskAttachmentManager::new(&mut session);
        disks
            .detach(&vm, &HardDriveSpec::new("/a.vhdx").at(DiskSlot::scsi(1, 5)))
            .unwrap();
        assert!(host.events().iter().all(|e| !matches!(
            e,
            crate::host::HostEvent::DiskDetached { .. }
        )));
    }

    #[test]
    fn test_detach_leaves_foreign_disk() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut disks = DiskAttachmentManager::new(&mut session);
        disks.attach(&vm, &HardDriveSpec::new("/b.vhdx")).unwrap();
        disks.detach(&vm, &HardDriveSpec::new("/a.vhdx")).unwrap();
        assert_eq!(disks.list_attached(&vm).unwrap().len(), 1);

        disks.detach(&vm, &HardDriveSpec::new("/b.vhdx")).unwrap();
        assert!(disks.list_attached(&vm).unwrap().is_empty());
    }

    #[test]
    fn test_host_failure_is_tagged_with_target() {
        let (host, vm) = setup();
        host.fail_next(HostOperation::AttachHardDrive, 1);
        let mut session = host.connect().unwrap();
        let mut disks = DiskAttachmentManager::new(&mut session);
        let err = disks.attach(&vm, &HardDriveSpec::new("/a.vhdx")).unwrap_err();
        assert!(err.to_string().contains("SCSI 0:0"));
        assert!(err.is_transient());
    }

    #[test]
    fn test_list_is_ordered_by_slot() {
        let host = MemoryHost::default();
        host.add_disk_image("/a.vhdx").add_disk_image("/b.vhdx");
        let mut session = host.connect().unwrap();
        let vm = session
            .create_vm(
                &VirtualMachineSpec::builder("vm1")
                    .generation(Generation::Gen1)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let mut disks = DiskAttachmentManager::new(&mut session);
        disks
            .attach(&vm, &HardDriveSpec::new("/a.vhdx").at(DiskSlot::scsi(0, 1)))
            .unwrap();
        disks
            .attach(&vm, &HardDriveSpec::new("/b.vhdx").at(DiskSlot::ide(0, 0)))
            .unwrap();
        let slots: Vec<_> = disks
            .list_attached(&vm)
            .unwrap()
            .iter()
            .map(|d| d.slot())
            .collect();
        assert_eq!(slots, vec![DiskSlot::ide(0, 0), DiskSlot::scsi(0, 1)]);
    }
}
