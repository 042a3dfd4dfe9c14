//! Host Connector contract.
//!
//! A [`HostConnector`] opens [`HostSession`]s against one hypervisor
//! management endpoint. Every lifecycle operation acquires its own session
//! and drops it on return, so no connection state is shared between
//! operations on different VMs.
//!
//! Two implementations ship with the crate:
//! - [`MemoryHost`]: a simulated host for tests and dry runs.
//! - `wmi::WmiConnector` (Windows only): the Hyper-V WMI provider in
//!   `root\virtualization\v2`.

mod memory;
#[cfg(windows)]
pub mod wmi;

pub use memory::{
    GracefulShutdown, HostEvent, HostOperation, MemoryHost, MemorySession, PowerBehavior,
};

use core::fmt;

use crate::error::Result;
use crate::network::NetworkAdapterSpec;
use crate::storage::{DiskSlot, HardDriveSpec};
use crate::vm::{
    AutomaticActions, Generation, MemoryConfiguration, ProcessorCount, ShutdownType,
    VirtualMachineSpec, VmState,
};

/// Reference to a VM on the host: logical name plus host-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmHandle {
    pub name: String,
    pub vm_id: String,
}

impl VmHandle {
    pub fn new(name: impl Into<String>, vm_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vm_id: vm_id.into(),
        }
    }
}

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.vm_id)
    }
}

/// Core settings of a VM as the host reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfiguration {
    pub generation: Generation,
    pub memory: MemoryConfiguration,
    pub processors: ProcessorCount,
    pub automatic_actions: AutomaticActions,
}

/// Which settings the host can change while the VM runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostCapabilities {
    /// Startup memory and dynamic bounds can change on a running VM.
    pub live_memory_resize: bool,
    /// Virtual processor count can change on a running VM.
    pub live_processor_change: bool,
}

/// Opens sessions against a hypervisor management endpoint.
pub trait HostConnector {
    type Session: HostSession;

    /// Open a session.
    ///
    /// Fails with [`Error::Connection`](crate::Error::Connection) or
    /// [`Error::AuthenticationFailed`](crate::Error::AuthenticationFailed)
    /// when the endpoint cannot be reached; those are never reported as
    /// host API failures.
    fn connect(&self) -> Result<Self::Session>;
}

/// An open connection to the host.
///
/// Operations are synchronous remote calls without retry. The connection
/// is released when the session is dropped.
pub trait HostSession {
    /// Name of the host this session talks to.
    fn host_name(&self) -> &str;

    // ========== VM Operations ==========

    /// Find a VM by name. Fails with `VmNotFound` when absent.
    fn get_vm(&mut self, name: &str) -> Result<VmHandle>;

    /// Define a VM with the requested generation, memory, processors and
    /// automatic actions. Disks and adapters are not attached.
    ///
    /// If the VM object is defined but a later configuration step fails,
    /// the error is `PartialCreate` carrying the new vmId.
    fn create_vm(&mut self, spec: &VirtualMachineSpec) -> Result<VmHandle>;

    fn power_state(&mut self, vm: &VmHandle) -> Result<VmState>;

    /// Request the running state. Returns once the host accepted the request.
    fn start_vm(&mut self, vm: &VmHandle) -> Result<()>;

    /// Request a stop. Returns once the host accepted the request.
    fn stop_vm(&mut self, vm: &VmHandle, how: ShutdownType) -> Result<()>;

    /// Destroy the VM object. Disk image files are left in place.
    fn delete_vm(&mut self, vm: &VmHandle) -> Result<()>;

    // ========== Configuration Operations ==========

    fn vm_configuration(&mut self, vm: &VmHandle) -> Result<VmConfiguration>;

    fn modify_memory(&mut self, vm: &VmHandle, memory: &MemoryConfiguration) -> Result<()>;

    fn modify_processors(&mut self, vm: &VmHandle, count: ProcessorCount) -> Result<()>;

    fn modify_automatic_actions(&mut self, vm: &VmHandle, actions: AutomaticActions)
        -> Result<()>;

    fn capabilities(&mut self) -> Result<HostCapabilities>;

    // ========== Storage Operations ==========

    /// Disks currently attached, ordered by slot.
    fn list_hard_drives(&mut self, vm: &VmHandle) -> Result<Vec<HardDriveSpec>>;

    /// Attach a disk image to an empty slot.
    fn attach_hard_drive(&mut self, vm: &VmHandle, drive: &HardDriveSpec) -> Result<()>;

    /// Remove whatever is attached at `slot`.
    fn detach_hard_drive(&mut self, vm: &VmHandle, slot: DiskSlot) -> Result<()>;

    fn disk_image_exists(&mut self, path: &str) -> Result<bool>;

    // ========== Network Operations ==========

    fn list_network_adapters(&mut self, vm: &VmHandle) -> Result<Vec<NetworkAdapterSpec>>;

    fn add_network_adapter(&mut self, vm: &VmHandle, adapter: &NetworkAdapterSpec) -> Result<()>;

    /// Remove the first attached adapter equal to `adapter`.
    fn remove_network_adapter(&mut self, vm: &VmHandle, adapter: &NetworkAdapterSpec)
        -> Result<()>;

    fn switch_exists(&mut self, switch_name: &str) -> Result<bool>;
}
