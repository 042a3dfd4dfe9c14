//! # hyperv-machine
//!
//! Declarative lifecycle management for Hyper-V virtual machines.
//!
//! A [`VmController`] converges a host towards a [`VirtualMachineSpec`]:
//! it creates VMs, reads back their observed state, updates them in place
//! (or replaces them when an immutable field changes) and deletes them
//! with a graceful stop that escalates to a forced power off.
//!
//! The hypervisor is reached through the [`HostConnector`] contract. On
//! Windows, `host::wmi::WmiConnector` talks to the Hyper-V WMI provider;
//! [`MemoryHost`] simulates a host everywhere else and in tests.
//!
//! ## Example
//!
//! ```no_run
//! use hyperv_machine::{
//!     HardDriveSpec, MemoryHost, NetworkAdapterSpec, VirtualMachineSpec, VmController,
//! };
//!
//! fn main() -> hyperv_machine::Result<()> {
//!     let host = MemoryHost::default();
//!     host.add_switch("external");
//!     host.add_disk_image(r"C:\vms\web01.vhdx");
//!
//!     let controller = VmController::new(host);
//!     let spec = VirtualMachineSpec::builder("web01")
//!         .memory_mb(4096)
//!         .processor_count(2)
//!         .hard_drive(HardDriveSpec::new(r"C:\vms\web01.vhdx"))
//!         .network_adapter(NetworkAdapterSpec::new("external"))
//!         .build()?;
//!
//!     let state = controller.create(&spec)?;
//!     println!("created {} as {}", state.name(), state.vm_id);
//!
//!     controller.delete(&state.spec.machine_name, Some(&state.vm_id))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod network;
pub mod storage;
pub mod vm;

pub use config::{Config, ConfigError};
pub use error::{
    AttachmentError, AttachmentFailure, AttachmentKind, CreateStage, DeleteStage, Error,
    FailureType, JobState, Result,
};
pub use host::{
    HostCapabilities, HostConnector, HostSession, MemoryHost, VmConfiguration, VmHandle,
};
pub use lifecycle::{
    ControllerOptions, LifecycleState, PowerWaitConfig, RunningUpdatePolicy, VmController,
};
pub use network::{NetworkAdapterSpec, NetworkAttachmentManager};
pub use storage::{ControllerType, DiskAttachmentManager, DiskSlot, HardDriveSpec};
pub use vm::{
    AutomaticStartAction, AutomaticStopAction, Generation, MemoryMB, ProcessorCount,
    ShutdownType, VirtualMachineSpec, VirtualMachineState, VmState,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `filter`.
///
/// Only the first call in a process installs anything.
pub fn init_tracing(filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
