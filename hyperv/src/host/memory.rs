//! In-memory host.
//!
//! Simulates a Hyper-V host closely enough to drive the lifecycle
//! controller end to end: host-assigned ids, memory granularity, power
//! transitions that take several polls, registered switches and disk
//! images, and per-operation fault injection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{CreateStage, Error, FailureType, Result};
use crate::host::{HostCapabilities, HostConnector, HostSession, VmConfiguration, VmHandle};
use crate::network::NetworkAdapterSpec;
use crate::storage::{DiskSlot, HardDriveSpec};
use crate::vm::{
    AutomaticActions, Generation, MemoryConfiguration, ProcessorCount, ShutdownType,
    VirtualMachineSpec, VmState,
};

/// Host operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOperation {
    Connect,
    GetVm,
    /// Before the VM object is defined.
    CreateVm,
    /// After the VM object is defined, while applying its settings.
    ConfigureVm,
    PowerState,
    StartVm,
    StopVm,
    DeleteVm,
    VmConfiguration,
    ModifyMemory,
    ModifyProcessors,
    ModifyAutomaticActions,
    AttachHardDrive,
    DetachHardDrive,
    AddNetworkAdapter,
    RemoveNetworkAdapter,
}

impl HostOperation {
    fn name(&self) -> &'static str {
        match self {
            HostOperation::Connect => "Connect",
            HostOperation::GetVm => "GetVm",
            HostOperation::CreateVm => "DefineSystem",
            HostOperation::ConfigureVm => "ModifySystemSettings",
            HostOperation::PowerState => "GetEnabledState",
            HostOperation::StartVm => "RequestStateChange",
            HostOperation::StopVm => "InitiateShutdown",
            HostOperation::DeleteVm => "DestroySystem",
            HostOperation::VmConfiguration => "GetSummaryInformation",
            HostOperation::ModifyMemory => "ModifyResourceSettings",
            HostOperation::ModifyProcessors => "ModifyResourceSettings",
            HostOperation::ModifyAutomaticActions => "ModifySystemSettings",
            HostOperation::AttachHardDrive => "AddResourceSettings",
            HostOperation::DetachHardDrive => "RemoveResourceSettings",
            HostOperation::AddNetworkAdapter => "AddResourceSettings",
            HostOperation::RemoveNetworkAdapter => "RemoveResourceSettings",
        }
    }
}

/// How the guest reacts to a graceful shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GracefulShutdown {
    /// The guest shuts down.
    #[default]
    Honored,
    /// The request is accepted but the guest keeps running.
    Ignored,
    /// No shutdown integration service; the request is rejected.
    Unavailable,
}

/// Simulated power behavior of every VM on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerBehavior {
    pub graceful_shutdown: GracefulShutdown,
    /// Forced power off is accepted but never takes effect.
    pub ignore_force_stop: bool,
    /// Number of `power_state` polls a start or stop takes to settle.
    pub transition_polls: u32,
}

/// Mutation recorded by the in-memory host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Created { name: String, vm_id: String },
    Started { name: String },
    StopRequested { name: String, how: ShutdownType },
    Deleted { name: String, vm_id: String },
    MemoryModified { name: String },
    ProcessorsModified { name: String },
    AutomaticActionsModified { name: String },
    DiskAttached { name: String, slot: DiskSlot },
    DiskDetached { name: String, slot: DiskSlot },
    AdapterAdded { name: String, adapter: String },
    AdapterRemoved { name: String, adapter: String },
}

#[derive(Debug, Clone)]
struct Transition {
    target: VmState,
    polls_left: u32,
}

#[derive(Debug, Clone)]
struct MemoryVm {
    vm_id: String,
    generation: Generation,
    memory: MemoryConfiguration,
    processors: ProcessorCount,
    actions: AutomaticActions,
    state: VmState,
    transition: Option<Transition>,
    drives: BTreeMap<DiskSlot, String>,
    adapters: Vec<NetworkAdapterSpec>,
}

impl MemoryVm {
    fn configuration(&self) -> VmConfiguration {
        VmConfiguration {
            generation: self.generation,
            memory: self.memory,
            processors: self.processors,
            automatic_actions: self.actions,
        }
    }

    fn begin(&mut self, through: VmState, target: VmState, polls: u32) {
        if polls == 0 {
            self.state = target;
            self.transition = None;
        } else {
            self.state = through;
            self.transition = Some(Transition {
                target,
                polls_left: polls,
            });
        }
    }

    fn advance(&mut self) {
        if let Some(t) = self.transition.as_mut() {
            t.polls_left = t.polls_left.saturating_sub(1);
            if t.polls_left == 0 {
                self.state = t.target;
                self.transition = None;
            }
        }
    }
}

/// Pending injected failures for one operation.
#[derive(Debug, Clone, Copy, Default)]
struct Fault {
    /// Calls that still succeed before failures start.
    skip: u32,
    times: u32,
}

impl Fault {
    fn trip(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        if self.times > 0 {
            self.times -= 1;
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct HostState {
    vms: BTreeMap<String, MemoryVm>,
    switches: BTreeSet<String>,
    images: BTreeSet<String>,
    faults: HashMap<HostOperation, Fault>,
    behavior: PowerBehavior,
    capabilities: HostCapabilities,
    open_sessions: usize,
    events: Vec<HostEvent>,
}

impl HostState {
    fn check_fault(&mut self, op: HostOperation, vm_name: &str) -> Result<()> {
        let tripped = self.faults.get_mut(&op).map(|fault| fault.trip());
        match tripped {
            Some(true) => {
                debug!(operation = ?op, vm_name, "Injected host failure");
                Err(Error::host_api_with_type(
                    op.name(),
                    vm_name,
                    32768,
                    "injected failure",
                    FailureType::Transient,
                ))
            }
            _ => Ok(()),
        }
    }

    fn vm_mut(&mut self, vm: &VmHandle) -> Result<&mut MemoryVm> {
        match self.vms.get_mut(&vm.name) {
            Some(found) if found.vm_id == vm.vm_id => Ok(found),
            _ => Err(Error::VmNotFound(vm.to_string())),
        }
    }
}

/// Simulated Hyper-V host shared by every session it opens.
///
/// Cloning yields another handle to the same host.
#[derive(Debug, Clone)]
pub struct MemoryHost {
    name: String,
    state: Arc<Mutex<HostState>>,
}

impl MemoryHost {
    pub fn new(name: impl Into<String>) -> Self {
        info!("Creating in-memory host");
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    // Test assertions may panic while holding the lock; later calls still
    // need to see the host.
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a virtual switch.
    pub fn add_switch(&self, name: impl Into<String>) -> &Self {
        self.lock().switches.insert(name.into());
        self
    }

    /// Register a disk image file.
    pub fn add_disk_image(&self, path: impl Into<String>) -> &Self {
        self.lock().images.insert(path.into());
        self
    }

    pub fn set_power_behavior(&self, behavior: PowerBehavior) -> &Self {
        self.lock().behavior = behavior;
        self
    }

    pub fn set_capabilities(&self, capabilities: HostCapabilities) -> &Self {
        self.lock().capabilities = capabilities;
        self
    }

    /// Make the next `times` calls of `op` fail with a transient host error.
    pub fn fail_next(&self, op: HostOperation, times: u32) -> &Self {
        self.fail_after(op, 0, times)
    }

    /// Let `skip` calls of `op` through, then fail the following `times`.
    pub fn fail_after(&self, op: HostOperation, skip: u32, times: u32) -> &Self {
        self.lock().faults.insert(op, Fault { skip, times });
        self
    }

    /// Change a VM's power state outside the controller.
    pub fn set_power_state(&self, name: &str, state: VmState) -> bool {
        match self.lock().vms.get_mut(name) {
            Some(vm) => {
                vm.state = state;
                vm.transition = None;
                true
            }
            None => false,
        }
    }

    /// Detach a disk outside the controller.
    pub fn remove_disk_out_of_band(&self, name: &str, slot: DiskSlot) -> bool {
        self.lock()
            .vms
            .get_mut(name)
            .and_then(|vm| vm.drives.remove(&slot))
            .is_some()
    }

    pub fn vm_id(&self, name: &str) -> Option<String> {
        self.lock().vms.get(name).map(|vm| vm.vm_id.clone())
    }

    pub fn vm_power_state(&self, name: &str) -> Option<VmState> {
        self.lock().vms.get(name).map(|vm| vm.state)
    }

    pub fn vm_count(&self) -> usize {
        self.lock().vms.len()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl HostConnector for MemoryHost {
    type Session = MemorySession;

    fn connect(&self) -> Result<MemorySession> {
        let mut state = self.lock();
        if let Some(fault) = state.faults.get_mut(&HostOperation::Connect) {
            if fault.trip() {
                return Err(Error::Connection {
                    machine: self.name.clone(),
                    message: "host management endpoint unreachable".to_string(),
                    failure_type: FailureType::Network,
                });
            }
        }
        state.open_sessions += 1;
        debug!(host = %self.name, open_sessions = state.open_sessions, "Session opened");
        Ok(MemorySession { host: self.clone() })
    }
}

/// Session against a [`MemoryHost`].
#[derive(Debug)]
pub struct MemorySession {
    host: MemoryHost,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let mut state = self.host.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
    }
}

impl HostSession for MemorySession {
    fn host_name(&self) -> &str {
        &self.host.name
    }

    fn get_vm(&mut self, name: &str) -> Result<VmHandle> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::GetVm, name)?;
        state
            .vms
            .get(name)
            .map(|vm| VmHandle::new(name, vm.vm_id.clone()))
            .ok_or_else(|| Error::VmNotFound(name.to_string()))
    }

    #[instrument(skip(self, spec), fields(vm_name = %spec.machine_name))]
    fn create_vm(&mut self, spec: &VirtualMachineSpec) -> Result<VmHandle> {
        let generation = spec.vm_generation()?;
        let memory = spec.memory_configuration()?.aligned();
        let processors = spec.processors()?;

        let mut state = self.host.lock();
        state.check_fault(HostOperation::CreateVm, &spec.machine_name)?;
        if let Some(existing) = state.vms.get(&spec.machine_name) {
            return Err(Error::VmAlreadyExists {
                name: spec.machine_name.clone(),
                vm_id: existing.vm_id.clone(),
            });
        }

        let vm_id = Uuid::new_v4().to_string().to_uppercase();
        state.vms.insert(
            spec.machine_name.clone(),
            MemoryVm {
                vm_id: vm_id.clone(),
                generation,
                memory: MemoryConfiguration::fixed(memory.startup),
                processors: ProcessorCount::default(),
                actions: AutomaticActions::default(),
                state: VmState::Off,
                transition: None,
                drives: BTreeMap::new(),
                adapters: Vec::new(),
            },
        );
        state.events.push(HostEvent::Created {
            name: spec.machine_name.clone(),
            vm_id: vm_id.clone(),
        });

        // Settings are applied after the system is defined, as on a real host.
        if let Err(e) = state.check_fault(HostOperation::ConfigureVm, &spec.machine_name) {
            return Err(Error::partial_create(
                spec.machine_name.clone(),
                vm_id,
                CreateStage::Configure,
                e,
            ));
        }
        if let Some(vm) = state.vms.get_mut(&spec.machine_name) {
            vm.memory = memory;
            vm.processors = processors;
            vm.actions = spec.automatic_actions();
        }

        info!(vm_id = %vm_id, "VM defined");
        Ok(VmHandle::new(spec.machine_name.clone(), vm_id))
    }

    fn power_state(&mut self, vm: &VmHandle) -> Result<VmState> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::PowerState, &vm.name)?;
        let found = state.vm_mut(vm)?;
        found.advance();
        Ok(found.state)
    }

    fn start_vm(&mut self, vm: &VmHandle) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::StartVm, &vm.name)?;
        let polls = state.behavior.transition_polls;
        let found = state.vm_mut(vm)?;
        if found.state == VmState::Running {
            return Ok(());
        }
        if !found.state.can_start() {
            return Err(Error::InvalidState {
                vm_name: vm.name.clone(),
                current: found.state,
                operation: "start",
            });
        }
        found.begin(VmState::Starting, VmState::Running, polls);
        state.events.push(HostEvent::Started {
            name: vm.name.clone(),
        });
        Ok(())
    }

    fn stop_vm(&mut self, vm: &VmHandle, how: ShutdownType) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::StopVm, &vm.name)?;
        let behavior = state.behavior;
        let found = state.vm_mut(vm)?;
        if found.state.is_off() {
            return Ok(());
        }

        match how {
            ShutdownType::Graceful => match behavior.graceful_shutdown {
                GracefulShutdown::Unavailable => {
                    return Err(Error::host_api_with_type(
                        "InitiateShutdown",
                        vm.name.clone(),
                        32775,
                        "shutdown integration service is not available",
                        FailureType::Permanent,
                    ));
                }
                GracefulShutdown::Ignored => {}
                GracefulShutdown::Honored => {
                    found.begin(VmState::ShuttingDown, VmState::Off, behavior.transition_polls)
                }
            },
            ShutdownType::Force => {
                if !behavior.ignore_force_stop {
                    found.begin(VmState::Stopping, VmState::Off, behavior.transition_polls);
                }
            }
        }

        state.events.push(HostEvent::StopRequested {
            name: vm.name.clone(),
            how,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(vm_name = %vm.name, vm_id = %vm.vm_id))]
    fn delete_vm(&mut self, vm: &VmHandle) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::DeleteVm, &vm.name)?;
        let current = state.vm_mut(vm)?.state;
        if !current.is_off() {
            return Err(Error::InvalidState {
                vm_name: vm.name.clone(),
                current,
                operation: "delete",
            });
        }
        state.vms.remove(&vm.name);
        state.events.push(HostEvent::Deleted {
            name: vm.name.clone(),
            vm_id: vm.vm_id.clone(),
        });
        info!("VM destroyed");
        Ok(())
    }

    fn vm_configuration(&mut self, vm: &VmHandle) -> Result<VmConfiguration> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::VmConfiguration, &vm.name)?;
        Ok(state.vm_mut(vm)?.configuration())
    }

    fn modify_memory(&mut self, vm: &VmHandle, memory: &MemoryConfiguration) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::ModifyMemory, &vm.name)?;
        let live = state.capabilities.live_memory_resize;
        let found = state.vm_mut(vm)?;
        if !found.state.is_off() && !live {
            return Err(Error::InvalidState {
                vm_name: vm.name.clone(),
                current: found.state,
                operation: "modify memory of",
            });
        }
        found.memory = memory.aligned();
        state.events.push(HostEvent::MemoryModified {
            name: vm.name.clone(),
        });
        Ok(())
    }

    fn modify_processors(&mut self, vm: &VmHandle, count: ProcessorCount) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::ModifyProcessors, &vm.name)?;
        let live = state.capabilities.live_processor_change;
        let found = state.vm_mut(vm)?;
        if !found.state.is_off() && !live {
            return Err(Error::InvalidState {
                vm_name: vm.name.clone(),
                current: found.state,
                operation: "change processors of",
            });
        }
        found.processors = count;
        state.events.push(HostEvent::ProcessorsModified {
            name: vm.name.clone(),
        });
        Ok(())
    }

    fn modify_automatic_actions(
        &mut self,
        vm: &VmHandle,
        actions: AutomaticActions,
    ) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::ModifyAutomaticActions, &vm.name)?;
        state.vm_mut(vm)?.actions = actions;
        state.events.push(HostEvent::AutomaticActionsModified {
            name: vm.name.clone(),
        });
        Ok(())
    }

    fn capabilities(&mut self) -> Result<HostCapabilities> {
        Ok(self.host.lock().capabilities)
    }

    fn list_hard_drives(&mut self, vm: &VmHandle) -> Result<Vec<HardDriveSpec>> {
        let mut state = self.host.lock();
        let found = state.vm_mut(vm)?;
        Ok(found
            .drives
            .iter()
            .map(|(slot, path)| HardDriveSpec::new(path.clone()).at(*slot))
            .collect())
    }

    fn attach_hard_drive(&mut self, vm: &VmHandle, drive: &HardDriveSpec) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::AttachHardDrive, &vm.name)?;
        if !state.images.contains(&drive.path) {
            return Err(Error::DiskImageNotFound(drive.path.clone()));
        }
        let found = state.vm_mut(vm)?;
        drive.validate(found.generation)?;
        let slot = drive.slot();
        if found.drives.contains_key(&slot) {
            return Err(Error::host_api_with_type(
                "AddResourceSettings",
                vm.name.clone(),
                32774,
                format!("slot {} is in use", slot),
                FailureType::Configuration,
            ));
        }
        found.drives.insert(slot, drive.path.clone());
        state.events.push(HostEvent::DiskAttached {
            name: vm.name.clone(),
            slot,
        });
        Ok(())
    }

    fn detach_hard_drive(&mut self, vm: &VmHandle, slot: DiskSlot) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::DetachHardDrive, &vm.name)?;
        if state.vm_mut(vm)?.drives.remove(&slot).is_none() {
            return Err(Error::host_api_with_type(
                "RemoveResourceSettings",
                vm.name.clone(),
                32773,
                format!("no disk attached at {}", slot),
                FailureType::Permanent,
            ));
        }
        state.events.push(HostEvent::DiskDetached {
            name: vm.name.clone(),
            slot,
        });
        Ok(())
    }

    fn disk_image_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.host.lock().images.contains(path))
    }

    fn list_network_adapters(&mut self, vm: &VmHandle) -> Result<Vec<NetworkAdapterSpec>> {
        let mut state = self.host.lock();
        Ok(state.vm_mut(vm)?.adapters.clone())
    }

    fn add_network_adapter(&mut self, vm: &VmHandle, adapter: &NetworkAdapterSpec) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::AddNetworkAdapter, &vm.name)?;
        if !state.switches.contains(&adapter.switch_name) {
            return Err(Error::SwitchNotFound(adapter.switch_name.clone()));
        }
        let mut stored = adapter.clone();
        stored.mac_address = adapter.static_mac();
        state.vm_mut(vm)?.adapters.push(stored);
        state.events.push(HostEvent::AdapterAdded {
            name: vm.name.clone(),
            adapter: adapter.to_string(),
        });
        Ok(())
    }

    fn remove_network_adapter(
        &mut self,
        vm: &VmHandle,
        adapter: &NetworkAdapterSpec,
    ) -> Result<()> {
        let mut state = self.host.lock();
        state.check_fault(HostOperation::RemoveNetworkAdapter, &vm.name)?;
        let found = state.vm_mut(vm)?;
        match found.adapters.iter().position(|a| a == adapter) {
            Some(idx) => {
                found.adapters.remove(idx);
            }
            None => {
                return Err(Error::host_api_with_type(
                    "RemoveResourceSettings",
                    vm.name.clone(),
                    32773,
                    format!("adapter {} is not attached", adapter),
                    FailureType::Permanent,
                ))
            }
        }
        state.events.push(HostEvent::AdapterRemoved {
            name: vm.name.clone(),
            adapter: adapter.to_string(),
        });
        Ok(())
    }

    fn switch_exists(&mut self, switch_name: &str) -> Result<bool> {
        Ok(self.host.lock().switches.contains(switch_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MemoryMB;

    fn host() -> MemoryHost {
        let host = MemoryHost::default();
        host.add_switch("external").add_disk_image("/d.vhdx");
        host
    }

    #[test]
    fn test_sessions_are_counted_and_released() {
        let host = host();
        {
            let _a = host.connect().unwrap();
            let _b = host.connect().unwrap();
            assert_eq!(host.open_sessions(), 2);
        }
        assert_eq!(host.open_sessions(), 0);
    }

    #[test]
    fn test_connect_fault_is_a_connection_error() {
        let host = host();
        host.fail_next(HostOperation::Connect, 1);
        let err = host.connect().unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(err.is_retryable());
        assert!(host.connect().is_ok());
    }

    #[test]
    fn test_create_assigns_id_and_rounds_memory() {
        let host = host();
        let mut session = host.connect().unwrap();
        let spec = VirtualMachineSpec::builder("vm1").memory_mb(1001).build().unwrap();
        let handle = session.create_vm(&spec).unwrap();
        assert!(!handle.vm_id.is_empty());

        let config = session.vm_configuration(&handle).unwrap();
        assert_eq!(config.memory.startup, MemoryMB::new(1002).unwrap());
        assert_eq!(config.generation, Generation::Gen2);
        assert_eq!(session.power_state(&handle).unwrap(), VmState::Off);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let host = host();
        let mut session = host.connect().unwrap();
        let spec = VirtualMachineSpec::new("vm1");
        session.create_vm(&spec).unwrap();
        assert!(matches!(
            session.create_vm(&spec),
            Err(Error::VmAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_configure_fault_leaves_vm_defined() {
        let host = host();
        host.fail_next(HostOperation::ConfigureVm, 1);
        let mut session = host.connect().unwrap();
        let err = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap_err();
        assert_eq!(err.partial_vm_id(), host.vm_id("vm1").as_deref());
    }

    #[test]
    fn test_power_transitions_take_polls() {
        let host = host();
        host.set_power_behavior(PowerBehavior {
            transition_polls: 2,
            ..Default::default()
        });
        let mut session = host.connect().unwrap();
        let handle = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();

        session.start_vm(&handle).unwrap();
        assert_eq!(host.vm_power_state("vm1"), Some(VmState::Starting));
        assert_eq!(session.power_state(&handle).unwrap(), VmState::Starting);
        assert_eq!(session.power_state(&handle).unwrap(), VmState::Running);
    }

    #[test]
    fn test_graceful_shutdown_behaviors() {
        let host = host();
        let mut session = host.connect().unwrap();
        let handle = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();
        session.start_vm(&handle).unwrap();

        host.set_power_behavior(PowerBehavior {
            graceful_shutdown: GracefulShutdown::Unavailable,
            ..Default::default()
        });
        assert!(session.stop_vm(&handle, ShutdownType::Graceful).is_err());

        host.set_power_behavior(PowerBehavior {
            graceful_shutdown: GracefulShutdown::Ignored,
            ..Default::default()
        });
        session.stop_vm(&handle, ShutdownType::Graceful).unwrap();
        assert_eq!(session.power_state(&handle).unwrap(), VmState::Running);

        session.stop_vm(&handle, ShutdownType::Force).unwrap();
        assert_eq!(session.power_state(&handle).unwrap(), VmState::Off);
    }

    #[test]
    fn test_delete_requires_off() {
        let host = host();
        let mut session = host.connect().unwrap();
        let handle = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();
        session.start_vm(&handle).unwrap();
        assert!(matches!(
            session.delete_vm(&handle),
            Err(Error::InvalidState { .. })
        ));
        session.stop_vm(&handle, ShutdownType::Force).unwrap();
        session.delete_vm(&handle).unwrap();
        assert!(session.get_vm("vm1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_stale_handle_is_not_found() {
        let host = host();
        let mut session = host.connect().unwrap();
        session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();
        let stale = VmHandle::new("vm1", "not-the-id");
        assert!(session.power_state(&stale).unwrap_err().is_not_found());
    }

    #[test]
    fn test_disk_and_adapter_attachment() {
        let host = host();
        let mut session = host.connect().unwrap();
        let handle = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();

        let drive = HardDriveSpec::new("/d.vhdx");
        session.attach_hard_drive(&handle, &drive).unwrap();
        assert!(session.attach_hard_drive(&handle, &drive).is_err());
        assert!(matches!(
            session.attach_hard_drive(&handle, &HardDriveSpec::new("/missing.vhdx")),
            Err(Error::DiskImageNotFound(_))
        ));
        assert_eq!(session.list_hard_drives(&handle).unwrap(), vec![drive]);

        let adapter = NetworkAdapterSpec::new("external").with_mac("00:15:5d:00:00:01");
        session.add_network_adapter(&handle, &adapter).unwrap();
        assert!(matches!(
            session.add_network_adapter(&handle, &NetworkAdapterSpec::new("nope")),
            Err(Error::SwitchNotFound(_))
        ));
        let listed = session.list_network_adapters(&handle).unwrap();
        assert_eq!(listed[0].mac_address.as_deref(), Some("00155D000001"));

        session.remove_network_adapter(&handle, &adapter).unwrap();
        assert!(session.list_network_adapters(&handle).unwrap().is_empty());
    }

    #[test]
    fn test_live_resize_follows_capabilities() {
        let host = host();
        let mut session = host.connect().unwrap();
        let handle = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();
        session.start_vm(&handle).unwrap();

        let two = ProcessorCount::new(2).unwrap();
        assert!(session.modify_processors(&handle, two).is_err());

        host.set_capabilities(HostCapabilities {
            live_processor_change: true,
            ..Default::default()
        });
        session.modify_processors(&handle, two).unwrap();
        assert_eq!(session.vm_configuration(&handle).unwrap().processors, two);
    }
}
