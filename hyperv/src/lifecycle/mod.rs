//! VM Lifecycle Controller.
//!
//! Converges a host towards a [`VirtualMachineSpec`] through create, read,
//! update and delete. Each call opens its own host session and keeps all
//! per-operation state on the stack, so calls for different VMs may run
//! concurrently on one controller.
//!
//! The host is the source of truth. Update and delete take the previously
//! observed state only as a hint and re-read the VM before acting on it.

mod plan;
mod power;

pub use plan::{reconcile, CoreChanges, ReplaceReason, SetChanges, UpdatePlan};
pub use power::{
    ensure_running, ensure_stopped, settle, wait_for_state, PowerWaitConfig,
    DEFAULT_POLL_INTERVAL, DEFAULT_POWER_TIMEOUT,
};

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, field, info, instrument, warn, Span};

use crate::error::{CreateStage, DeleteStage, Error, Result};
use crate::host::{HostConnector, HostSession, VmHandle};
use crate::network::NetworkAttachmentManager;
use crate::storage::DiskAttachmentManager;
use crate::vm::{VirtualMachineSpec, VirtualMachineState, VmState};

/// What to do when memory or processors change on a running VM the host
/// cannot resize live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunningUpdatePolicy {
    /// Fail with `RequiresStop` before touching the VM.
    #[default]
    Reject,
    /// Stop the VM, apply the change, start it again.
    StopAndRestart,
}

/// Where a VM stands from the controller's point of view.
///
/// Recorded as the `lifecycle` field of the CRUD spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
}

impl LifecycleState {
    /// Settled state for the outcome of a read.
    pub fn observed(state: Option<&VirtualMachineState>) -> Self {
        match state {
            Some(_) => LifecycleState::Present,
            None => LifecycleState::Absent,
        }
    }

    fn enter(self) {
        Span::current().record("lifecycle", field::display(self));
        debug!(lifecycle = %self, "Lifecycle transition");
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Absent => write!(f, "absent"),
            LifecycleState::Creating => write!(f, "creating"),
            LifecycleState::Present => write!(f, "present"),
            LifecycleState::Updating => write!(f, "updating"),
            LifecycleState::Deleting => write!(f, "deleting"),
        }
    }
}

/// Controller behavior knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub power: PowerWaitConfig,
    pub running_update: RunningUpdatePolicy,
    /// Bring a stopped VM up before the stop-then-destroy sequence.
    pub start_before_delete: bool,
    /// Power on a new VM once its disks and adapters are attached.
    pub start_after_create: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            power: PowerWaitConfig::default(),
            running_update: RunningUpdatePolicy::default(),
            start_before_delete: true,
            start_after_create: true,
        }
    }
}

/// Drives VMs on one host to their desired state.
#[derive(Debug, Clone)]
pub struct VmController<C> {
    connector: C,
    options: ControllerOptions,
}

impl<C: HostConnector> VmController<C> {
    pub fn new(connector: C) -> Self {
        Self::with_options(connector, ControllerOptions::default())
    }

    pub fn with_options(connector: C, options: ControllerOptions) -> Self {
        Self { connector, options }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    // ========== Create ==========

    /// Create the VM, attach its disks and adapters, start it, and read it
    /// back. The start is skipped when `start_after_create` is off.
    ///
    /// Nothing touches the host if validation fails. Once the VM object is
    /// defined, any later failure is returned as `PartialCreate` carrying
    /// the new vmId; the VM is left in place for the caller to reconcile.
    #[instrument(skip(self, spec), fields(vm_name = %spec.machine_name, lifecycle = field::Empty))]
    pub fn create(&self, spec: &VirtualMachineSpec) -> Result<VirtualMachineState> {
        let mut session = self.connector.connect()?;
        spec.validate()?;
        self.create_in(&mut session, spec)
    }

    fn create_in<S: HostSession>(
        &self,
        session: &mut S,
        spec: &VirtualMachineSpec,
    ) -> Result<VirtualMachineState> {
        match session.get_vm(&spec.machine_name) {
            Ok(existing) => {
                return Err(Error::VmAlreadyExists {
                    name: existing.name,
                    vm_id: existing.vm_id,
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        LifecycleState::Creating.enter();
        let vm = session.create_vm(spec)?;
        info!(vm_id = %vm.vm_id, "VM created");
        let partial = |stage: CreateStage, e: Error| {
            Error::partial_create(&spec.machine_name, &vm.vm_id, stage, e)
        };

        let mut disks = DiskAttachmentManager::new(&mut *session);
        for drive in &spec.hard_drives {
            disks
                .attach(&vm, drive)
                .map_err(|e| partial(CreateStage::AttachDisk, e))?;
        }

        let mut nics = NetworkAttachmentManager::new(&mut *session);
        for adapter in &spec.network_adapters {
            nics.attach(&vm, adapter)
                .map_err(|e| partial(CreateStage::AttachAdapter, e))?;
        }

        if self.options.start_after_create {
            ensure_running(session, &vm, &self.options.power)
                .map_err(|e| partial(CreateStage::Start, e))?;
        }

        let state = observe(session, &vm, spec.triggers.clone())
            .map_err(|e| partial(CreateStage::Observe, e))?;
        LifecycleState::Present.enter();
        Ok(state)
    }

    // ========== Read ==========

    /// Read the VM named `name` from the host.
    ///
    /// Returns `Ok(None)` when no such VM exists, or when `vm_id` is given
    /// and the VM by that name has a different id (it was recreated outside
    /// the controller). Engine-owned `triggers` are not stored on the host
    /// and come back empty; use [`refresh`](Self::refresh) to keep them.
    #[instrument(skip(self), fields(lifecycle = field::Empty))]
    pub fn read(&self, name: &str, vm_id: Option<&str>) -> Result<Option<VirtualMachineState>> {
        let mut session = self.connector.connect()?;
        let state = read_in(&mut session, name, vm_id, Vec::new())?;
        LifecycleState::observed(state.as_ref()).enter();
        Ok(state)
    }

    /// Re-read a previously observed VM, carrying its triggers forward.
    #[instrument(skip_all, fields(vm_name = %previous.name(), vm_id = %previous.vm_id, lifecycle = field::Empty))]
    pub fn refresh(&self, previous: &VirtualMachineState) -> Result<Option<VirtualMachineState>> {
        let mut session = self.connector.connect()?;
        let state = read_in(
            &mut session,
            previous.name(),
            Some(&previous.vm_id),
            previous.spec.triggers.clone(),
        )?;
        LifecycleState::observed(state.as_ref()).enter();
        Ok(state)
    }

    // ========== Update ==========

    /// Converge an existing VM from `previous` to `desired`.
    ///
    /// A change of name, generation or triggers recreates the VM. Anything
    /// else is applied in place: disks and adapters are detached then
    /// attached by set difference against the live VM, then memory,
    /// processors and automatic actions are set.
    ///
    /// A rename onto a name another VM already holds fails with
    /// `VmAlreadyExists` before the old VM is touched.
    #[instrument(skip_all, fields(vm_name = %previous.name(), vm_id = %previous.vm_id, lifecycle = field::Empty))]
    pub fn update(
        &self,
        previous: &VirtualMachineState,
        desired: &VirtualMachineSpec,
    ) -> Result<VirtualMachineState> {
        let mut session = self.connector.connect()?;
        desired.validate()?;

        if let UpdatePlan::Replace(reasons) = UpdatePlan::between(&previous.spec, desired) {
            if reasons.contains(&ReplaceReason::MachineName) {
                let holder = locate(&mut session, &desired.machine_name, None)?;
                if let Some(taken) = holder.filter(|vm| vm.vm_id != previous.vm_id) {
                    return Err(Error::VmAlreadyExists {
                        name: taken.name,
                        vm_id: taken.vm_id,
                    });
                }
            }
            let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
            info!(changed = %reasons.join(", "), "Replacing VM");
            self.delete_in(&mut session, previous.name(), Some(&previous.vm_id))?;
            return self.create_in(&mut session, desired);
        }

        let vm = locate(&mut session, previous.name(), Some(&previous.vm_id))?
            .ok_or_else(|| Error::VmNotFound(previous.name().to_string()))?;
        LifecycleState::Updating.enter();

        let live = session.vm_configuration(&vm)?;
        let core = CoreChanges::between(&live, desired)?;
        let disk_changes = reconcile(
            &previous.spec.hard_drives,
            &desired.hard_drives,
            &DiskAttachmentManager::new(&mut session).list_attached(&vm)?,
        );
        let nic_changes = reconcile(
            &previous.spec.network_adapters,
            &desired.network_adapters,
            &NetworkAttachmentManager::new(&mut session).list_attached(&vm)?,
        );
        debug!(?core, ?disk_changes, ?nic_changes, "Update plan");

        let mut blocked = core.requiring_stop(&session.capabilities()?);
        if plan::disk_changes_require_stop(&disk_changes) {
            blocked.push("hardDrives");
        }

        let mut restart = false;
        if !blocked.is_empty() {
            let state = settle(&mut session, &vm, &self.options.power)?;
            if !state.is_off() {
                match self.options.running_update {
                    RunningUpdatePolicy::Reject => {
                        return Err(Error::RequiresStop {
                            vm_name: vm.name,
                            properties: blocked,
                        })
                    }
                    RunningUpdatePolicy::StopAndRestart => {
                        info!(properties = %blocked.join(", "), "Stopping VM to apply changes");
                        ensure_stopped(&mut session, &vm, &self.options.power)?;
                        restart = state == VmState::Running;
                    }
                }
            }
        }

        {
            let mut disks = DiskAttachmentManager::new(&mut session);
            for drive in &disk_changes.detach {
                disks.detach(&vm, drive)?;
            }
        }
        {
            let mut nics = NetworkAttachmentManager::new(&mut session);
            for adapter in &nic_changes.detach {
                nics.detach(&vm, adapter)?;
            }
        }
        {
            let mut disks = DiskAttachmentManager::new(&mut session);
            for drive in &disk_changes.attach {
                disks.attach(&vm, drive)?;
            }
        }
        {
            let mut nics = NetworkAttachmentManager::new(&mut session);
            for adapter in &nic_changes.attach {
                nics.attach(&vm, adapter)?;
            }
        }

        if let Some(memory) = &core.memory {
            info!(%memory, "Changing memory");
            session.modify_memory(&vm, memory)?;
        }
        if let Some(processors) = core.processors {
            info!(%processors, "Changing processor count");
            session.modify_processors(&vm, processors)?;
        }
        if let Some(actions) = core.automatic_actions {
            session.modify_automatic_actions(&vm, actions)?;
        }

        if restart {
            ensure_running(&mut session, &vm, &self.options.power)?;
        }

        let state = observe(&mut session, &vm, desired.triggers.clone())?;
        LifecycleState::Present.enter();
        Ok(state)
    }

    // ========== Delete ==========

    /// Stop and destroy the VM. Succeeds if it is already gone.
    ///
    /// A VM with the same name but a different id than `vm_id` is treated
    /// as already gone and left alone. Disk image files are never removed.
    /// Failures of the stop/destroy sequence are returned as a retryable
    /// `Delete` error.
    #[instrument(skip(self), fields(lifecycle = field::Empty))]
    pub fn delete(&self, name: &str, vm_id: Option<&str>) -> Result<()> {
        let mut session = self.connector.connect()?;
        self.delete_in(&mut session, name, vm_id)
    }

    fn delete_in<S: HostSession>(
        &self,
        session: &mut S,
        name: &str,
        vm_id: Option<&str>,
    ) -> Result<()> {
        let Some(vm) = locate(session, name, vm_id)? else {
            info!(vm_name = name, "VM already absent");
            LifecycleState::Absent.enter();
            return Ok(());
        };
        LifecycleState::Deleting.enter();
        let power = &self.options.power;

        if self.options.start_before_delete {
            match ensure_running(session, &vm, power) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e @ Error::Connection { .. }) => {
                    return Err(Error::delete(name, DeleteStage::Start, e))
                }
                Err(e) => {
                    warn!(vm_name = name, error = %e, "VM did not start, stopping from current state")
                }
            }
        }

        match ensure_stopped(session, &vm, power) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(Error::delete(name, DeleteStage::Stop, e)),
        }

        if let Err(e) = session.delete_vm(&vm) {
            // The destroy may have gone through even though the call failed.
            let remaining = locate(session, name, Some(&vm.vm_id))
                .map_err(|lookup| Error::delete(name, DeleteStage::Destroy, lookup))?;
            if remaining.is_none() {
                info!(vm_name = name, "VM gone despite destroy error");
                LifecycleState::Absent.enter();
                return Ok(());
            }
            return Err(Error::delete(name, DeleteStage::Destroy, e));
        }

        info!(vm_name = name, vm_id = %vm.vm_id, "VM deleted");
        LifecycleState::Absent.enter();
        Ok(())
    }
}

/// Find `name` on the host, treating an id mismatch as absent.
fn locate<S: HostSession + ?Sized>(
    session: &mut S,
    name: &str,
    vm_id: Option<&str>,
) -> Result<Option<VmHandle>> {
    match session.get_vm(name) {
        Ok(vm) => match vm_id {
            Some(expected) if !expected.eq_ignore_ascii_case(&vm.vm_id) => {
                warn!(
                    vm_name = name,
                    expected,
                    found = %vm.vm_id,
                    "VM name now belongs to a different VM"
                );
                Ok(None)
            }
            _ => Ok(Some(vm)),
        },
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_in<S: HostSession + ?Sized>(
    session: &mut S,
    name: &str,
    vm_id: Option<&str>,
    triggers: Vec<serde_json::Value>,
) -> Result<Option<VirtualMachineState>> {
    let Some(vm) = locate(session, name, vm_id)? else {
        debug!(vm_name = name, "VM not found");
        return Ok(None);
    };
    match observe(session, &vm, triggers) {
        Ok(state) => Ok(Some(state)),
        // Deleted between lookup and read.
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Build the observed state from live host values.
fn observe<S: HostSession + ?Sized>(
    session: &mut S,
    vm: &VmHandle,
    triggers: Vec<serde_json::Value>,
) -> Result<VirtualMachineState> {
    let config = session.vm_configuration(vm)?;
    let power_state = session.power_state(vm)?;
    let hard_drives = DiskAttachmentManager::new(&mut *session).list_attached(vm)?;
    let network_adapters = NetworkAttachmentManager::new(&mut *session).list_attached(vm)?;

    let dynamic = config.memory.dynamic;
    Ok(VirtualMachineState {
        vm_id: vm.vm_id.clone(),
        power_state,
        spec: VirtualMachineSpec {
            machine_name: vm.name.clone(),
            generation: config.generation.number(),
            processor_count: config.processors.get(),
            memory_size: config.memory.startup.as_mb(),
            dynamic_memory: dynamic.is_some(),
            minimum_memory: dynamic.map(|d| d.minimum.as_mb()),
            maximum_memory: dynamic.map(|d| d.maximum.as_mb()),
            auto_start_action: config.automatic_actions.start,
            auto_stop_action: config.automatic_actions.stop,
            hard_drives,
            network_adapters,
            triggers,
        },
    })
}
