//! [`HostSession`] over the Hyper-V WMI provider.

use windows::Win32::System::Wmi::IWbemClassObject;

use super::connection::{escape_wql, ConnectionConfig, WbemClassObjectExt, WmiConnection};
use super::job::{wait_for_method_result, JobWaitConfig};
use crate::error::{CreateStage, Error, FailureType, Result};
use crate::host::{HostCapabilities, HostConnector, HostSession, VmConfiguration, VmHandle};
use crate::network::{normalize_mac, NetworkAdapterSpec};
use crate::storage::{ControllerType, DiskSlot, HardDriveSpec};
use crate::vm::{
    AutomaticActions, AutomaticStartAction, AutomaticStopAction, DynamicMemory, Generation,
    MemoryConfiguration, MemoryMB, ProcessorCount, RequestedState, ShutdownType,
    VirtualMachineSpec, VmState,
};

const MANAGEMENT_SERVICE: &str = "Msvm_VirtualSystemManagementService";
const IMAGE_MANAGEMENT_SERVICE: &str = "Msvm_ImageManagementService";

const DISK_DRIVE: &str = "Microsoft:Hyper-V:Synthetic Disk Drive";
const VIRTUAL_HARD_DISK: &str = "Microsoft:Hyper-V:Virtual Hard Disk";
const ETHERNET_PORT: &str = "Microsoft:Hyper-V:Synthetic Ethernet Port";
const ETHERNET_CONNECTION: &str = "Microsoft:Hyper-V:Ethernet Connection";

const SHUTDOWN_REASON: &str = "Shutdown requested by hyperv-machine";

/// Opens WMI sessions against one Hyper-V host.
#[derive(Debug, Clone)]
pub struct WmiConnector {
    config: ConnectionConfig,
    jobs: JobWaitConfig,
}

impl WmiConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            jobs: JobWaitConfig::default(),
        }
    }

    /// The local host with default timeouts.
    pub fn local() -> Self {
        Self::new(ConnectionConfig::local())
    }

    /// Connector described by a loaded configuration file.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.host.connection_config())
            .with_job_config(JobWaitConfig::with_timeout(config.lifecycle.job_timeout()))
    }

    pub fn with_job_config(mut self, jobs: JobWaitConfig) -> Self {
        self.jobs = jobs;
        self
    }
}

impl HostConnector for WmiConnector {
    type Session = WmiSession;

    fn connect(&self) -> Result<WmiSession> {
        let connection = WmiConnection::connect(self.config.clone())?;
        tracing::debug!(host = self.config.host_name(), "WMI session opened");
        Ok(WmiSession {
            host_name: self.config.host_name().to_string(),
            connection,
            jobs: self.jobs,
            management_path: None,
        })
    }
}

/// One open WMI connection. Dropping it releases the COM proxy.
pub struct WmiSession {
    host_name: String,
    connection: WmiConnection,
    jobs: JobWaitConfig,
    management_path: Option<String>,
}

struct Controller {
    controller_type: ControllerType,
    number: u32,
    path: String,
}

struct Drive {
    path: String,
    slot: DiskSlot,
}

struct Image {
    path: String,
    parent: String,
    file: String,
}

/// Storage resources of one VM, as the host reports them.
struct StorageLayout {
    controllers: Vec<Controller>,
    drives: Vec<Drive>,
    images: Vec<Image>,
}

impl StorageLayout {
    fn controller(&self, controller_type: ControllerType, number: u32) -> Option<&Controller> {
        self.controllers
            .iter()
            .find(|c| c.controller_type == controller_type && c.number == number)
    }

    fn drive_at(&self, slot: DiskSlot) -> Option<&Drive> {
        self.drives.iter().find(|d| d.slot == slot)
    }

    fn image_in(&self, drive: &Drive) -> Option<&Image> {
        self.images.iter().find(|i| same_path(&i.parent, &drive.path))
    }
}

struct AttachedAdapter {
    spec: NetworkAdapterSpec,
    path: String,
    connection: Option<String>,
}

/// Compare WMI object paths, ignoring the server and namespace prefix.
fn same_path(a: &str, b: &str) -> bool {
    fn relative(path: &str) -> &str {
        path.find(":Msvm_").map_or(path, |i| &path[i + 1..])
    }
    relative(a).eq_ignore_ascii_case(relative(b))
}

fn memory_value(property: &str, mb: u64) -> Result<MemoryMB> {
    MemoryMB::new(mb).ok_or_else(|| Error::TypeConversion {
        property: property.to_string(),
        expected: "MemoryMB",
    })
}

impl WmiSession {
    fn management_path(&mut self) -> Result<String> {
        if let Some(path) = &self.management_path {
            return Ok(path.clone());
        }
        let path = self.connection.get_singleton(MANAGEMENT_SERVICE)?.get_path()?;
        self.management_path = Some(path.clone());
        Ok(path)
    }

    /// Call a method on `target` and wait for its job.
    fn invoke<F>(
        &mut self,
        target: &str,
        class: &str,
        method: &'static str,
        vm_name: &str,
        fill: F,
    ) -> Result<IWbemClassObject>
    where
        F: FnOnce(&IWbemClassObject) -> Result<()>,
    {
        let params = self.connection.get_method_params(class, method)?;
        fill(&params)?;
        let out = self.connection.exec_method(target, method, Some(&params))?;
        wait_for_method_result(&self.connection, &out, method, vm_name, self.jobs)?;
        Ok(out)
    }

    fn invoke_management<F>(&mut self, method: &'static str, vm_name: &str, fill: F) -> Result<IWbemClassObject>
    where
        F: FnOnce(&IWbemClassObject) -> Result<()>,
    {
        let service = self.management_path()?;
        self.invoke(&service, MANAGEMENT_SERVICE, method, vm_name, fill)
    }

    fn computer_system(&self, vm: &VmHandle) -> Result<IWbemClassObject> {
        self.connection
            .query_first(&format!(
                "SELECT * FROM Msvm_ComputerSystem WHERE Caption = 'Virtual Machine' AND Name = '{}'",
                escape_wql(&vm.vm_id)
            ))?
            .ok_or_else(|| Error::VmNotFound(vm.name.clone()))
    }

    /// The realized (active) settings of a VM.
    fn system_settings(&self, vm: &VmHandle) -> Result<IWbemClassObject> {
        self.connection
            .query_first(&format!(
                "SELECT * FROM Msvm_VirtualSystemSettingData WHERE VirtualSystemIdentifier = '{}' \
                 AND VirtualSystemType = 'Microsoft:Hyper-V:System:Realized'",
                escape_wql(&vm.vm_id)
            ))?
            .ok_or_else(|| Error::VmNotFound(vm.name.clone()))
    }

    fn components(&self, settings_path: &str, class: &str) -> Result<Vec<IWbemClassObject>> {
        self.connection.query(&format!(
            "ASSOCIATORS OF {{{}}} WHERE ResultClass = {}",
            settings_path, class
        ))
    }

    fn component(&self, vm: &VmHandle, class: &str) -> Result<IWbemClassObject> {
        let settings_path = self.system_settings(vm)?.get_path()?;
        self.components(&settings_path, class)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::MissingProperty(format!("{} of {}", class, vm.name)))
    }

    /// Add one resource and return the path of the created setting.
    fn add_resource(&mut self, vm: &VmHandle, settings_path: &str, resource: &IWbemClassObject) -> Result<String> {
        let text = resource.get_text()?;
        let out = self.invoke_management("AddResourceSettings", &vm.name, |params| {
            params.put_string("AffectedConfiguration", settings_path)?;
            params.put_string_array("ResourceSettings", &[text])
        })?;
        out.get_string_array("ResultingResourceSettings")?
            .and_then(|paths| paths.into_iter().next())
            .ok_or_else(|| Error::MissingProperty("ResultingResourceSettings".to_string()))
    }

    fn remove_resources(&mut self, vm: &VmHandle, paths: Vec<String>) -> Result<()> {
        self.invoke_management("RemoveResourceSettings", &vm.name, |params| {
            params.put_string_array("ResourceSettings", &paths)
        })?;
        Ok(())
    }

    fn modify_resource(&mut self, vm: &VmHandle, resource: &IWbemClassObject) -> Result<()> {
        let text = resource.get_text()?;
        self.invoke_management("ModifyResourceSettings", &vm.name, |params| {
            params.put_string_array("ResourceSettings", &[text])
        })?;
        Ok(())
    }

    fn request_state(&mut self, vm: &VmHandle, state: RequestedState) -> Result<()> {
        let path = self.computer_system(vm)?.get_path()?;
        self.invoke(&path, "Msvm_ComputerSystem", "RequestStateChange", &vm.name, |params| {
            params.put_u16("RequestedState", state as u16)
        })?;
        Ok(())
    }

    fn shutdown_guest(&mut self, vm: &VmHandle) -> Result<()> {
        let component = self
            .connection
            .query_first(&format!(
                "SELECT * FROM Msvm_ShutdownComponent WHERE SystemName = '{}'",
                escape_wql(&vm.vm_id)
            ))?
            .ok_or_else(|| {
                Error::host_api(
                    "InitiateShutdown",
                    &vm.name,
                    0,
                    "shutdown integration service is not available",
                )
            })?;
        let path = component.get_path()?;
        self.invoke(&path, "Msvm_ShutdownComponent", "InitiateShutdown", &vm.name, |params| {
            params.put_bool("Force", false)?;
            params.put_string("Reason", SHUTDOWN_REASON)
        })?;
        Ok(())
    }

    fn configure_new_vm(&mut self, vm: &VmHandle, spec: &VirtualMachineSpec) -> Result<()> {
        self.modify_memory(vm, &spec.memory_configuration()?.aligned())?;
        self.modify_processors(vm, spec.processors()?)?;
        Ok(())
    }

    fn storage_layout(&self, settings_path: &str) -> Result<StorageLayout> {
        let resources = self.components(settings_path, "Msvm_ResourceAllocationSettingData")?;

        let mut controllers = Vec::new();
        let mut drive_objects = Vec::new();
        let mut scsi_seen = 0;
        for resource in &resources {
            let subtype = resource.get_string_prop("ResourceSubType")?.unwrap_or_default();
            if subtype == ControllerType::Scsi.resource_subtype() {
                // SCSI controllers are numbered in enumeration order.
                controllers.push(Controller {
                    controller_type: ControllerType::Scsi,
                    number: scsi_seen,
                    path: resource.get_path()?,
                });
                scsi_seen += 1;
            } else if subtype == ControllerType::Ide.resource_subtype() {
                controllers.push(Controller {
                    controller_type: ControllerType::Ide,
                    number: resource.get_u32("Address")?.unwrap_or(0),
                    path: resource.get_path()?,
                });
            } else if subtype == DISK_DRIVE {
                drive_objects.push(resource);
            }
        }

        let mut drives = Vec::new();
        for drive in drive_objects {
            let parent = drive.get_string_prop("Parent")?.unwrap_or_default();
            let Some(controller) = controllers.iter().find(|c| same_path(&c.path, &parent)) else {
                continue;
            };
            drives.push(Drive {
                path: drive.get_path()?,
                slot: DiskSlot::new(
                    controller.controller_type,
                    controller.number,
                    drive.get_u32("AddressOnParent")?.unwrap_or(0),
                ),
            });
        }

        let mut images = Vec::new();
        for image in self.components(settings_path, "Msvm_StorageAllocationSettingData")? {
            if image.get_string_prop("ResourceSubType")?.as_deref() != Some(VIRTUAL_HARD_DISK) {
                continue;
            }
            let file = image
                .get_string_array("HostResource")?
                .and_then(|files| files.into_iter().next());
            if let Some(file) = file {
                images.push(Image {
                    path: image.get_path()?,
                    parent: image.get_string_prop("Parent")?.unwrap_or_default(),
                    file,
                });
            }
        }

        Ok(StorageLayout {
            controllers,
            drives,
            images,
        })
    }

    /// The controller for `slot`, adding SCSI controllers up to its number.
    fn controller_for(&mut self, vm: &VmHandle, settings_path: &str, slot: DiskSlot) -> Result<String> {
        let mut layout = self.storage_layout(settings_path)?;
        if slot.controller_type == ControllerType::Scsi {
            while layout.controller(ControllerType::Scsi, slot.controller_number).is_none() {
                let controller = self
                    .connection
                    .get_default_resource(ControllerType::Scsi.resource_subtype())?;
                self.add_resource(vm, settings_path, &controller)?;
                tracing::debug!(vm_name = %vm.name, "SCSI controller added");
                layout = self.storage_layout(settings_path)?;
            }
        }
        layout
            .controller(slot.controller_type, slot.controller_number)
            .map(|c| c.path.clone())
            .ok_or_else(|| {
                Error::host_api_with_type(
                    "AddResourceSettings",
                    &vm.name,
                    0,
                    format!("{} controller {} is not present", slot.controller_type, slot.controller_number),
                    FailureType::Configuration,
                )
            })
    }

    fn attached_adapters(&self, vm: &VmHandle) -> Result<Vec<AttachedAdapter>> {
        let settings_path = self.system_settings(vm)?.get_path()?;
        let connections = self.components(&settings_path, "Msvm_EthernetPortAllocationSettingData")?;

        let mut adapters = Vec::new();
        for port in self.components(&settings_path, "Msvm_SyntheticEthernetPortSettingData")? {
            let path = port.get_path()?;
            let mut connection = None;
            let mut switch_name = String::new();
            for candidate in &connections {
                let parent = candidate.get_string_prop("Parent")?.unwrap_or_default();
                if !same_path(&parent, &path) {
                    continue;
                }
                connection = Some(candidate.get_path()?);
                let switch = candidate
                    .get_string_array("HostResource")?
                    .and_then(|switches| switches.into_iter().next());
                if let Some(switch) = switch {
                    switch_name = self
                        .connection
                        .get_object(&switch)?
                        .get_string_prop("ElementName")?
                        .unwrap_or_default();
                }
                break;
            }

            let mac_address = if port.get_bool("StaticMacAddress")?.unwrap_or(false) {
                port.get_string_prop("Address")?
            } else {
                None
            };
            adapters.push(AttachedAdapter {
                spec: NetworkAdapterSpec {
                    name: port.get_string_prop("ElementName")?.unwrap_or_default(),
                    switch_name,
                    mac_address,
                },
                path,
                connection,
            });
        }
        Ok(adapters)
    }

    fn switch_path(&self, switch_name: &str) -> Result<Option<String>> {
        self.connection
            .query_first(&format!(
                "SELECT * FROM Msvm_VirtualEthernetSwitch WHERE ElementName = '{}'",
                escape_wql(switch_name)
            ))?
            .map(|switch| switch.get_path())
            .transpose()
    }
}

impl HostSession for WmiSession {
    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn get_vm(&mut self, name: &str) -> Result<VmHandle> {
        let system = self
            .connection
            .query_first(&format!(
                "SELECT * FROM Msvm_ComputerSystem WHERE Caption = 'Virtual Machine' AND ElementName = '{}'",
                escape_wql(name)
            ))?
            .ok_or_else(|| Error::VmNotFound(name.to_string()))?;
        let vm_id = system
            .get_string_prop("Name")?
            .ok_or_else(|| Error::MissingProperty("Msvm_ComputerSystem.Name".to_string()))?;
        Ok(VmHandle::new(name, vm_id))
    }

    fn create_vm(&mut self, spec: &VirtualMachineSpec) -> Result<VmHandle> {
        let settings = self.connection.spawn_instance("Msvm_VirtualSystemSettingData")?;
        settings.put_string("ElementName", &spec.machine_name)?;
        settings.put_string("VirtualSystemSubType", spec.vm_generation()?.to_subtype())?;
        for (property, value) in spec.automatic_actions().setting_values() {
            settings.put_u16(property, value)?;
        }
        let text = settings.get_text()?;

        let out = self.invoke_management("DefineSystem", &spec.machine_name, |params| {
            params.put_string("SystemSettings", &text)
        })?;
        let system_path = out
            .get_string_prop("ResultingSystem")?
            .ok_or_else(|| Error::MissingProperty("ResultingSystem".to_string()))?;
        let vm_id = self
            .connection
            .get_object(&system_path)?
            .get_string_prop("Name")?
            .ok_or_else(|| Error::MissingProperty("Msvm_ComputerSystem.Name".to_string()))?;
        let vm = VmHandle::new(&spec.machine_name, vm_id);
        tracing::info!(vm_name = %vm.name, vm_id = %vm.vm_id, "VM defined");

        self.configure_new_vm(&vm, spec)
            .map_err(|e| Error::partial_create(&vm.name, &vm.vm_id, CreateStage::Configure, e))?;
        Ok(vm)
    }

    fn power_state(&mut self, vm: &VmHandle) -> Result<VmState> {
        let system = self.computer_system(vm)?;
        Ok(VmState::from_enabled_state(
            system.get_u16("EnabledState")?.unwrap_or(0),
        ))
    }

    fn start_vm(&mut self, vm: &VmHandle) -> Result<()> {
        self.request_state(vm, RequestedState::Running)
    }

    fn stop_vm(&mut self, vm: &VmHandle, how: ShutdownType) -> Result<()> {
        match how {
            ShutdownType::Graceful => self.shutdown_guest(vm),
            ShutdownType::Force => self.request_state(vm, RequestedState::Off),
        }
    }

    fn delete_vm(&mut self, vm: &VmHandle) -> Result<()> {
        let path = self.computer_system(vm)?.get_path()?;
        self.invoke_management("DestroySystem", &vm.name, |params| {
            params.put_string("AffectedSystem", &path)
        })?;
        tracing::info!(vm_name = %vm.name, vm_id = %vm.vm_id, "VM destroyed");
        Ok(())
    }

    fn vm_configuration(&mut self, vm: &VmHandle) -> Result<VmConfiguration> {
        let settings = self.system_settings(vm)?;
        let settings_path = settings.get_path()?;
        let generation = Generation::from_subtype(
            &settings.get_string_prop("VirtualSystemSubType")?.unwrap_or_default(),
        );

        let memory_settings = self
            .components(&settings_path, "Msvm_MemorySettingData")?
            .into_iter()
            .next()
            .ok_or_else(|| Error::MissingProperty(format!("Msvm_MemorySettingData of {}", vm.name)))?;
        let startup = memory_value("VirtualQuantity", memory_settings.get_u64("VirtualQuantity")?.unwrap_or(0))?;
        let dynamic = if memory_settings.get_bool("DynamicMemoryEnabled")?.unwrap_or(false) {
            Some(DynamicMemory {
                minimum: memory_value("Reservation", memory_settings.get_u64("Reservation")?.unwrap_or(0))?,
                maximum: memory_value("Limit", memory_settings.get_u64("Limit")?.unwrap_or(0))?,
            })
        } else {
            None
        };

        let processor_settings = self
            .components(&settings_path, "Msvm_ProcessorSettingData")?
            .into_iter()
            .next()
            .ok_or_else(|| Error::MissingProperty(format!("Msvm_ProcessorSettingData of {}", vm.name)))?;
        let count = processor_settings.get_u64("VirtualQuantity")?.unwrap_or(0);
        let processors = u32::try_from(count)
            .ok()
            .and_then(ProcessorCount::new)
            .ok_or_else(|| Error::TypeConversion {
                property: "VirtualQuantity".to_string(),
                expected: "ProcessorCount",
            })?;

        Ok(VmConfiguration {
            generation,
            memory: MemoryConfiguration { startup, dynamic },
            processors,
            automatic_actions: AutomaticActions {
                start: AutomaticStartAction::from_value(
                    settings.get_u16("AutomaticStartupAction")?.unwrap_or(2),
                ),
                stop: AutomaticStopAction::from_value(
                    settings.get_u16("AutomaticShutdownAction")?.unwrap_or(2),
                ),
            },
        })
    }

    fn modify_memory(&mut self, vm: &VmHandle, memory: &MemoryConfiguration) -> Result<()> {
        let settings = self.component(vm, "Msvm_MemorySettingData")?;
        let startup = memory.startup.as_mb();
        settings.put_u64("VirtualQuantity", startup)?;
        match memory.dynamic {
            Some(dynamic) => {
                settings.put_bool("DynamicMemoryEnabled", true)?;
                settings.put_u64("Reservation", dynamic.minimum.as_mb())?;
                settings.put_u64("Limit", dynamic.maximum.as_mb())?;
            }
            None => {
                settings.put_bool("DynamicMemoryEnabled", false)?;
                settings.put_u64("Reservation", startup)?;
                settings.put_u64("Limit", startup)?;
            }
        }
        self.modify_resource(vm, &settings)?;
        tracing::debug!(vm_name = %vm.name, %memory, "Memory modified");
        Ok(())
    }

    fn modify_processors(&mut self, vm: &VmHandle, count: ProcessorCount) -> Result<()> {
        let settings = self.component(vm, "Msvm_ProcessorSettingData")?;
        settings.put_u64("VirtualQuantity", count.get() as u64)?;
        self.modify_resource(vm, &settings)?;
        tracing::debug!(vm_name = %vm.name, %count, "Processors modified");
        Ok(())
    }

    fn modify_automatic_actions(&mut self, vm: &VmHandle, actions: AutomaticActions) -> Result<()> {
        let settings = self.system_settings(vm)?;
        for (property, value) in actions.setting_values() {
            settings.put_u16(property, value)?;
        }
        let text = settings.get_text()?;
        self.invoke_management("ModifySystemSettings", &vm.name, |params| {
            params.put_string("SystemSettings", &text)
        })?;
        Ok(())
    }

    // Runtime resize depends on guest support the provider does not
    // advertise, so changes to running VMs always go through a stop.
    fn capabilities(&mut self) -> Result<HostCapabilities> {
        Ok(HostCapabilities::default())
    }

    fn list_hard_drives(&mut self, vm: &VmHandle) -> Result<Vec<HardDriveSpec>> {
        let settings_path = self.system_settings(vm)?.get_path()?;
        let layout = self.storage_layout(&settings_path)?;
        let mut drives: Vec<HardDriveSpec> = layout
            .drives
            .iter()
            .filter_map(|drive| {
                layout
                    .image_in(drive)
                    .map(|image| HardDriveSpec::new(image.file.clone()).at(drive.slot))
            })
            .collect();
        drives.sort_by_key(|d| d.slot());
        Ok(drives)
    }

    fn attach_hard_drive(&mut self, vm: &VmHandle, drive: &HardDriveSpec) -> Result<()> {
        let settings_path = self.system_settings(vm)?.get_path()?;
        let slot = drive.slot();
        let controller_path = self.controller_for(vm, &settings_path, slot)?;

        // An empty drive left at the slot is reused.
        let existing = self
            .storage_layout(&settings_path)?
            .drive_at(slot)
            .map(|d| d.path.clone());
        let (drive_path, added_drive) = match existing {
            Some(path) => (path, false),
            None => {
                let template = self.connection.get_default_resource(DISK_DRIVE)?;
                template.put_string("Parent", &controller_path)?;
                template.put_string("AddressOnParent", &slot.controller_location.to_string())?;
                (self.add_resource(vm, &settings_path, &template)?, true)
            }
        };

        let image = self.connection.get_default_resource(VIRTUAL_HARD_DISK)?;
        image.put_string("Parent", &drive_path)?;
        image.put_string_array("HostResource", &[drive.path.clone()])?;
        if let Err(e) = self.add_resource(vm, &settings_path, &image) {
            if added_drive {
                if let Err(cleanup) = self.remove_resources(vm, vec![drive_path]) {
                    tracing::warn!(vm_name = %vm.name, %slot, error = %cleanup, "Failed to remove empty disk drive");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn detach_hard_drive(&mut self, vm: &VmHandle, slot: DiskSlot) -> Result<()> {
        let settings_path = self.system_settings(vm)?.get_path()?;
        let layout = self.storage_layout(&settings_path)?;
        let Some(drive) = layout.drive_at(slot) else {
            return Ok(());
        };
        if let Some(image) = layout.image_in(drive) {
            self.remove_resources(vm, vec![image.path.clone()])?;
        }
        self.remove_resources(vm, vec![drive.path.clone()])
    }

    fn disk_image_exists(&mut self, path: &str) -> Result<bool> {
        let service = self.connection.get_singleton(IMAGE_MANAGEMENT_SERVICE)?.get_path()?;
        let host = self.host_name.clone();
        let lookup = self.invoke(
            &service,
            IMAGE_MANAGEMENT_SERVICE,
            "GetVirtualHardDiskSettingData",
            &host,
            |params| params.put_string("Path", path),
        );
        match lookup {
            Ok(_) => Ok(true),
            Err(Error::HostApi { .. } | Error::JobFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list_network_adapters(&mut self, vm: &VmHandle) -> Result<Vec<NetworkAdapterSpec>> {
        Ok(self
            .attached_adapters(vm)?
            .into_iter()
            .map(|a| a.spec)
            .collect())
    }

    fn add_network_adapter(&mut self, vm: &VmHandle, adapter: &NetworkAdapterSpec) -> Result<()> {
        let switch = self
            .switch_path(&adapter.switch_name)?
            .ok_or_else(|| Error::SwitchNotFound(adapter.switch_name.clone()))?;
        let settings_path = self.system_settings(vm)?.get_path()?;

        let port = self.connection.get_default_resource(ETHERNET_PORT)?;
        port.put_string("ElementName", &adapter.name)?;
        if let Some(mac) = adapter.mac_address.as_deref().and_then(normalize_mac) {
            port.put_bool("StaticMacAddress", true)?;
            port.put_string("Address", &mac)?;
        }
        let port_path = self.add_resource(vm, &settings_path, &port)?;

        let connection = self.connection.get_default_resource(ETHERNET_CONNECTION)?;
        connection.put_string("Parent", &port_path)?;
        connection.put_string_array("HostResource", &[switch])?;
        if let Err(e) = self.add_resource(vm, &settings_path, &connection) {
            if let Err(cleanup) = self.remove_resources(vm, vec![port_path]) {
                tracing::warn!(vm_name = %vm.name, adapter = %adapter.name, error = %cleanup, "Failed to remove unconnected adapter");
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove_network_adapter(&mut self, vm: &VmHandle, adapter: &NetworkAdapterSpec) -> Result<()> {
        let Some(attached) = self
            .attached_adapters(vm)?
            .into_iter()
            .find(|a| &a.spec == adapter)
        else {
            return Ok(());
        };
        if let Some(connection) = attached.connection {
            self.remove_resources(vm, vec![connection])?;
        }
        self.remove_resources(vm, vec![attached.path])
    }

    fn switch_exists(&mut self, switch_name: &str) -> Result<bool> {
        Ok(self.switch_path(switch_name)?.is_some())
    }
}
