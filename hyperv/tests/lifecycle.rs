//! End-to-end controller scenarios against the in-memory host.

use std::time::Duration;

use hyperv_machine::host::{GracefulShutdown, HostEvent, HostOperation, PowerBehavior};
use hyperv_machine::{
    ControllerOptions, DeleteStage, DiskSlot, Error, Generation, HardDriveSpec, MemoryHost,
    NetworkAdapterSpec, PowerWaitConfig, RunningUpdatePolicy, ShutdownType, VirtualMachineSpec,
    VmController, VmState,
};

const DISK0: &str = r"C:\vms\web01-os.vhdx";
const DISK1: &str = r"C:\vms\web01-data.vhdx";

// New VMs stay off so in-place updates need no stop.
fn fast_options() -> ControllerOptions {
    ControllerOptions {
        power: PowerWaitConfig::with_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(1)),
        start_after_create: false,
        ..Default::default()
    }
}

fn setup() -> (MemoryHost, VmController<MemoryHost>) {
    let host = MemoryHost::default();
    host.add_switch("external")
        .add_switch("internal")
        .add_disk_image(DISK0)
        .add_disk_image(DISK1);
    let controller = VmController::with_options(host.clone(), fast_options());
    (host, controller)
}

fn web01() -> VirtualMachineSpec {
    VirtualMachineSpec::builder("web01")
        .memory_mb(2048)
        .processor_count(2)
        .hard_drive(HardDriveSpec::new(DISK0))
        .network_adapter(NetworkAdapterSpec::new("external"))
        .build()
        .unwrap()
}

fn count_events(host: &MemoryHost, pred: impl Fn(&HostEvent) -> bool) -> usize {
    host.events().iter().filter(|e| pred(e)).count()
}

#[test]
fn test_create_then_read_round_trips() {
    let (host, controller) = setup();
    let spec = web01();

    let created = controller.create(&spec).unwrap();
    assert_eq!(created.vm_id, host.vm_id("web01").unwrap());
    assert_eq!(created.power_state, VmState::Off);
    assert_eq!(created.spec, spec);

    let read = controller
        .read("web01", Some(&created.vm_id))
        .unwrap()
        .unwrap();
    assert_eq!(read, created);
}

#[test]
fn test_default_create_starts_and_reads_running() {
    let (host, _) = setup();
    let controller = VmController::with_options(
        host.clone(),
        ControllerOptions {
            start_after_create: true,
            ..fast_options()
        },
    );

    let created = controller.create(&web01()).unwrap();
    assert_eq!(created.power_state, VmState::Running);
    assert_eq!(
        count_events(&host, |e| matches!(e, HostEvent::Started { .. })),
        1
    );

    // A processor change on the running VM is refused without touching it.
    let mut desired = web01();
    desired.processor_count = 4;
    assert!(matches!(
        controller.update(&created, &desired),
        Err(Error::RequiresStop { .. })
    ));
    assert_eq!(host.vm_power_state("web01"), Some(VmState::Running));
}

#[test]
fn test_read_absent_vm_is_none() {
    let (_host, controller) = setup();
    assert!(controller.read("nobody", None).unwrap().is_none());
}

#[test]
fn test_create_accepts_json_record() {
    let (_host, controller) = setup();
    let spec: VirtualMachineSpec = serde_json::from_value(serde_json::json!({
        "machineName": "db01",
        "generation": 1,
        "memorySize": 4096,
        "hardDrives": [
            { "path": DISK0, "controllerType": "IDE" },
            { "path": DISK1, "controllerType": "SCSI", "controllerLocation": 3 }
        ],
        "networkAdapters": [
            { "switchName": "internal", "macAddress": "00-15-5d-01-02-03" }
        ]
    }))
    .unwrap();

    let state = controller.create(&spec).unwrap();
    assert_eq!(state.spec.generation, 1);
    assert_eq!(
        state.spec.hard_drives.iter().map(|d| d.slot()).collect::<Vec<_>>(),
        vec![DiskSlot::ide(0, 0), DiskSlot::scsi(0, 3)]
    );
    assert_eq!(state.spec.network_adapters, spec.network_adapters);
}

#[test]
fn test_delete_twice_succeeds() {
    let (host, controller) = setup();
    let state = controller.create(&web01()).unwrap();

    controller.delete("web01", Some(&state.vm_id)).unwrap();
    assert_eq!(host.vm_count(), 0);
    controller.delete("web01", Some(&state.vm_id)).unwrap();
    assert!(controller.read("web01", None).unwrap().is_none());
}

#[test]
fn test_delete_leaves_disk_images() {
    let (host, controller) = setup();
    let state = controller.create(&web01()).unwrap();
    controller.delete("web01", Some(&state.vm_id)).unwrap();

    // The image is still registered, so a new VM can attach it.
    let again = controller.create(&web01()).unwrap();
    assert_eq!(again.spec.hard_drives, vec![HardDriveSpec::new(DISK0)]);
    assert_ne!(again.vm_id, state.vm_id);
    assert_eq!(host.vm_count(), 1);
}

#[test]
fn test_update_detach_of_missing_disk_is_noop() {
    let (host, controller) = setup();
    let previous = controller.create(&web01()).unwrap();
    host.remove_disk_out_of_band("web01", DiskSlot::scsi(0, 0));
    host.clear_events();

    let mut desired = web01();
    desired.hard_drives.clear();
    let updated = controller.update(&previous, &desired).unwrap();

    assert!(updated.spec.hard_drives.is_empty());
    assert_eq!(
        count_events(&host, |e| matches!(e, HostEvent::DiskDetached { .. })),
        0
    );
}

#[test]
fn test_processor_update_keeps_identity_and_attachments() {
    let (host, controller) = setup();
    let previous = controller.create(&web01()).unwrap();
    host.clear_events();

    let mut desired = web01();
    desired.processor_count = 4;
    let updated = controller.update(&previous, &desired).unwrap();

    assert_eq!(updated.vm_id, previous.vm_id);
    assert_eq!(updated.spec.processor_count, 4);
    assert_eq!(updated.spec.hard_drives, previous.spec.hard_drives);
    assert_eq!(updated.spec.network_adapters, previous.spec.network_adapters);
    assert_eq!(
        host.events(),
        vec![HostEvent::ProcessorsModified {
            name: "web01".to_string()
        }]
    );
}

#[test]
fn test_generation_change_replaces_vm() {
    let (host, controller) = setup();
    let previous = controller.create(&web01()).unwrap();

    let mut desired = web01();
    desired.generation = Generation::Gen1.number();
    let replaced = controller.update(&previous, &desired).unwrap();

    assert_ne!(replaced.vm_id, previous.vm_id);
    assert_eq!(replaced.spec.generation, 1);
    assert_eq!(host.vm_count(), 1);
    assert!(controller
        .read("web01", Some(&previous.vm_id))
        .unwrap()
        .is_none());
}

#[test]
fn test_trigger_change_replaces_vm() {
    let (_host, controller) = setup();
    let previous = controller.create(&web01()).unwrap();

    let mut desired = web01();
    desired.triggers.push(serde_json::json!({ "image": "2026-10" }));
    let replaced = controller.update(&previous, &desired).unwrap();

    assert_ne!(replaced.vm_id, previous.vm_id);
    assert_eq!(replaced.spec.triggers, desired.triggers);
}

#[test]
fn test_dynamic_memory_bounds() {
    let (_host, controller) = setup();

    let accepted = VirtualMachineSpec::builder("dyn-ok")
        .memory_mb(2048)
        .dynamic_memory(512, 8192)
        .build()
        .unwrap();
    let state = controller.create(&accepted).unwrap();
    assert!(state.spec.dynamic_memory);
    assert_eq!(state.spec.minimum_memory, Some(512));
    assert_eq!(state.spec.maximum_memory, Some(8192));

    let mut rejected = VirtualMachineSpec::new("dyn-bad");
    rejected.memory_size = 2048;
    rejected.dynamic_memory = true;
    rejected.minimum_memory = Some(4096);
    rejected.maximum_memory = Some(8192);
    let err = controller.create(&rejected).unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert!(controller.read("dyn-bad", None).unwrap().is_none());
}

#[test]
fn test_adding_disk_does_not_churn_existing() {
    let (host, controller) = setup();
    let previous = controller.create(&web01()).unwrap();
    host.clear_events();

    let mut desired = web01();
    desired
        .hard_drives
        .push(HardDriveSpec::new(DISK1).at(DiskSlot::scsi(0, 1)));
    let updated = controller.update(&previous, &desired).unwrap();

    assert_eq!(updated.spec.hard_drives, desired.hard_drives);
    assert_eq!(
        host.events(),
        vec![HostEvent::DiskAttached {
            name: "web01".to_string(),
            slot: DiskSlot::scsi(0, 1),
        }]
    );
}

#[test]
fn test_adapter_swap_detaches_before_attaching() {
    let (host, controller) = setup();
    let previous = controller.create(&web01()).unwrap();
    host.clear_events();

    let mut desired = web01();
    desired.network_adapters = vec![NetworkAdapterSpec::new("internal")];
    let updated = controller.update(&previous, &desired).unwrap();

    assert_eq!(updated.spec.network_adapters, desired.network_adapters);
    let events = host.events();
    assert!(matches!(events[0], HostEvent::AdapterRemoved { .. }));
    assert!(matches!(events[1], HostEvent::AdapterAdded { .. }));
}

#[test]
fn test_failed_attach_reports_partial_create() {
    let (host, controller) = setup();
    host.fail_next(HostOperation::AttachHardDrive, 1);

    let err = controller.create(&web01()).unwrap_err();
    let vm_id = host.vm_id("web01").unwrap();
    assert_eq!(err.partial_vm_id(), Some(vm_id.as_str()));
    assert!(!err.is_retryable());

    // The leftover VM is visible and can be adopted.
    let state = controller.read("web01", Some(&vm_id)).unwrap().unwrap();
    assert!(state.spec.hard_drives.is_empty());
}

#[test]
fn test_missing_switch_reports_partial_create() {
    let (host, controller) = setup();
    let spec = VirtualMachineSpec::builder("web02")
        .network_adapter(NetworkAdapterSpec::new("nowhere"))
        .build()
        .unwrap();

    let err = controller.create(&spec).unwrap_err();
    assert!(matches!(err, Error::PartialCreate { .. }));
    assert_eq!(err.partial_vm_id(), host.vm_id("web02").as_deref());
}

#[test]
fn test_delete_escalates_ignored_shutdown() {
    let (host, controller) = setup();
    let state = controller.create(&web01()).unwrap();
    host.set_power_behavior(PowerBehavior {
        graceful_shutdown: GracefulShutdown::Ignored,
        ..Default::default()
    });

    controller.delete("web01", Some(&state.vm_id)).unwrap();
    assert_eq!(host.vm_count(), 0);
    assert_eq!(
        count_events(&host, |e| matches!(
            e,
            HostEvent::StopRequested {
                how: ShutdownType::Force,
                ..
            }
        )),
        1
    );
}

#[test]
fn test_stuck_vm_delete_is_retryable() {
    let (host, controller) = setup();
    let state = controller.create(&web01()).unwrap();
    host.set_power_behavior(PowerBehavior {
        graceful_shutdown: GracefulShutdown::Ignored,
        ignore_force_stop: true,
        ..Default::default()
    });

    let err = controller.delete("web01", Some(&state.vm_id)).unwrap_err();
    assert!(matches!(
        err,
        Error::Delete {
            stage: DeleteStage::Stop,
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(host.vm_count(), 1);

    host.set_power_behavior(PowerBehavior::default());
    controller.delete("web01", Some(&state.vm_id)).unwrap();
    assert_eq!(host.vm_count(), 0);
}

#[test]
fn test_running_update_rejected_by_default() {
    let (host, controller) = setup();
    let previous = controller.create(&web01()).unwrap();
    host.set_power_state("web01", VmState::Running);

    let mut desired = web01();
    desired.processor_count = 8;
    let err = controller.update(&previous, &desired).unwrap_err();
    match err {
        Error::RequiresStop { properties, .. } => assert_eq!(properties, vec!["processorCount"]),
        other => panic!("unexpected error: {other}"),
    }

    let state = controller.read("web01", None).unwrap().unwrap();
    assert_eq!(state.spec.processor_count, 2);
    assert_eq!(state.power_state, VmState::Running);
}

#[test]
fn test_running_update_stop_and_restart() {
    let host = MemoryHost::default();
    host.add_switch("external").add_disk_image(DISK0);
    let controller = VmController::with_options(
        host.clone(),
        ControllerOptions {
            running_update: RunningUpdatePolicy::StopAndRestart,
            ..fast_options()
        },
    );
    let previous = controller.create(&web01()).unwrap();
    host.set_power_state("web01", VmState::Running);

    let mut desired = web01();
    desired.memory_size = 4096;
    let updated = controller.update(&previous, &desired).unwrap();

    assert_eq!(updated.spec.memory_size, 4096);
    assert_eq!(updated.power_state, VmState::Running);
    assert_eq!(updated.vm_id, previous.vm_id);
}

#[test]
fn test_sessions_released_after_every_operation() {
    let (host, controller) = setup();
    let state = controller.create(&web01()).unwrap();
    let mut desired = web01();
    desired.processor_count = 3;
    let state = controller.update(&state, &desired).unwrap();
    controller.refresh(&state).unwrap();
    let _ = controller.create(&web01());
    controller.delete("web01", Some(&state.vm_id)).unwrap();

    assert_eq!(host.open_sessions(), 0);
}

#[test]
fn test_concurrent_creates_of_different_vms() {
    let (host, controller) = setup();
    let names: Vec<String> = (0..8).map(|i| format!("worker{i}")).collect();

    std::thread::scope(|scope| {
        for name in &names {
            let controller = &controller;
            scope.spawn(move || {
                let spec = VirtualMachineSpec::builder(name.as_str())
                    .network_adapter(NetworkAdapterSpec::new("internal"))
                    .build()
                    .unwrap();
                controller.create(&spec).unwrap();
            });
        }
    });

    assert_eq!(host.vm_count(), names.len());
    for name in &names {
        let state = controller.read(name, None).unwrap().unwrap();
        assert_eq!(state.spec.network_adapters.len(), 1);
    }
    assert_eq!(host.open_sessions(), 0);
}
