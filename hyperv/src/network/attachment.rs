use tracing::{debug, info};

use crate::error::{AttachmentError, AttachmentFailure, AttachmentKind, Error, Result};
use crate::host::{HostSession, VmHandle};
use crate::network::NetworkAdapterSpec;

/// Adds and removes network adapters bound to virtual switches.
pub struct NetworkAttachmentManager<'s, S: HostSession + ?Sized> {
    session: &'s mut S,
}

impl<'s, S: HostSession + ?Sized> NetworkAttachmentManager<'s, S> {
    pub fn new(session: &'s mut S) -> Self {
        Self { session }
    }

    /// Adapters attached right now, in host order.
    pub fn list_attached(&mut self, vm: &VmHandle) -> Result<Vec<NetworkAdapterSpec>> {
        self.session.list_network_adapters(vm)
    }

    /// Add an adapter connected to `adapter.switch_name`.
    ///
    /// Fails with an [`AttachmentError`] when the switch does not exist.
    pub fn attach(&mut self, vm: &VmHandle, adapter: &NetworkAdapterSpec) -> Result<()> {
        if !self.session.switch_exists(&adapter.switch_name)? {
            return Err(Error::Attachment(AttachmentError {
                vm_name: vm.name.clone(),
                kind: AttachmentKind::NetworkAdapter,
                target: adapter.to_string(),
                failure: AttachmentFailure::SwitchNotFound,
            }));
        }

        self.session.add_network_adapter(vm, adapter).map_err(|e| {
            AttachmentError::from_host(&vm.name, AttachmentKind::NetworkAdapter, adapter.to_string(), e)
        })?;
        info!(vm_name = %vm.name, adapter = %adapter.name, switch = %adapter.switch_name, "Network adapter attached");
        Ok(())
    }

    /// Remove a matching adapter if one is attached; otherwise do nothing.
    pub fn detach(&mut self, vm: &VmHandle, adapter: &NetworkAdapterSpec) -> Result<()> {
        let attached = self.session.list_network_adapters(vm)?;
        if !attached.contains(adapter) {
            debug!(vm_name = %vm.name, adapter = %adapter, "Network adapter already detached");
            return Ok(());
        }

        self.session.remove_network_adapter(vm, adapter).map_err(|e| {
            AttachmentError::from_host(&vm.name, AttachmentKind::NetworkAdapter, adapter.to_string(), e)
        })?;
        info!(vm_name = %vm.name, adapter = %adapter.name, switch = %adapter.switch_name, "Network adapter detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostConnector, HostEvent, MemoryHost};
    use crate::vm::VirtualMachineSpec;

    fn setup() -> (MemoryHost, VmHandle) {
        let host = MemoryHost::default();
        host.add_switch("external").add_switch("internal");
        let mut session = host.connect().unwrap();
        let vm = session.create_vm(&VirtualMachineSpec::new("vm1")).unwrap();
        (host, vm)
    }

    #[test]
    fn test_attach_to_missing_switch_fails() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut nics = NetworkAttachmentManager::new(&mut session);
        let err = nics
            .attach(&vm, &NetworkAdapterSpec::new("does-not-exist"))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Attachment(AttachmentError {
                kind: AttachmentKind::NetworkAdapter,
                failure: AttachmentFailure::SwitchNotFound,
                ..
            })
        ));
        assert!(!err.is_retryable());
        assert!(nics.list_attached(&vm).unwrap().is_empty());
    }

    #[test]
    fn test_attach_then_detach() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut nics = NetworkAttachmentManager::new(&mut session);
        let adapter = NetworkAdapterSpec::new("external").named("frontend");

        nics.attach(&vm, &adapter).unwrap();
        assert_eq!(nics.list_attached(&vm).unwrap(), vec![adapter.clone()]);

        nics.detach(&vm, &adapter).unwrap();
        assert!(nics.list_attached(&vm).unwrap().is_empty());
    }

    #[test]
    fn test_detach_absent_adapter_is_noop() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut nics = NetworkAttachmentManager::new(&mut session);
        nics.attach(&vm, &NetworkAdapterSpec::new("external")).unwrap();
        host.clear_events();

        nics.detach(&vm, &NetworkAdapterSpec::new("internal")).unwrap();
        assert!(!host
            .events()
            .iter()
            .any(|e| matches!(e, HostEvent::AdapterRemoved { .. })));
        assert_eq!(nics.list_attached(&vm).unwrap().len(), 1);
    }

    #[test]
    fn test_detach_removes_one_of_two_identical_switches() {
        let (host, vm) = setup();
        let mut session = host.connect().unwrap();
        let mut nics = NetworkAttachmentManager::new(&mut session);
        let a = NetworkAdapterSpec::new("external").named("a");
        let b = NetworkAdapterSpec::new("external").named("b");
        nics.attach(&vm, &a).unwrap();
        nics.attach(&vm, &b).unwrap();

        nics.detach(&vm, &a).unwrap();
        assert_eq!(nics.list_attached(&vm).unwrap(), vec![b]);
    }
}
