//! Bounded power-state waits.
//!
//! Start and stop requests return as soon as the host accepts them; the
//! VM then moves through transitional states. Everything here polls
//! `power_state` against a deadline and never waits without bound.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::host::{HostSession, VmHandle};
use crate::vm::{ShutdownType, VmState};

/// Default time allowed for one power transition.
pub const DEFAULT_POWER_TIMEOUT: Duration = Duration::from_secs(120);

/// Default polling interval for power state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for power-state waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerWaitConfig {
    /// Maximum time to wait for each transition.
    pub timeout: Duration,
    /// Polling interval for power state.
    pub poll_interval: Duration,
}

impl Default for PowerWaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POWER_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PowerWaitConfig {
    /// Create a new configuration with specified timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Poll until `accept` holds or the timeout passes.
pub fn wait_for_state<S, F>(
    session: &mut S,
    vm: &VmHandle,
    target: &'static str,
    config: &PowerWaitConfig,
    accept: F,
) -> Result<VmState>
where
    S: HostSession + ?Sized,
    F: Fn(VmState) -> bool,
{
    let start = Instant::now();
    loop {
        let state = session.power_state(vm)?;
        if accept(state) {
            debug!(vm_name = %vm.name, %state, elapsed_ms = start.elapsed().as_millis() as u64, "Power state reached");
            return Ok(state);
        }
        if start.elapsed() >= config.timeout {
            return Err(Error::PowerTimeout {
                vm_name: vm.name.clone(),
                target,
                timeout: config.timeout,
                last_state: state,
            });
        }
        std::thread::sleep(config.poll_interval);
    }
}

/// Wait out any in-flight transition and return the settled state.
pub fn settle<S: HostSession + ?Sized>(
    session: &mut S,
    vm: &VmHandle,
    config: &PowerWaitConfig,
) -> Result<VmState> {
    wait_for_state(session, vm, "a steady state", config, |s| !s.is_transitional())
}

/// Start the VM unless it already runs, and wait until it does.
pub fn ensure_running<S: HostSession + ?Sized>(
    session: &mut S,
    vm: &VmHandle,
    config: &PowerWaitConfig,
) -> Result<()> {
    if settle(session, vm, config)? == VmState::Running {
        return Ok(());
    }
    info!(vm_name = %vm.name, "Starting VM");
    session.start_vm(vm)?;
    wait_for_state(session, vm, "Running", config, |s| s == VmState::Running)?;
    Ok(())
}

/// Stop the VM gracefully, escalating to a forced power off.
///
/// Escalation happens when the graceful request is rejected or the guest
/// does not power off within the timeout. Connection failures are not
/// escalated. Fails with `PowerTimeout` if even the forced stop does not
/// take effect.
pub fn ensure_stopped<S: HostSession + ?Sized>(
    session: &mut S,
    vm: &VmHandle,
    config: &PowerWaitConfig,
) -> Result<()> {
    if settle(session, vm, config)?.is_off() {
        return Ok(());
    }

    info!(vm_name = %vm.name, "Requesting graceful shutdown");
    let graceful = session
        .stop_vm(vm, ShutdownType::Graceful)
        .and_then(|()| wait_for_state(session, vm, "Off", config, |s| s.is_off()));
    match graceful {
        Ok(_) => return Ok(()),
        Err(e @ (Error::Connection { .. } | Error::VmNotFound(_))) => return Err(e),
        Err(e) => warn!(vm_name = %vm.name, error = %e, "Graceful shutdown failed, forcing power off"),
    }

    session.stop_vm(vm, ShutdownType::Force)?;
    wait_for_state(session, vm, "Off", config, |s| s.is_off())?;
    info!(vm_name = %vm.name, "VM powered off");
    Ok(())
}
