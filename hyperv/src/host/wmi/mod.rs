//! Hyper-V WMI host (`root\virtualization\v2`).
//!
//! [`WmiConnector`] opens one [`WmiConnection`] per session. Mutating calls
//! go through `Msvm_VirtualSystemManagementService`; asynchronous results
//! are awaited with [`JobWaiter`] under a bounded timeout.

mod connection;
mod job;
mod session;
mod variant;

pub use connection::{
    ConnectionConfig, Credentials, WbemClassObjectExt, WmiConnection, DEFAULT_TIMEOUT,
    HYPERV_NAMESPACE,
};
pub use job::{wait_for_method_result, JobProgress, JobWaitConfig, JobWaiter};
pub use session::{WmiConnector, WmiSession};
pub use variant::FromVariant;
