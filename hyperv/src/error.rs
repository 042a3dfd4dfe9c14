use core::fmt;
use std::time::Duration;

use crate::vm::VmState;

/// Classification of failure types for retry logic and error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Transient failure - operation may succeed if retried.
    Transient,
    /// Permanent failure - retrying will not help.
    Permanent,
    /// Resource busy - retry after delay.
    ResourceBusy,
    /// Authentication/authorization failure.
    AuthenticationFailed,
    /// Configuration error - fix the desired state and retry.
    Configuration,
    /// Network-related failure.
    Network,
    /// Unknown failure type.
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Transient => write!(f, "Transient"),
            FailureType::Permanent => write!(f, "Permanent"),
            FailureType::ResourceBusy => write!(f, "ResourceBusy"),
            FailureType::AuthenticationFailed => write!(f, "AuthenticationFailed"),
            FailureType::Configuration => write!(f, "Configuration"),
            FailureType::Network => write!(f, "Network"),
            FailureType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// WMI Job state values for async host operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum JobState {
    /// Job is queued.
    New = 2,
    /// Job is starting.
    Starting = 3,
    /// Job is running.
    Running = 4,
    /// Job is suspended.
    Suspended = 5,
    /// Job is shutting down.
    ShuttingDown = 6,
    /// Job completed successfully.
    Completed = 7,
    /// Job was terminated.
    Terminated = 8,
    /// Job was killed.
    Killed = 9,
    /// Job failed with exception.
    Exception = 10,
    /// Job is in service mode.
    Service = 11,
    /// Completed, but the host attached warnings.
    CompletedWithWarnings = 32768,
    /// Unknown state.
    Unknown = 0,
}

impl From<u16> for JobState {
    fn from(value: u16) -> Self {
        match value {
            2 => JobState::New,
            3 => JobState::Starting,
            4 => JobState::Running,
            5 => JobState::Suspended,
            6 => JobState::ShuttingDown,
            7 => JobState::Completed,
            8 => JobState::Terminated,
            9 => JobState::Killed,
            10 => JobState::Exception,
            11 => JobState::Service,
            32768 => JobState::CompletedWithWarnings,
            _ => JobState::Unknown,
        }
    }
}

impl JobState {
    /// Check if job completed successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, JobState::Completed | JobState::CompletedWithWarnings)
    }

    /// Check if job failed.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            JobState::Terminated | JobState::Killed | JobState::Exception | JobState::Service
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::New => write!(f, "New"),
            JobState::Starting => write!(f, "Starting"),
            JobState::Running => write!(f, "Running"),
            JobState::Suspended => write!(f, "Suspended"),
            JobState::ShuttingDown => write!(f, "ShuttingDown"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Terminated => write!(f, "Terminated"),
            JobState::Killed => write!(f, "Killed"),
            JobState::Exception => write!(f, "Exception"),
            JobState::Service => write!(f, "Service"),
            JobState::CompletedWithWarnings => write!(f, "CompletedWithWarnings"),
            JobState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Sub-resource an attachment error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    HardDrive,
    NetworkAdapter,
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentKind::HardDrive => write!(f, "hard drive"),
            AttachmentKind::NetworkAdapter => write!(f, "network adapter"),
        }
    }
}

/// Why an attach or detach was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentFailure {
    /// The disk image path does not exist on the host.
    ImageNotFound,
    /// The controller slot already holds a different disk image.
    SlotOccupied { existing_path: String },
    /// The named virtual switch does not exist on the host.
    SwitchNotFound,
    /// The host rejected the attach/detach call.
    Host {
        message: String,
        failure_type: FailureType,
    },
}

impl fmt::Display for AttachmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentFailure::ImageNotFound => write!(f, "disk image not found"),
            AttachmentFailure::SlotOccupied { existing_path } => {
                write!(f, "slot is occupied by '{}'", existing_path)
            }
            AttachmentFailure::SwitchNotFound => write!(f, "virtual switch not found"),
            AttachmentFailure::Host { message, .. } => write!(f, "{}", message),
        }
    }
}

/// Disk or network adapter attachment failure details.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Attaching {kind} '{target}' to VM '{vm_name}' failed: {failure}")]
pub struct AttachmentError {
    /// VM the attachment belongs to.
    pub vm_name: String,
    /// Disk or adapter.
    pub kind: AttachmentKind,
    /// Disk slot + path, or adapter name + switch.
    pub target: String,
    /// Reason for the failure.
    pub failure: AttachmentFailure,
}

impl AttachmentError {
    /// Tag a host failure with the attachment it happened on.
    ///
    /// Connection and lookup errors pass through unchanged.
    pub fn from_host(
        vm_name: impl Into<String>,
        kind: AttachmentKind,
        target: impl Into<String>,
        err: Error,
    ) -> Error {
        let failure = match err {
            Error::DiskImageNotFound(_) => AttachmentFailure::ImageNotFound,
            Error::SwitchNotFound(_) => AttachmentFailure::SwitchNotFound,
            e @ (Error::HostApi { .. }
            | Error::JobFailed { .. }
            | Error::JobTimeout { .. }
            | Error::WmiMethod { .. }
            | Error::InvalidState { .. }) => AttachmentFailure::Host {
                failure_type: e.failure_type(),
                message: e.to_string(),
            },
            other => return other,
        };
        Error::Attachment(AttachmentError {
            vm_name: vm_name.into(),
            kind,
            target: target.into(),
            failure,
        })
    }

    pub fn failure_type(&self) -> FailureType {
        match &self.failure {
            AttachmentFailure::ImageNotFound
            | AttachmentFailure::SlotOccupied { .. }
            | AttachmentFailure::SwitchNotFound => FailureType::Configuration,
            AttachmentFailure::Host { failure_type, .. } => *failure_type,
        }
    }
}

/// Step of a create at which a partially built VM was left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStage {
    /// Memory, processor or automatic action settings.
    Configure,
    AttachDisk,
    AttachAdapter,
    /// Powering on the configured VM.
    Start,
    /// Reading back the created VM.
    Observe,
}

impl fmt::Display for CreateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateStage::Configure => write!(f, "configure"),
            CreateStage::AttachDisk => write!(f, "attach disk"),
            CreateStage::AttachAdapter => write!(f, "attach network adapter"),
            CreateStage::Start => write!(f, "start"),
            CreateStage::Observe => write!(f, "observe"),
        }
    }
}

/// Step of the delete sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStage {
    Start,
    Stop,
    Destroy,
}

impl fmt::Display for DeleteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteStage::Start => write!(f, "start"),
            DeleteStage::Stop => write!(f, "stop"),
            DeleteStage::Destroy => write!(f, "destroy"),
        }
    }
}

fn percent_suffix(percent: &Option<u32>) -> String {
    percent
        .map(|pct| format!(" ({}% complete)", pct))
        .unwrap_or_default()
}

/// VM lifecycle errors with typed context.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Desired state rejected before any host mutation.
    #[error("Validation failed for '{field}': {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// Host management endpoint unreachable.
    #[error("Connection to host '{machine}' failed ({failure_type}): {message}")]
    Connection {
        machine: String,
        message: String,
        failure_type: FailureType,
    },

    /// Authentication failed for remote connection.
    #[error("Authentication failed for user '{username}' on '{machine}': {message}")]
    AuthenticationFailed {
        machine: String,
        username: String,
        message: String,
    },

    /// The host rejected an operation.
    #[error("Host operation '{operation}' on VM '{vm_name}' failed with code {return_value} ({failure_type}): {message}")]
    HostApi {
        operation: &'static str,
        vm_name: String,
        return_value: u32,
        message: String,
        failure_type: FailureType,
    },

    /// WMI query could not be executed.
    #[error("WMI query failed: {query} - {message} (HRESULT {hresult:#010x})")]
    WmiQuery {
        query: String,
        hresult: u32,
        message: String,
    },

    /// WMI method could not be invoked.
    #[error("WMI method {class}.{method} failed: {message} (HRESULT {hresult:#010x})")]
    WmiMethod {
        class: String,
        method: String,
        hresult: u32,
        message: String,
    },

    /// Job failed during async operation.
    #[error("Job failed for '{operation}' in state {job_state} (code {error_code}): {error_description}")]
    JobFailed {
        operation: &'static str,
        error_code: u32,
        error_description: String,
        job_state: JobState,
    },

    /// Job timed out waiting for completion.
    #[error("Job '{job_id}' for '{operation}' timed out after {timeout:?} in state {last_state}{}", percent_suffix(.percent_complete))]
    JobTimeout {
        operation: &'static str,
        job_id: String,
        timeout: Duration,
        last_state: JobState,
        percent_complete: Option<u32>,
    },

    /// Disk or adapter attach/detach failed.
    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    /// VM not found by name or ID.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// A VM with the requested name is already registered on the host.
    #[error("VM '{name}' already exists with id {vm_id}")]
    VmAlreadyExists { name: String, vm_id: String },

    /// Virtual switch not found.
    #[error("Virtual switch not found: {0}")]
    SwitchNotFound(String),

    /// Disk image file not found.
    #[error("Disk image not found: {0}")]
    DiskImageNotFound(String),

    /// Operation invalid for current VM state.
    #[error("Cannot {operation} VM '{vm_name}' in state {current}")]
    InvalidState {
        vm_name: String,
        current: VmState,
        operation: &'static str,
    },

    /// Property change needs the VM powered off.
    #[error("VM '{vm_name}' must be stopped to change {}", .properties.join(", "))]
    RequiresStop {
        vm_name: String,
        properties: Vec<&'static str>,
    },

    /// VM did not reach the requested power state in time.
    #[error("VM '{vm_name}' did not reach {target} within {timeout:?} (last state {last_state})")]
    PowerTimeout {
        vm_name: String,
        target: &'static str,
        timeout: Duration,
        last_state: VmState,
    },

    /// Stop/delete sequence failed; safe to retry.
    #[error("Delete of VM '{vm_name}' failed during {stage}: {source}")]
    Delete {
        vm_name: String,
        stage: DeleteStage,
        #[source]
        source: Box<Error>,
    },

    /// Create failed after the VM object was defined on the host.
    #[error("Create of VM '{vm_name}' ({vm_id}) failed during {stage}: {source}")]
    PartialCreate {
        vm_name: String,
        vm_id: String,
        stage: CreateStage,
        #[source]
        source: Box<Error>,
    },

    /// Required property missing from a host object.
    #[error("Required property missing: {0}")]
    MissingProperty(String),

    /// Failed to convert a host value to the expected type.
    #[error("Cannot convert property '{property}' to {expected}")]
    TypeConversion {
        property: String,
        expected: &'static str,
    },

    /// IO error (file operations, etc.).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the failure type classification for this error.
    pub fn failure_type(&self) -> FailureType {
        match self {
            Error::Validation { .. } => FailureType::Configuration,
            Error::Connection { failure_type, .. } => *failure_type,
            Error::AuthenticationFailed { .. } => FailureType::AuthenticationFailed,
            Error::HostApi { failure_type, .. } => *failure_type,
            Error::WmiQuery { .. } => FailureType::Transient,
            Error::WmiMethod { .. } => FailureType::Unknown,
            Error::JobFailed { .. } => FailureType::Unknown,
            Error::JobTimeout { .. } => FailureType::Transient,
            Error::Attachment(e) => e.failure_type(),
            Error::VmNotFound(_) => FailureType::Permanent,
            Error::VmAlreadyExists { .. } => FailureType::Configuration,
            Error::SwitchNotFound(_) => FailureType::Configuration,
            Error::DiskImageNotFound(_) => FailureType::Configuration,
            Error::InvalidState { .. } => FailureType::ResourceBusy,
            Error::RequiresStop { .. } => FailureType::Configuration,
            Error::PowerTimeout { .. } => FailureType::Transient,
            Error::Delete { .. } => FailureType::Transient,
            Error::PartialCreate { source, .. } => source.failure_type(),
            Error::MissingProperty(_) => FailureType::Permanent,
            Error::TypeConversion { .. } => FailureType::Permanent,
            Error::Io(_) => FailureType::Transient,
        }
    }

    /// Check if the error is transient and operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.failure_type(),
            FailureType::Transient | FailureType::ResourceBusy | FailureType::Network
        )
    }

    /// Whether the caller may re-issue the same operation unchanged.
    ///
    /// Connection and delete failures are always retryable. A partial
    /// create never is: re-issuing the create would define a second VM.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::Delete { .. } => true,
            Error::PartialCreate { .. } => false,
            _ => self.is_transient(),
        }
    }

    /// Whether this is the normal "resource absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::VmNotFound(_))
    }

    /// The vmId of a VM left behind by a failed create.
    pub fn partial_vm_id(&self) -> Option<&str> {
        match self {
            Error::PartialCreate { vm_id, .. } => Some(vm_id),
            _ => None,
        }
    }

    /// Create a validation error.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    /// Create a host API error with unknown failure type.
    pub fn host_api(
        operation: &'static str,
        vm_name: impl Into<String>,
        return_value: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::host_api_with_type(operation, vm_name, return_value, message, FailureType::Unknown)
    }

    /// Create a host API error with specific failure type.
    pub fn host_api_with_type(
        operation: &'static str,
        vm_name: impl Into<String>,
        return_value: u32,
        message: impl Into<String>,
        failure_type: FailureType,
    ) -> Self {
        Error::HostApi {
            operation,
            vm_name: vm_name.into(),
            return_value,
            message: message.into(),
            failure_type,
        }
    }

    /// Create a job failed error.
    pub fn job_failed(
        operation: &'static str,
        error_code: u32,
        error_description: impl Into<String>,
        job_state: JobState,
    ) -> Self {
        Error::JobFailed {
            operation,
            error_code,
            error_description: error_description.into(),
            job_state,
        }
    }

    /// Create a job timeout error.
    pub fn job_timeout(
        operation: &'static str,
        job_id: impl Into<String>,
        timeout: Duration,
        last_state: JobState,
        percent_complete: Option<u32>,
    ) -> Self {
        Error::JobTimeout {
            operation,
            job_id: job_id.into(),
            timeout,
            last_state,
            percent_complete,
        }
    }

    /// Wrap a failure that happened after the VM object was defined.
    pub fn partial_create(
        vm_name: impl Into<String>,
        vm_id: impl Into<String>,
        stage: CreateStage,
        source: Error,
    ) -> Self {
        match source {
            // Already tagged by the host layer.
            Error::PartialCreate { .. } => source,
            source => Error::PartialCreate {
                vm_name: vm_name.into(),
                vm_id: vm_id.into(),
                stage,
                source: Box::new(source),
            },
        }
    }

    /// Wrap a failure of the stop/delete sequence.
    pub fn delete(vm_name: impl Into<String>, stage: DeleteStage, source: Error) -> Self {
        Error::Delete {
            vm_name: vm_name.into(),
            stage,
            source: Box::new(source),
        }
    }
}

/// Result type for VM lifecycle operations.
pub type Result<T> = core::result::Result<T, Error>;
