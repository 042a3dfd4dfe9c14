//! Waiting on `Msvm_ConcreteJob` results.
//!
//! Management service methods return 0 when they finished synchronously
//! and 4096 when they started a job; the job is then polled until it
//! reaches a terminal state or the wait times out.

use std::time::{Duration, Instant};

use windows::Win32::System::Wmi::IWbemClassObject;

use super::{WbemClassObjectExt, WmiConnection};
use crate::error::{Error, FailureType, JobState, Result};

/// Default polling interval for job status.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default job timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

const RETURN_COMPLETED: u32 = 0;
const RETURN_JOB_STARTED: u32 = 4096;

/// Snapshot of a running job.
#[derive(Debug, Clone)]
pub struct JobProgress {
    pub state: JobState,
    pub percent_complete: u32,
    pub elapsed: Duration,
    pub error_code: Option<u32>,
    pub error_description: Option<String>,
}

/// Configuration for job waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobWaitConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for JobWaitConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOB_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl JobWaitConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Polls one job to completion.
pub struct JobWaiter<'a> {
    connection: &'a WmiConnection,
    config: JobWaitConfig,
}

impl<'a> JobWaiter<'a> {
    pub fn new(connection: &'a WmiConnection, config: JobWaitConfig) -> Self {
        Self { connection, config }
    }

    /// Block until the job at `job_path` finishes.
    ///
    /// Fails with `JobFailed` for a terminal failure state and
    /// `JobTimeout` once the configured timeout passes.
    pub fn wait_for_job(&self, job_path: &str, operation: &'static str) -> Result<JobProgress> {
        let start = Instant::now();
        loop {
            let progress = self.progress(job_path, start.elapsed())?;
            if progress.state.is_completed() {
                tracing::debug!(operation, elapsed_ms = progress.elapsed.as_millis() as u64, "Job completed");
                return Ok(progress);
            }
            if progress.state.is_failed() {
                return Err(Error::job_failed(
                    operation,
                    progress.error_code.unwrap_or(0),
                    progress
                        .error_description
                        .unwrap_or_else(|| "no error description".to_string()),
                    progress.state,
                ));
            }
            if progress.elapsed >= self.config.timeout {
                return Err(Error::job_timeout(
                    operation,
                    job_path,
                    self.config.timeout,
                    progress.state,
                    Some(progress.percent_complete),
                ));
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn progress(&self, job_path: &str, elapsed: Duration) -> Result<JobProgress> {
        let job = self.connection.get_object(job_path)?;
        let state = JobState::from(job.get_u16("JobState")?.unwrap_or(0));
        let (error_code, error_description) = if state.is_failed() {
            (job.get_u32("ErrorCode")?, job.get_string_prop("ErrorDescription")?)
        } else {
            (None, None)
        };
        Ok(JobProgress {
            state,
            percent_complete: job.get_u32("PercentComplete")?.unwrap_or(0),
            elapsed,
            error_code,
            error_description,
        })
    }
}

/// Failure class of a management service return code.
pub fn return_code_failure_type(code: u32) -> FailureType {
    match code {
        32769 => FailureType::AuthenticationFailed,
        32773 => FailureType::Configuration,
        32774 | 32775 => FailureType::ResourceBusy,
        32778 => FailureType::Permanent,
        _ => FailureType::Unknown,
    }
}

fn return_code_message(code: u32) -> &'static str {
    match code {
        32768 => "Failed",
        32769 => "Access denied",
        32770 => "Not supported",
        32771 => "Status is unknown",
        32772 => "Timeout",
        32773 => "Invalid parameter",
        32774 => "System is in use",
        32775 => "Invalid state for this operation",
        32776 => "Incorrect data type",
        32777 => "System is not available",
        32778 => "Out of memory",
        _ => "Unrecognized return value",
    }
}

/// Turn a method's `ReturnValue` into a result, waiting on a started job.
pub fn wait_for_method_result(
    connection: &WmiConnection,
    out_params: &IWbemClassObject,
    operation: &'static str,
    vm_name: &str,
    config: JobWaitConfig,
) -> Result<()> {
    match out_params.get_u32("ReturnValue")?.unwrap_or(RETURN_COMPLETED) {
        RETURN_COMPLETED => Ok(()),
        RETURN_JOB_STARTED => {
            let job_path = out_params.get_string_prop("Job")?.ok_or_else(|| {
                Error::host_api(operation, vm_name, RETURN_JOB_STARTED, "job path not returned")
            })?;
            JobWaiter::new(connection, config).wait_for_job(&job_path, operation)?;
            Ok(())
        }
        code => Err(Error::host_api_with_type(
            operation,
            vm_name,
            code,
            return_code_message(code),
            return_code_failure_type(code),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_wait_config() {
        let config = JobWaitConfig::default();
        assert_eq!(config.timeout, DEFAULT_JOB_TIMEOUT);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);

        let custom = JobWaitConfig::with_timeout(Duration::from_secs(60))
            .with_poll_interval(Duration::from_millis(50));
        assert_eq!(custom.timeout, Duration::from_secs(60));
        assert_eq!(custom.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_return_code_classification() {
        assert_eq!(return_code_failure_type(32774), FailureType::ResourceBusy);
        assert_eq!(return_code_failure_type(32769), FailureType::AuthenticationFailed);
        assert_eq!(return_code_failure_type(32773), FailureType::Configuration);
        assert_eq!(return_code_failure_type(32768), FailureType::Unknown);
        assert_eq!(return_code_message(32775), "Invalid state for this operation");
    }
}
