// Errors surfaced by the forking test class processor.

use testfork_common::LeaseError;

/// Abnormal termination of a worker process, as reported by
/// `WorkerProcess::wait_for_stop`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecError {
    pub message: String,
    /// Exit code, with signals mapped to `128 + signo`; `None` when the
    /// process could not be waited on at all.
    pub exit_code: Option<i32>,
}

impl ExecError {
    pub fn new(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Append guidance lines to the message, keeping the exit code.
    pub fn with_remediation(self, remediation: &str) -> Self {
        Self {
            message: format!("{}\n{}", self.message, remediation),
            exit_code: self.exit_code,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// `process_test_class` was called before `start_processing`.
    #[error("No result processor registered; call start_processing before submitting test classes")]
    NotStarted,

    /// No worker lease could be obtained.
    #[error("Could not acquire a worker lease: {0}")]
    Lease(#[from] LeaseError),

    /// The worker could not be started or did not complete the handshake.
    /// Nothing was leaked and the next submission retries the fork.
    #[error("Failed to launch {display_name}: {message}")]
    Launch { display_name: String, message: String },

    /// A test class could not be handed to the running worker.
    #[error("Failed to forward {test_class_name} to the worker: {message}")]
    Forward {
        test_class_name: String,
        message: String,
    },

    /// The worker exited abnormally during a graceful stop.
    #[error(transparent)]
    Execution(#[from] ExecError),
}

impl DispatchError {
    pub(crate) fn launch(display_name: &str, err: anyhow::Error) -> Self {
        DispatchError::Launch {
            display_name: display_name.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub fn is_launch_failure(&self) -> bool {
        matches!(self, DispatchError::Launch { .. })
    }
}
