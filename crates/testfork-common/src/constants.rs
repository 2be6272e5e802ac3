// Constants shared by the dispatcher and the worker process.
// Environment variable names, worker arguments, and defaults live here so
// both sides of the channel agree on them.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Well-known configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownConfigFile {
    /// Dispatcher settings (`.testfork.json`).
    Settings,
}

impl fmt::Display for WellKnownConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl WellKnownConfigFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            WellKnownConfigFile::Settings => ".testfork.json",
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default base name for forked worker processes.
pub const DEFAULT_WORKER_BASE_NAME: &str = "Test Executor";

/// Name of the worker executable looked up next to the dispatcher binary.
pub const WORKER_BINARY_NAME: &str = "testfork-worker";

/// Default number of worker processes that may run at once.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// How long `connect()` waits for a forked worker to dial back.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Base URL of the user guide used in remediation messages.
pub const DEFAULT_DOCUMENTATION_URL: &str = "https://docs.testfork.dev/userguide/";

/// Modules whose implementation classpath every worker receives, in
/// precedence order.
pub const WORKER_IMPLEMENTATION_MODULES: &[&str] = &[
    "testfork-core",
    "testfork-logging",
    "testfork-messaging",
    "testfork-process-services",
    "testfork-worker",
];

// ---------------------------------------------------------------------------
// Worker command line
// ---------------------------------------------------------------------------

pub mod worker_args {
    /// Path of the socket the worker must connect to.
    pub const CHANNEL: &str = "channel";
    /// Display name of the worker process.
    pub const NAME: &str = "name";
}

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

pub mod variables {
    /// JSON-encoded worker entry (test framework spec).
    pub const WORKER_ENTRY: &str = "TESTFORK_WORKER_ENTRY";
    /// Search-path encoded implementation classpath.
    pub const IMPLEMENTATION_CLASSPATH: &str = "TESTFORK_IMPLEMENTATION_CLASSPATH";
    /// Search-path encoded application classpath.
    pub const APPLICATION_CLASSPATH: &str = "TESTFORK_CLASSPATH";
    /// Set to `false` in workers to disable native integrations.
    pub const NATIVE_INTEGRATION: &str = "TESTFORK_NATIVE";

    /// Overrides `DispatcherSettings::max_workers`.
    pub const MAX_WORKERS: &str = "TESTFORK_MAX_WORKERS";
    /// Overrides `DispatcherSettings::worker_executable`.
    pub const WORKER_PATH: &str = "TESTFORK_WORKER_PATH";
    /// Overrides `DispatcherSettings::documentation_url`.
    pub const DOCS_URL: &str = "TESTFORK_DOCS_URL";
    /// Echo trace lines to stdout in addition to the `tracing` subscriber.
    pub const PRINT_LOG_TO_STDOUT: &str = "TESTFORK_PRINT_LOG_TO_STDOUT";
}

// ---------------------------------------------------------------------------
// Process return codes
// ---------------------------------------------------------------------------

pub mod return_code {
    pub const SUCCESS: i32 = 0;
    /// At least one test class failed.
    pub const TESTS_FAILED: i32 = 1;
    /// The worker lost its channel or could not start.
    pub const WORKER_ERROR: i32 = 2;
    /// Dispatcher aborted (launch failure, abnormal worker exit, Ctrl-C).
    pub const TERMINATED_ERROR: i32 = 3;
}
