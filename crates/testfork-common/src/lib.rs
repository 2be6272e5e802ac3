// testfork-common: services shared by the dispatcher and the worker process.
// Depends on `testfork-sdk`.

pub mod config_store;
pub mod constants;
pub mod documentation;
pub mod fork_options;
pub mod host_context;
pub mod lease;
pub mod process_channel;
pub mod protocol;
pub mod terminal;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config_store::{ConfigurationStore, DispatcherSettings};
pub use constants::WellKnownConfigFile;
pub use documentation::DocumentationRegistry;
pub use fork_options::ForkOptions;
pub use host_context::{HostContext, ShutdownReason};
pub use lease::{LeaseCompletion, LeaseError, WorkerLease, WorkerLeaseRegistry};
pub use process_channel::{ChannelReader, ChannelWriter, MessageType, ProcessChannel, WorkerMessage};
pub use protocol::{
    OutputDestination, ParameterSerializer, SerializerRegistry, TestClassRunInfo, TestEvent,
    TestEventSerializer, TestFrameworkSpec, TestResult, WorkerRequest,
};
pub use terminal::{ConsoleColor, Terminal};
pub use self::tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
