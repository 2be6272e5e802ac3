// testfork-dispatcher: hands test classes to forked worker processes.
// Depends on `testfork-sdk` and `testfork-common`.
//
// Architecture:
//   main → TestRunDriver → ForkingTestClassProcessor (one per worker)
//     → WorkerProcessFactory (child_process | in_process) → ObjectConnection
//     → worker; result events flow back to a TestResultProcessor.

pub mod child_process;
pub mod connection;
pub mod driver;
pub mod error;
pub mod forking_processor;
pub mod in_process;
pub mod module_registry;
pub mod result_collector;
pub mod socket_connection;
pub mod worker_process;

pub use connection::{ObjectConnection, RemoteTestClassProcessor, TestResultProcessor};
pub use error::{DispatchError, ExecError};
pub use forking_processor::{BuildConfigAction, ForkingTestClassProcessor, ProcessorState};
pub use worker_process::{WorkerProcess, WorkerProcessBuilder, WorkerProcessFactory};
