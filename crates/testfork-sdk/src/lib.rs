// testfork-sdk: foundation layer shared by the dispatcher and the worker.
// Has no dependencies on other testfork crates.

pub mod build_constants;
pub mod class_path;
pub mod process_invoker;
pub mod string_util;
pub mod trace;
pub mod which_util;

pub use build_constants::{Source, WorkerPackage};
pub use class_path::ClassPath;
pub use process_invoker::{
    OutputStream, ProcessInvoker, ProcessOutcome, ProcessOutputLine, ProcessStartInfo,
};
pub use string_util::StringUtil;
pub use trace::TraceWriter;
pub use which_util::WhichUtil;
