// Abstractions over a forked worker: the launch description handed to a
// factory, and the handle the dispatcher drives once it is built.

use crate::connection::ObjectConnection;
use crate::error::ExecError;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use testfork_common::{ForkOptions, TestFrameworkSpec};
use testfork_sdk::ClassPath;

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerProcessBuilder {
    entry: TestFrameworkSpec,
    base_name: String,
    implementation_classpath: ClassPath,
    application_classpath: ClassPath,
    fork_options: ForkOptions,
}

impl WorkerProcessBuilder {
    pub fn new(entry: TestFrameworkSpec) -> Self {
        Self {
            entry,
            base_name: String::new(),
            implementation_classpath: ClassPath::new(),
            application_classpath: ClassPath::new(),
            fork_options: ForkOptions::default(),
        }
    }

    /// The test framework entry the worker runs.
    pub fn entry(&self) -> &TestFrameworkSpec {
        &self.entry
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn set_base_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.base_name = name.into();
        self
    }

    pub fn implementation_classpath(&self) -> &ClassPath {
        &self.implementation_classpath
    }

    pub fn set_implementation_classpath(&mut self, classpath: ClassPath) -> &mut Self {
        self.implementation_classpath = classpath;
        self
    }

    pub fn application_classpath(&self) -> &ClassPath {
        &self.application_classpath
    }

    /// Append entries to the application classpath.
    pub fn add_application_classpath<P: Into<std::path::PathBuf>>(
        &mut self,
        entries: impl IntoIterator<Item = P>,
    ) -> &mut Self {
        self.application_classpath.extend(entries);
        self
    }

    pub fn fork_options(&self) -> &ForkOptions {
        &self.fork_options
    }

    pub fn fork_options_mut(&mut self) -> &mut ForkOptions {
        &mut self.fork_options
    }
}

/// A built, possibly running, worker.
///
/// All methods take `&self` so one handle can be shared between the task
/// waiting for the worker to exit and the task killing it.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// Name used in logs and failure messages.
    fn display_name(&self) -> &str;

    /// Launch the worker. Fails if it cannot be started.
    async fn start(&self) -> Result<()>;

    /// Hand out the connection to the worker. Only available once, after
    /// [`start`](Self::start) succeeded.
    fn connection(&self) -> Result<Box<dyn ObjectConnection>>;

    /// Wait for the worker to exit. Returns an error when it ended abnormally.
    async fn wait_for_stop(&self) -> Result<(), ExecError>;

    /// Terminate the worker without waiting for it to cooperate. Safe to call
    /// at any time, including more than once or after it has exited.
    fn stop_now(&self);
}

/// Creates launch descriptions and turns them into worker handles.
pub trait WorkerProcessFactory: Send + Sync {
    fn create(&self, entry: TestFrameworkSpec) -> WorkerProcessBuilder {
        WorkerProcessBuilder::new(entry)
    }

    fn build(&self, builder: WorkerProcessBuilder) -> Result<Arc<dyn WorkerProcess>>;
}
