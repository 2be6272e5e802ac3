// ForkingTestClassProcessor: hands test classes to a lazily forked worker and
// manages its lease and shutdown.

use crate::connection::{ObjectConnection, RemoteTestClassProcessor, TestResultProcessor};
use crate::error::DispatchError;
use crate::module_registry::ModuleRegistry;
use crate::worker_process::{WorkerProcess, WorkerProcessBuilder, WorkerProcessFactory};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testfork_common::constants::{self, variables};
use testfork_common::{
    DocumentationRegistry, ForkOptions, LeaseCompletion, TestClassRunInfo, TestEventSerializer,
    TestFrameworkSpec, TraceSetting, Tracing, WorkerLease,
};
use testfork_sdk::{ClassPath, TraceWriter};

const TEST_EXECUTION_PAGE: &str = "testing";
const TEST_EXECUTION_SECTION: &str = "sec:test_execution";

/// How long `stop` waits for the last events once the worker has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Caller hook applied to the launch description after the defaults.
pub type BuildConfigAction = Arc<dyn Fn(&mut WorkerProcessBuilder) + Send + Sync>;

/// Observable lifecycle state of a [`ForkingTestClassProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// No worker has been forked yet.
    Unstarted,
    /// A worker is connected and accepting test classes.
    Running,
    /// `stop` is waiting for the worker to exit.
    Draining,
    Stopped,
}

struct RunningWorker {
    process: Arc<dyn WorkerProcess>,
    connection: Box<dyn ObjectConnection>,
    remote: Arc<dyn RemoteTestClassProcessor>,
    completion: LeaseCompletion,
}

enum State {
    Unstarted,
    Running(RunningWorker),
    Draining(Arc<dyn WorkerProcess>),
    Stopped,
}

impl State {
    fn observe(&self) -> ProcessorState {
        match self {
            State::Unstarted => ProcessorState::Unstarted,
            State::Running(_) => ProcessorState::Running,
            State::Draining(_) => ProcessorState::Draining,
            State::Stopped => ProcessorState::Stopped,
        }
    }

    fn process(&self) -> Option<&Arc<dyn WorkerProcess>> {
        match self {
            State::Running(worker) => Some(&worker.process),
            State::Draining(process) => Some(process),
            State::Unstarted | State::Stopped => None,
        }
    }
}

/// Forwards test classes to a single worker process, forked on the first
/// submission.
///
/// The worker holds one child lease of `parent_lease` from the moment the fork
/// starts until [`stop`](Self::stop) returns. All methods take `&self`; share
/// the processor through an `Arc` to call `stop_now` from another task.
pub struct ForkingTestClassProcessor {
    parent_lease: Arc<WorkerLease>,
    worker_factory: Arc<dyn WorkerProcessFactory>,
    framework: TestFrameworkSpec,
    options: ForkOptions,
    class_path: ClassPath,
    build_config_action: Option<BuildConfigAction>,
    module_registry: Arc<dyn ModuleRegistry>,
    documentation: DocumentationRegistry,
    result_processor: Mutex<Option<Arc<dyn TestResultProcessor>>>,
    state: tokio::sync::Mutex<State>,
    /// Set by `stop_now`, only while `state` is locked. Never cleared.
    stopped_now: AtomicBool,
    trace: Arc<dyn TraceWriter>,
}

impl ForkingTestClassProcessor {
    pub fn new(
        parent_lease: Arc<WorkerLease>,
        worker_factory: Arc<dyn WorkerProcessFactory>,
        framework: TestFrameworkSpec,
        module_registry: Arc<dyn ModuleRegistry>,
        documentation: DocumentationRegistry,
    ) -> Self {
        Self {
            parent_lease,
            worker_factory,
            framework,
            options: ForkOptions::default(),
            class_path: ClassPath::new(),
            build_config_action: None,
            module_registry,
            documentation,
            result_processor: Mutex::new(None),
            state: tokio::sync::Mutex::new(State::Unstarted),
            stopped_now: AtomicBool::new(false),
            trace: Arc::new(Tracing::new("ForkingTestClassProcessor", TraceSetting::default())),
        }
    }

    /// Options copied into every launch description.
    pub fn with_fork_options(mut self, options: ForkOptions) -> Self {
        self.options = options;
        self
    }

    /// Application classpath handed to the worker.
    pub fn with_class_path(mut self, class_path: ClassPath) -> Self {
        self.class_path = class_path;
        self
    }

    pub fn with_build_config(mut self, action: BuildConfigAction) -> Self {
        self.build_config_action = Some(action);
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceWriter>) -> Self {
        self.trace = trace;
        self
    }

    /// Register the sink that receives result events from the worker.
    pub fn start_processing(&self, result_processor: Arc<dyn TestResultProcessor>) {
        *self.result_processor.lock() = Some(result_processor);
    }

    pub async fn state(&self) -> ProcessorState {
        self.state.lock().await.observe()
    }

    /// Whether `stop_now` has been called.
    pub fn is_stopped_now(&self) -> bool {
        self.stopped_now.load(Ordering::SeqCst)
    }

    /// Queue a test class on the worker, forking it first if needed.
    ///
    /// Returns once the class is queued, not when it has run. After `stop` or
    /// `stop_now` the class is silently dropped. A failed fork leaves the
    /// processor unstarted, so a later call tries again.
    pub async fn process_test_class(
        &self,
        test_class: TestClassRunInfo,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock().await;

        if self.stopped_now.load(Ordering::SeqCst) {
            self.trace.verbose(&format!(
                "Dropping {} because the worker was stopped",
                test_class.test_class_name
            ));
            return Ok(());
        }

        if matches!(*state, State::Unstarted) {
            let worker = self.fork_process().await?;
            *state = State::Running(worker);
        }

        match &*state {
            State::Running(worker) => {
                let test_class_name = test_class.test_class_name.clone();
                worker
                    .remote
                    .process_test_class(test_class)
                    .map_err(|e| DispatchError::Forward {
                        test_class_name,
                        message: format!("{e:#}"),
                    })
            }
            _ => {
                self.trace.verbose(&format!(
                    "Dropping {} because the processor is {:?}",
                    test_class.test_class_name,
                    state.observe()
                ));
                Ok(())
            }
        }
    }

    /// Ask the worker to finish its queued test classes and exit, then wait for
    /// it. The worker's lease is released as soon as the wait returns, before
    /// the remaining events are drained.
    ///
    /// An abnormal exit is reported as [`DispatchError::Execution`] unless
    /// `stop_now` was called, in which case it is expected and ignored.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let worker = {
            let mut state = self.state.lock().await;
            let worker = match std::mem::replace(&mut *state, State::Stopped) {
                State::Running(worker) => worker,
                other => {
                    *state = other;
                    return Ok(());
                }
            };
            if !self.stopped_now.load(Ordering::SeqCst) {
                if let Err(e) = worker.remote.stop() {
                    self.trace.warning(&format!(
                        "Could not send stop to {}: {e:#}",
                        worker.process.display_name()
                    ));
                }
            }
            *state = State::Draining(Arc::clone(&worker.process));
            worker
        };

        let RunningWorker {
            process,
            mut connection,
            remote,
            completion,
        } = worker;
        drop(remote);

        let result = process.wait_for_stop().await;
        completion.lease_finish();
        if tokio::time::timeout(DRAIN_TIMEOUT, connection.stop())
            .await
            .is_err()
        {
            self.trace.warning(&format!(
                "Gave up draining events from {} after {:?}",
                process.display_name(),
                DRAIN_TIMEOUT
            ));
        }
        *self.state.lock().await = State::Stopped;

        match result {
            Ok(()) => {
                self.trace
                    .info(&format!("{} finished", process.display_name()));
                Ok(())
            }
            Err(e) if self.stopped_now.load(Ordering::SeqCst) => {
                self.trace.verbose(&format!(
                    "Ignoring exit of {} after stop_now: {}",
                    process.display_name(),
                    e
                ));
                Ok(())
            }
            Err(e) => {
                self.trace.error(&e.message);
                Err(DispatchError::Execution(e.with_remediation(&self.remediation())))
            }
        }
    }

    /// Kill the worker, if any, without waiting for it. Any later submission
    /// is dropped. `stop` must still be called to release the lease.
    pub async fn stop_now(&self) {
        let state = self.state.lock().await;
        self.stopped_now.store(true, Ordering::SeqCst);
        if let Some(process) = state.process() {
            self.trace
                .info(&format!("Killing {}", process.display_name()));
            process.stop_now();
        }
    }

    /// The worker implementation classpath, flattened from the implementation
    /// modules in precedence order.
    pub fn worker_implementation_classpath(&self) -> anyhow::Result<ClassPath> {
        let mut class_path = ClassPath::new();
        for name in constants::WORKER_IMPLEMENTATION_MODULES {
            let module = self.module_registry.module(name)?;
            class_path.extend(module.implementation_classpath.entries().iter().cloned());
        }
        Ok(class_path)
    }

    async fn fork_process(&self) -> Result<RunningWorker, DispatchError> {
        let result_processor = self
            .result_processor
            .lock()
            .clone()
            .ok_or(DispatchError::NotStarted)?;

        let completion = self.parent_lease.start_child().await?;
        match self.launch(result_processor).await {
            Ok((process, connection, remote)) => {
                self.trace.info(&format!("Started {}", process.display_name()));
                Ok(RunningWorker {
                    process,
                    connection,
                    remote,
                    completion,
                })
            }
            Err(e) => {
                completion.lease_finish();
                self.trace.error(&e.to_string());
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        result_processor: Arc<dyn TestResultProcessor>,
    ) -> Result<
        (
            Arc<dyn WorkerProcess>,
            Box<dyn ObjectConnection>,
            Arc<dyn RemoteTestClassProcessor>,
        ),
        DispatchError,
    > {
        let builder = self
            .create_builder()
            .map_err(|e| DispatchError::launch(constants::DEFAULT_WORKER_BASE_NAME, e))?;
        let base_name = builder.base_name().to_string();

        let process = self
            .worker_factory
            .build(builder)
            .map_err(|e| DispatchError::launch(&base_name, e))?;
        process
            .start()
            .await
            .map_err(|e| DispatchError::launch(process.display_name(), e))?;

        match connect(process.as_ref(), result_processor).await {
            Ok((connection, remote)) => Ok((process, connection, remote)),
            Err(e) => {
                process.stop_now();
                Err(DispatchError::launch(process.display_name(), e))
            }
        }
    }

    fn create_builder(&self) -> anyhow::Result<WorkerProcessBuilder> {
        let mut builder = self.worker_factory.create(self.framework.clone());
        builder
            .set_base_name(constants::DEFAULT_WORKER_BASE_NAME)
            .set_implementation_classpath(self.worker_implementation_classpath()?)
            .add_application_classpath(self.class_path.entries().iter().cloned());
        self.options.copy_to(builder.fork_options_mut());
        builder
            .fork_options_mut()
            .env(variables::NATIVE_INTEGRATION, "false");
        if let Some(action) = &self.build_config_action {
            action(&mut builder);
        }
        Ok(builder)
    }

    fn remediation(&self) -> String {
        format!(
            "This problem might be caused by incorrect test process configuration.\n\
             Please refer to the test execution section in the user guide at {}",
            self.documentation
                .documentation_for(TEST_EXECUTION_PAGE, Some(TEST_EXECUTION_SECTION))
        )
    }
}

async fn connect(
    process: &dyn WorkerProcess,
    result_processor: Arc<dyn TestResultProcessor>,
) -> anyhow::Result<(Box<dyn ObjectConnection>, Arc<dyn RemoteTestClassProcessor>)> {
    let mut connection = process.connection()?;
    connection.use_parameter_serializers(TestEventSerializer::create());
    connection.add_incoming(result_processor);
    let remote = connection.add_outgoing()?;
    connection.connect().await?;
    remote.start_processing()?;
    Ok((connection, remote))
}
