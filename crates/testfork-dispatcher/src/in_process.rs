// In-process worker: runs the worker side of the protocol on a tokio task
// instead of a child process. Requests and events still pass through the
// configured serializers, so the wire encoding is exercised end to end.

use crate::connection::{
    dispatch_event, ObjectConnection, QueuedRemoteProcessor, RemoteTestClassProcessor,
    TestResultProcessor,
};
use crate::error::ExecError;
use crate::worker_process::{WorkerProcess, WorkerProcessBuilder, WorkerProcessFactory};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use testfork_common::{
    SerializerRegistry, TestClassRunInfo, TestEvent, TestResult, WorkerRequest,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit code reported for a worker terminated by `stop_now` (SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// Produces the events for one test class.
pub type TestClassHandler = Arc<dyn Fn(&TestClassRunInfo) -> Vec<TestEvent> + Send + Sync>;

/// Handler reporting every test class as passed.
pub fn passing_handler() -> TestClassHandler {
    Arc::new(|info: &TestClassRunInfo| {
        vec![
            TestEvent::Started {
                test_class_name: info.test_class_name.clone(),
                start_time: Utc::now(),
            },
            TestEvent::Completed {
                test_class_name: info.test_class_name.clone(),
                result: TestResult::Success,
                end_time: Utc::now(),
            },
        ]
    })
}

struct Shared {
    handler: TestClassHandler,
    builders: Mutex<Vec<WorkerProcessBuilder>>,
    requests: Mutex<Vec<WorkerRequest>>,
    start_failures: AtomicUsize,
    connect_failures: AtomicUsize,
    exit_code: AtomicI32,
    ignore_stop: AtomicBool,
    stall_drain: AtomicBool,
    kills: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Factory for in-process workers. Clones share the same recorded history and
/// fault injection knobs.
#[derive(Clone)]
pub struct InProcessWorkerFactory {
    shared: Arc<Shared>,
}

impl Default for InProcessWorkerFactory {
    fn default() -> Self {
        Self::with_handler(passing_handler())
    }
}

impl InProcessWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: TestClassHandler) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler,
                builders: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                start_failures: AtomicUsize::new(0),
                connect_failures: AtomicUsize::new(0),
                exit_code: AtomicI32::new(0),
                ignore_stop: AtomicBool::new(false),
                stall_drain: AtomicBool::new(false),
                kills: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `n` worker starts fail.
    pub fn fail_next_starts(&self, n: usize) {
        self.shared.start_failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` handshakes fail after the worker has started.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Exit code the worker reports after a graceful stop.
    pub fn set_exit_code(&self, code: i32) {
        self.shared.exit_code.store(code, Ordering::SeqCst);
    }

    /// When set, workers ignore `stop` and only exit when killed.
    pub fn set_ignore_stop(&self, ignore: bool) {
        self.shared.ignore_stop.store(ignore, Ordering::SeqCst);
    }

    /// When set, draining a connection never finishes, as if the worker
    /// kept its end of the channel open.
    pub fn set_stall_drain(&self, stall: bool) {
        self.shared.stall_drain.store(stall, Ordering::SeqCst);
    }

    /// Launch descriptions handed to `build`, one per fork.
    pub fn builders(&self) -> Vec<WorkerProcessBuilder> {
        self.shared.builders.lock().clone()
    }

    pub fn forks(&self) -> usize {
        self.shared.builders.lock().len()
    }

    /// Requests received by any worker, as decoded on the worker side.
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.shared.requests.lock().clone()
    }

    /// Test class names received, in arrival order.
    pub fn received_classes(&self) -> Vec<String> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                WorkerRequest::ProcessTestClass(info) => Some(info.test_class_name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of workers terminated by `stop_now` while still alive.
    pub fn kills(&self) -> usize {
        self.shared.kills.load(Ordering::SeqCst)
    }
}

impl WorkerProcessFactory for InProcessWorkerFactory {
    fn build(&self, builder: WorkerProcessBuilder) -> Result<Arc<dyn WorkerProcess>> {
        let display_name = {
            let mut builders = self.shared.builders.lock();
            builders.push(builder.clone());
            format!("{} {}", builder.base_name(), builders.len())
        };
        let (exit_tx, _) = watch::channel(None);
        Ok(Arc::new(InProcessWorkerProcess {
            display_name,
            shared: Arc::clone(&self.shared),
            started: AtomicBool::new(false),
            connection_taken: AtomicBool::new(false),
            exit: Arc::new(exit_tx),
            cancel: CancellationToken::new(),
        }))
    }
}

struct InProcessWorkerProcess {
    display_name: String,
    shared: Arc<Shared>,
    started: AtomicBool,
    connection_taken: AtomicBool,
    exit: Arc<watch::Sender<Option<i32>>>,
    cancel: CancellationToken,
}

fn record_exit(exit: &watch::Sender<Option<i32>>, code: i32) -> bool {
    exit.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(code);
            true
        } else {
            false
        }
    })
}

#[async_trait]
impl WorkerProcess for InProcessWorkerProcess {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn start(&self) -> Result<()> {
        if take_failure(&self.shared.start_failures) {
            anyhow::bail!("Simulated start failure for {}", self.display_name);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn connection(&self) -> Result<Box<dyn ObjectConnection>> {
        anyhow::ensure!(
            self.started.load(Ordering::SeqCst),
            "{} has not been started",
            self.display_name
        );
        anyhow::ensure!(
            !self.connection_taken.swap(true, Ordering::SeqCst),
            "Connection to {} already handed out",
            self.display_name
        );
        Ok(Box::new(InProcessConnection {
            shared: Arc::clone(&self.shared),
            exit: Arc::clone(&self.exit),
            cancel: self.cancel.clone(),
            serializers: SerializerRegistry::default(),
            incoming: None,
            outgoing: None,
            task: None,
        }))
    }

    async fn wait_for_stop(&self) -> Result<(), ExecError> {
        let mut rx = self.exit.subscribe();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(0),
            Err(_) => {
                return Err(ExecError::new(
                    format!("Lost track of {}", self.display_name),
                    None,
                ))
            }
        };
        if code == 0 {
            Ok(())
        } else {
            Err(ExecError::new(
                format!(
                    "Process '{}' finished with non-zero exit value {}",
                    self.display_name, code
                ),
                Some(code),
            ))
        }
    }

    fn stop_now(&self) {
        self.cancel.cancel();
        if record_exit(&self.exit, KILLED_EXIT_CODE) {
            self.shared.kills.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct InProcessConnection {
    shared: Arc<Shared>,
    exit: Arc<watch::Sender<Option<i32>>>,
    cancel: CancellationToken,
    serializers: SerializerRegistry,
    incoming: Option<Arc<dyn TestResultProcessor>>,
    outgoing: Option<mpsc::UnboundedReceiver<WorkerRequest>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ObjectConnection for InProcessConnection {
    fn use_parameter_serializers(&mut self, serializers: SerializerRegistry) {
        self.serializers = serializers;
    }

    fn add_incoming(&mut self, processor: Arc<dyn TestResultProcessor>) {
        self.incoming = Some(processor);
    }

    fn add_outgoing(&mut self) -> Result<Arc<dyn RemoteTestClassProcessor>> {
        anyhow::ensure!(self.outgoing.is_none(), "Outgoing proxy already created");
        let (tx, rx) = mpsc::unbounded_channel();
        self.outgoing = Some(rx);
        Ok(Arc::new(QueuedRemoteProcessor::new(tx)))
    }

    async fn connect(&mut self) -> Result<()> {
        if take_failure(&self.shared.connect_failures) {
            anyhow::bail!("Simulated handshake failure");
        }
        let requests = self
            .outgoing
            .take()
            .context("add_outgoing must be called before connect")?;
        let sink = self
            .incoming
            .clone()
            .context("add_incoming must be called before connect")?;

        self.task = Some(tokio::spawn(run_worker(
            requests,
            sink,
            self.serializers.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.exit),
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn stop(&mut self) {
        if self.shared.stall_drain.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_worker(
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    sink: Arc<dyn TestResultProcessor>,
    serializers: SerializerRegistry,
    shared: Arc<Shared>,
    exit: Arc<watch::Sender<Option<i32>>>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            request = requests.recv() => request,
        };
        let Some(request) = request else {
            // Dispatcher side went away without a stop.
            if shared.ignore_stop.load(Ordering::SeqCst) {
                cancel.cancelled().await;
            } else {
                record_exit(&exit, 1);
            }
            return;
        };

        let decoded = serializers
            .encode_request(&request)
            .and_then(|(ty, body)| serializers.decode_request(ty, &body));
        let request = match decoded {
            Ok(request) => request,
            Err(_) => {
                record_exit(&exit, 1);
                return;
            }
        };
        shared.requests.lock().push(request.clone());

        match request {
            WorkerRequest::StartProcessing => {}
            WorkerRequest::ProcessTestClass(info) => {
                for event in (shared.handler)(&info) {
                    let event = match serializers
                        .encode_event(&event)
                        .and_then(|(ty, body)| serializers.decode_event(ty, &body))
                    {
                        Ok(event) => event,
                        Err(_) => continue,
                    };
                    dispatch_event(sink.as_ref(), &event);
                }
            }
            WorkerRequest::Stop => {
                if shared.ignore_stop.load(Ordering::SeqCst) {
                    continue;
                }
                record_exit(&exit, shared.exit_code.load(Ordering::SeqCst));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use testfork_common::{OutputDestination, TestEventSerializer, TestFrameworkSpec};

    #[derive(Default)]
    struct Completed(Mutex<Vec<String>>);

    impl TestResultProcessor for Completed {
        fn started(&self, _: &str, _: DateTime<Utc>) {}
        fn output(&self, _: &str, _: OutputDestination, _: &str) {}
        fn failure(&self, _: &str, _: &str) {}
        fn completed(&self, name: &str, _: TestResult, _: DateTime<Utc>) {
            self.0.lock().push(name.to_string());
        }
    }

    async fn connected(
        factory: &InProcessWorkerFactory,
        sink: Arc<Completed>,
    ) -> (Arc<dyn WorkerProcess>, Box<dyn ObjectConnection>, Arc<dyn RemoteTestClassProcessor>) {
        let process = factory
            .build(factory.create(TestFrameworkSpec::new(["true"])))
            .unwrap();
        process.start().await.unwrap();
        let mut connection = process.connection().unwrap();
        connection.use_parameter_serializers(TestEventSerializer::create());
        connection.add_incoming(sink);
        let remote = connection.add_outgoing().unwrap();
        connection.connect().await.unwrap();
        (process, connection, remote)
    }

    #[tokio::test]
    async fn graceful_stop_reports_configured_exit_code() {
        let factory = InProcessWorkerFactory::new();
        factory.set_exit_code(3);
        let sink = Arc::new(Completed::default());
        let (process, mut connection, remote) = connected(&factory, Arc::clone(&sink)).await;

        remote.start_processing().unwrap();
        remote.process_test_class(TestClassRunInfo::new("A")).unwrap();
        remote.stop().unwrap();
        drop(remote);

        let err = process.wait_for_stop().await.unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        connection.stop().await;
        assert_eq!(*sink.0.lock(), vec!["A"]);
        assert_eq!(factory.kills(), 0);
    }

    #[tokio::test]
    async fn stop_now_kills_only_once() {
        let factory = InProcessWorkerFactory::new();
        factory.set_ignore_stop(true);
        let (process, mut connection, remote) =
            connected(&factory, Arc::new(Completed::default())).await;
        remote.stop().unwrap();

        process.stop_now();
        process.stop_now();
        let err = process.wait_for_stop().await.unwrap_err();
        assert_eq!(err.exit_code, Some(KILLED_EXIT_CODE));
        connection.stop().await;
        assert_eq!(factory.kills(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let factory = InProcessWorkerFactory::new();
        factory.fail_next_starts(1);
        let first = factory.build(factory.create(TestFrameworkSpec::default())).unwrap();
        assert!(first.start().await.is_err());
        assert!(first.connection().is_err());

        let second = factory.build(factory.create(TestFrameworkSpec::default())).unwrap();
        second.start().await.unwrap();
        assert!(second.connection().is_ok());
        assert!(second.connection().is_err());
        assert_eq!(factory.forks(), 2);
    }
}
