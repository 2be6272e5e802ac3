// Typed remote-call surface between the dispatcher and a worker: the outgoing
// test class processor proxy, the incoming result processor, and the
// connection that wires them together.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use testfork_common::{
    OutputDestination, SerializerRegistry, TestClassRunInfo, TestEvent, TestResult, WorkerRequest,
};
use tokio::sync::mpsc;

/// Consumer of result events pushed by the worker.
pub trait TestResultProcessor: Send + Sync {
    fn started(&self, test_class_name: &str, start_time: DateTime<Utc>);

    fn output(&self, test_class_name: &str, destination: OutputDestination, message: &str);

    fn failure(&self, test_class_name: &str, message: &str);

    fn completed(&self, test_class_name: &str, result: TestResult, end_time: DateTime<Utc>);
}

/// Route a decoded event to the matching processor method.
pub fn dispatch_event(processor: &dyn TestResultProcessor, event: &TestEvent) {
    match event {
        TestEvent::Started {
            test_class_name,
            start_time,
        } => processor.started(test_class_name, *start_time),
        TestEvent::Output {
            test_class_name,
            destination,
            message,
        } => processor.output(test_class_name, *destination, message),
        TestEvent::Failure {
            test_class_name,
            message,
        } => processor.failure(test_class_name, message),
        TestEvent::Completed {
            test_class_name,
            result,
            end_time,
        } => processor.completed(test_class_name, *result, *end_time),
    }
}

/// The worker-side test class processor, as seen through an outgoing proxy.
///
/// Calls are queued in order and return once queued; they never wait for
/// the worker to act on them.
pub trait RemoteTestClassProcessor: Send + Sync {
    fn start_processing(&self) -> Result<()>;

    fn process_test_class(&self, test_class: TestClassRunInfo) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

/// A bidirectional connection to one worker.
///
/// Set-up order: serializers, incoming handler, outgoing proxy, then
/// [`connect`](Self::connect).
#[async_trait]
pub trait ObjectConnection: Send {
    fn use_parameter_serializers(&mut self, serializers: SerializerRegistry);

    fn add_incoming(&mut self, processor: Arc<dyn TestResultProcessor>);

    /// Create the outgoing proxy. Calls made before `connect` are buffered.
    fn add_outgoing(&mut self) -> Result<Arc<dyn RemoteTestClassProcessor>>;

    /// Complete the handshake with the worker.
    async fn connect(&mut self) -> Result<()>;

    /// Wait until the outgoing queue is flushed and every incoming event has
    /// been dispatched. Returns once the worker side has closed.
    async fn stop(&mut self);
}

/// Outgoing proxy that queues requests onto an unbounded channel drained by
/// the connection's writer.
#[derive(Debug, Clone)]
pub struct QueuedRemoteProcessor {
    tx: mpsc::UnboundedSender<WorkerRequest>,
}

impl QueuedRemoteProcessor {
    pub fn new(tx: mpsc::UnboundedSender<WorkerRequest>) -> Self {
        Self { tx }
    }

    fn send(&self, request: WorkerRequest) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|e| {
                anyhow::anyhow!(
                    "Connection to worker is closed; dropped {:?}",
                    e.0.message_type()
                )
            })
    }
}

impl RemoteTestClassProcessor for QueuedRemoteProcessor {
    fn start_processing(&self) -> Result<()> {
        self.send(WorkerRequest::StartProcessing)
    }

    fn process_test_class(&self, test_class: TestClassRunInfo) -> Result<()> {
        self.send(WorkerRequest::ProcessTestClass(test_class))
    }

    fn stop(&self) -> Result<()> {
        self.send(WorkerRequest::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl TestResultProcessor for Recorder {
        fn started(&self, name: &str, _: DateTime<Utc>) {
            self.0.lock().push(format!("started {name}"));
        }
        fn output(&self, name: &str, destination: OutputDestination, message: &str) {
            self.0.lock().push(format!("{destination:?} {name} {message}"));
        }
        fn failure(&self, name: &str, message: &str) {
            self.0.lock().push(format!("failure {name} {message}"));
        }
        fn completed(&self, name: &str, result: TestResult, _: DateTime<Utc>) {
            self.0.lock().push(format!("completed {name} {result}"));
        }
    }

    #[test]
    fn dispatch_event_calls_matching_method() {
        let recorder = Recorder::default();
        let now = Utc::now();
        dispatch_event(
            &recorder,
            &TestEvent::Started {
                test_class_name: "A".into(),
                start_time: now,
            },
        );
        dispatch_event(
            &recorder,
            &TestEvent::Output {
                test_class_name: "A".into(),
                destination: OutputDestination::StdErr,
                message: "warn".into(),
            },
        );
        dispatch_event(
            &recorder,
            &TestEvent::Completed {
                test_class_name: "A".into(),
                result: TestResult::Success,
                end_time: now,
            },
        );
        assert_eq!(
            *recorder.0.lock(),
            vec!["started A", "StdErr A warn", "completed A SUCCESS"]
        );
    }

    #[test]
    fn queued_proxy_preserves_call_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let proxy = QueuedRemoteProcessor::new(tx);
        proxy.start_processing().unwrap();
        proxy
            .process_test_class(TestClassRunInfo::new("A"))
            .unwrap();
        proxy.stop().unwrap();

        assert_eq!(rx.try_recv().unwrap(), WorkerRequest::StartProcessing);
        assert_eq!(
            rx.try_recv().unwrap(),
            WorkerRequest::ProcessTestClass(TestClassRunInfo::new("A"))
        );
        assert_eq!(rx.try_recv().unwrap(), WorkerRequest::Stop);
    }

    #[test]
    fn queued_proxy_fails_once_connection_closes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let proxy = QueuedRemoteProcessor::new(tx);
        drop(rx);
        let err = proxy.stop().unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
