// ObjectConnection over a ProcessChannel: one task writes queued requests,
// another reads result events and hands them to the incoming processor.

use crate::connection::{
    dispatch_event, ObjectConnection, QueuedRemoteProcessor, RemoteTestClassProcessor,
    TestResultProcessor,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use testfork_common::{
    ChannelReader, ChannelWriter, ProcessChannel, SerializerRegistry, WorkerRequest,
};
use testfork_sdk::TraceWriter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection to a worker that dials back into a bound [`ProcessChannel`].
pub struct SocketObjectConnection {
    display_name: String,
    channel: Option<ProcessChannel>,
    connect_timeout: Duration,
    serializers: SerializerRegistry,
    incoming: Option<Arc<dyn TestResultProcessor>>,
    outgoing: Option<mpsc::UnboundedReceiver<WorkerRequest>>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    trace: Arc<dyn TraceWriter>,
}

impl SocketObjectConnection {
    /// `channel` must already be bound with `start_server`.
    pub fn new(
        display_name: impl Into<String>,
        channel: ProcessChannel,
        connect_timeout: Duration,
        trace: Arc<dyn TraceWriter>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            channel: Some(channel),
            connect_timeout,
            serializers: SerializerRegistry::default(),
            incoming: None,
            outgoing: None,
            writer_task: None,
            reader_task: None,
            trace,
        }
    }
}

#[async_trait]
impl ObjectConnection for SocketObjectConnection {
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
        let requests = self
            .outgoing
            .take()
            .context("add_outgoing must be called before connect")?;
        let sink = self
            .incoming
            .clone()
            .context("add_incoming must be called before connect")?;
        let mut channel = self
            .channel
            .take()
            .context("Connection has already been used")?;

        self.trace
            .verbose(&format!("Waiting for {} to connect", self.display_name));
        channel
            .accept(self.connect_timeout)
            .await
            .with_context(|| format!("{} did not connect back", self.display_name))?;
        let (reader, writer) = channel.into_split()?;
        self.trace
            .verbose(&format!("{} connected", self.display_name));

        self.writer_task = Some(tokio::spawn(write_requests(
            writer,
            requests,
            self.serializers.clone(),
            Arc::clone(&self.trace),
        )));
        self.reader_task = Some(tokio::spawn(read_events(
            reader,
            sink,
            self.serializers.clone(),
            Arc::clone(&self.trace),
        )));
        Ok(())
    }

    async fn stop(&mut self) {
        // The writer ends once every proxy is dropped; the reader at end of
        // stream, which the worker signals by exiting.
        for task in [self.writer_task.take(), self.reader_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                self.trace
                    .warning(&format!("Connection task for {} failed: {e}", self.display_name));
            }
        }
    }
}

async fn write_requests(
    mut writer: ChannelWriter,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    serializers: SerializerRegistry,
    trace: Arc<dyn TraceWriter>,
) {
    while let Some(request) = requests.recv().await {
        let (message_type, body) = match serializers.encode_request(&request) {
            Ok(frame) => frame,
            Err(e) => {
                trace.error(&format!("Failed to encode {:?}: {e:#}", request.message_type()));
                continue;
            }
        };
        if let Err(e) = writer.send_async(message_type, &body).await {
            trace.warning(&format!("Failed to send {message_type} to worker: {e:#}"));
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace.verbose(&format!("{e:#}"));
    }
}

async fn read_events(
    mut reader: ChannelReader,
    sink: Arc<dyn TestResultProcessor>,
    serializers: SerializerRegistry,
    trace: Arc<dyn TraceWriter>,
) {
    loop {
        match reader.receive_async().await {
            Ok(Some(message)) => {
                match serializers.decode_event(message.message_type, &message.body) {
                    Ok(event) => dispatch_event(sink.as_ref(), &event),
                    Err(e) => trace.warning(&format!("Dropping malformed event: {e:#}")),
                }
            }
            Ok(None) => return,
            Err(e) => {
                trace.warning(&format!("Lost connection to worker: {e:#}"));
                return;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use testfork_common::{
        MessageType, OutputDestination, TestClassRunInfo, TestEvent, TestEventSerializer,
        TestResult,
    };
    use testfork_sdk::trace::NullTraceWriter;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl TestResultProcessor for Events {
        fn started(&self, name: &str, _: DateTime<Utc>) {
            self.0.lock().push(format!("started {name}"));
        }
        fn output(&self, name: &str, _: OutputDestination, message: &str) {
            self.0.lock().push(format!("output {name} {message}"));
        }
        fn failure(&self, name: &str, message: &str) {
            self.0.lock().push(format!("failure {name} {message}"));
        }
        fn completed(&self, name: &str, result: TestResult, _: DateTime<Utc>) {
            self.0.lock().push(format!("completed {name} {result}"));
        }
    }

    /// Minimal worker: answers each test class with an output line and a
    /// completion, exits on stop.
    async fn fake_worker(socket_path: std::path::PathBuf) -> Vec<MessageType> {
        let serializers = TestEventSerializer::create();
        let mut channel = ProcessChannel::new();
        channel.start_client(&socket_path).await.unwrap();
        let mut received = Vec::new();
        while let Some(message) = channel.receive_async().await.unwrap() {
            received.push(message.message_type);
            match serializers.decode_request(message.message_type, &message.body).unwrap() {
                WorkerRequest::StartProcessing => {}
                WorkerRequest::ProcessTestClass(info) => {
                    for event in [
                        TestEvent::Output {
                            test_class_name: info.test_class_name.clone(),
                            destination: OutputDestination::StdOut,
                            message: "running".into(),
                        },
                        TestEvent::Completed {
                            test_class_name: info.test_class_name.clone(),
                            result: TestResult::Success,
                            end_time: Utc::now(),
                        },
                    ] {
                        let (ty, body) = serializers.encode_event(&event).unwrap();
                        channel.send_async(ty, &body).await.unwrap();
                    }
                }
                WorkerRequest::Stop => break,
            }
        }
        received
    }

    #[tokio::test]
    async fn requests_flow_out_and_events_flow_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = ProcessChannel::new();
        let socket_path = channel.start_server(dir.path()).unwrap();
        let worker = tokio::spawn(fake_worker(socket_path));

        let events = Arc::new(Events::default());
        let mut connection = SocketObjectConnection::new(
            "Test Executor 1",
            channel,
            Duration::from_secs(5),
            Arc::new(NullTraceWriter),
        );
        connection.use_parameter_serializers(TestEventSerializer::create());
        connection.add_incoming(events.clone());
        let remote = connection.add_outgoing().unwrap();
        // Queued before the handshake; delivered after it.
        remote.start_processing().unwrap();
        connection.connect().await.unwrap();

        remote.process_test_class(TestClassRunInfo::new("A")).unwrap();
        remote.process_test_class(TestClassRunInfo::new("B")).unwrap();
        remote.stop().unwrap();
        drop(remote);

        let received = worker.await.unwrap();
        connection.stop().await;

        assert_eq!(
            received,
            vec![
                MessageType::StartProcessing,
                MessageType::ProcessTestClass,
                MessageType::ProcessTestClass,
                MessageType::Stop,
            ]
        );
        assert_eq!(
            *events.0.lock(),
            vec![
                "output A running",
                "completed A SUCCESS",
                "output B running",
                "completed B SUCCESS",
            ]
        );
    }

    #[tokio::test]
    async fn connect_times_out_when_worker_never_dials_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = ProcessChannel::new();
        channel.start_server(dir.path()).unwrap();

        let mut connection = SocketObjectConnection::new(
            "Test Executor 2",
            channel,
            Duration::from_millis(50),
            Arc::new(NullTraceWriter),
        );
        connection.add_incoming(Arc::new(Events::default()));
        let _remote = connection.add_outgoing().unwrap();

        let err = connection.connect().await.unwrap_err();
        assert!(format!("{err:#}").contains("Test Executor 2 did not connect back"));
        assert!(connection.connect().await.is_err());
    }
}
