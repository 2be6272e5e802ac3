// Worker: connects back to the dispatcher, executes the test classes it is
// sent one at a time, and streams result events until told to stop.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testfork_common::constants::variables;
use testfork_common::{
    ChannelReader, ChannelWriter, HostContext, ProcessChannel, SerializerRegistry, TestEvent,
    TestEventSerializer, TestFrameworkSpec, Tracing, WorkerRequest,
};
use testfork_sdk::{ClassPath, TraceWriter};
use tokio::sync::mpsc;

use crate::test_class_executor::TestClassExecutor;

/// What the dispatcher hands a worker through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnvironment {
    pub framework: TestFrameworkSpec,
    pub implementation_classpath: ClassPath,
    pub application_classpath: ClassPath,
    pub system_path: Option<OsString>,
}

impl WorkerEnvironment {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self> {
        let entry = lookup(variables::WORKER_ENTRY)
            .with_context(|| format!("{} is not set", variables::WORKER_ENTRY))?;
        let entry = entry
            .into_string()
            .map_err(|_| anyhow::anyhow!("{} is not valid UTF-8", variables::WORKER_ENTRY))?;
        let framework: TestFrameworkSpec = serde_json::from_str(&entry)
            .with_context(|| format!("Failed to parse {}", variables::WORKER_ENTRY))?;

        let classpath = |key: &str| {
            lookup(key)
                .map(|value| ClassPath::from_search_path(&value))
                .unwrap_or_default()
        };
        Ok(Self {
            framework,
            implementation_classpath: classpath(variables::IMPLEMENTATION_CLASSPATH),
            application_classpath: classpath(variables::APPLICATION_CLASSPATH),
            system_path: lookup("PATH"),
        })
    }
}

pub struct Worker {
    context: Arc<HostContext>,
    trace: Tracing,
}

impl Worker {
    pub fn new(context: Arc<HostContext>) -> Self {
        let trace = context.get_trace("Worker");
        Self { context, trace }
    }

    /// Connect to `channel`, serve requests until `Stop`, then flush the
    /// remaining events. Returns once the dispatcher has every event.
    pub async fn run_async(
        &self,
        channel: &Path,
        display_name: &str,
        environment: WorkerEnvironment,
        extra_args: Vec<String>,
    ) -> Result<()> {
        let executor = TestClassExecutor::new(
            environment.framework,
            &environment.implementation_classpath,
            &environment.application_classpath,
            environment.system_path.as_deref(),
            extra_args,
            Arc::new(self.context.get_trace("TestClassExecutor")),
        )?;

        self.trace.info(&format!("{display_name} connecting to {:?}", channel));
        let mut process_channel = ProcessChannel::new();
        process_channel.start_client(channel).await?;
        let (reader, writer) = process_channel.into_split()?;

        let serializers = TestEventSerializer::create();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_events(
            writer,
            serializers.clone(),
            events_rx,
            self.context.get_trace("Worker"),
        ));

        let served = self
            .serve(reader, &serializers, &executor, &events_tx)
            .await;
        drop(events_tx);
        let flushed = writer_task
            .await
            .context("Event writer task panicked")?;

        served?;
        flushed?;
        self.trace.info(&format!("{display_name} stopped"));
        Ok(())
    }

    async fn serve(
        &self,
        mut reader: ChannelReader,
        serializers: &SerializerRegistry,
        executor: &TestClassExecutor,
        events: &mpsc::UnboundedSender<TestEvent>,
    ) -> Result<()> {
        let mut started = false;
        loop {
            let message = reader
                .receive_async()
                .await?
                .context("Dispatcher closed the connection without sending Stop")?;
            match serializers.decode_request(message.message_type, &message.body)? {
                WorkerRequest::StartProcessing => {
                    self.trace.verbose("Start processing");
                    started = true;
                }
                WorkerRequest::ProcessTestClass(info) => {
                    anyhow::ensure!(
                        started,
                        "Received test class '{}' before start processing",
                        info.test_class_name
                    );
                    self.trace
                        .info(&format!("Executing test class {}", info.test_class_name));
                    executor
                        .execute(&info, events, self.context.shutdown_token())
                        .await?;
                }
                WorkerRequest::Stop => {
                    self.trace.verbose("Stop requested");
                    return Ok(());
                }
            }
        }
    }
}

async fn write_events(
    mut writer: ChannelWriter,
    serializers: SerializerRegistry,
    mut events: mpsc::UnboundedReceiver<TestEvent>,
    trace: Tracing,
) -> Result<()> {
    while let Some(event) = events.recv().await {
        let (message_type, body) = serializers.encode_event(&event)?;
        if let Err(e) = writer.send_async(message_type, &body).await {
            trace.error(&format!("Failed to send event: {e:#}"));
            return Err(e);
        }
    }
    writer.shutdown().await
}

/// Socket path given on the command line, made absolute.
pub fn channel_path(value: &str) -> Result<PathBuf> {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()
        .context("Failed to read the current directory")?
        .join(path))
}
