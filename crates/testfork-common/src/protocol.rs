// Messages exchanged between the dispatcher and a forked worker, and the
// serializers that turn them into channel frame bodies.

use crate::process_channel::MessageType;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use testfork_sdk::WorkerPackage;

// ---------------------------------------------------------------------------
// Work units and worker entry
// ---------------------------------------------------------------------------

/// One test class to execute in the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestClassRunInfo {
    pub test_class_name: String,
}

impl TestClassRunInfo {
    pub fn new(test_class_name: impl Into<String>) -> Self {
        Self {
            test_class_name: test_class_name.into(),
        }
    }
}

/// Describes how the worker executes a test class: the command to run, with
/// the class name appended as the final argument.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFrameworkSpec {
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<std::path::PathBuf>,
}

impl TestFrameworkSpec {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            working_directory: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests (dispatcher → worker)
// ---------------------------------------------------------------------------

/// Calls on the worker's remote test class processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    StartProcessing,
    ProcessTestClass(TestClassRunInfo),
    Stop,
}

impl WorkerRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            WorkerRequest::StartProcessing => MessageType::StartProcessing,
            WorkerRequest::ProcessTestClass(_) => MessageType::ProcessTestClass,
            WorkerRequest::Stop => MessageType::Stop,
        }
    }
}

// ---------------------------------------------------------------------------
// Events (worker → dispatcher)
// ---------------------------------------------------------------------------

/// Final result of one test class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestResult {
    Success,
    Failure,
    Skipped,
}

impl std::fmt::Display for TestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestResult::Success => write!(f, "SUCCESS"),
            TestResult::Failure => write!(f, "FAILURE"),
            TestResult::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Which output stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputDestination {
    StdOut,
    StdErr,
}

/// Result events pushed by the worker while it executes test classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TestEvent {
    #[serde(rename_all = "camelCase")]
    Started {
        test_class_name: String,
        start_time: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Output {
        test_class_name: String,
        destination: OutputDestination,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        test_class_name: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        test_class_name: String,
        result: TestResult,
        end_time: DateTime<Utc>,
    },
}

impl TestEvent {
    pub fn test_class_name(&self) -> &str {
        match self {
            TestEvent::Started { test_class_name, .. }
            | TestEvent::Output { test_class_name, .. }
            | TestEvent::Failure { test_class_name, .. }
            | TestEvent::Completed { test_class_name, .. } => test_class_name,
        }
    }
}

// ---------------------------------------------------------------------------
// Serializers
// ---------------------------------------------------------------------------

/// Encodes request and event payloads into frame bodies.
pub trait ParameterSerializer: Send + Sync {
    fn encode_request(&self, request: &WorkerRequest) -> Result<String>;
    fn decode_request(&self, message_type: MessageType, body: &str) -> Result<WorkerRequest>;
    fn encode_event(&self, event: &TestEvent) -> Result<String>;
    fn decode_event(&self, body: &str) -> Result<TestEvent>;
}

/// Body of the StartProcessing frame.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Handshake {
    protocol_version: u32,
}

/// JSON serializer for test class run infos and test events.
#[derive(Debug, Clone, Default)]
pub struct TestEventSerializer;

impl TestEventSerializer {
    /// The serializer set registered on every worker connection.
    pub fn create() -> SerializerRegistry {
        SerializerRegistry::new(Arc::new(TestEventSerializer))
    }
}

impl ParameterSerializer for TestEventSerializer {
    fn encode_request(&self, request: &WorkerRequest) -> Result<String> {
        match request {
            WorkerRequest::ProcessTestClass(info) => {
                serde_json::to_string(info).context("Failed to serialize TestClassRunInfo")
            }
            WorkerRequest::StartProcessing => serde_json::to_string(&Handshake {
                protocol_version: WorkerPackage::PROTOCOL_VERSION,
            })
            .context("Failed to serialize handshake"),
            WorkerRequest::Stop => Ok(String::new()),
        }
    }

    fn decode_request(&self, message_type: MessageType, body: &str) -> Result<WorkerRequest> {
        match message_type {
            MessageType::StartProcessing => {
                let handshake: Handshake =
                    serde_json::from_str(body).context("Failed to deserialize handshake")?;
                anyhow::ensure!(
                    handshake.protocol_version == WorkerPackage::PROTOCOL_VERSION,
                    "Dispatcher speaks protocol version {} but this worker speaks {}",
                    handshake.protocol_version,
                    WorkerPackage::PROTOCOL_VERSION
                );
                Ok(WorkerRequest::StartProcessing)
            }
            MessageType::Stop => Ok(WorkerRequest::Stop),
            MessageType::ProcessTestClass => {
                let info = serde_json::from_str(body)
                    .context("Failed to deserialize TestClassRunInfo")?;
                Ok(WorkerRequest::ProcessTestClass(info))
            }
            other => anyhow::bail!("Unexpected request message type: {}", other),
        }
    }

    fn encode_event(&self, event: &TestEvent) -> Result<String> {
        serde_json::to_string(event).context("Failed to serialize TestEvent")
    }

    fn decode_event(&self, body: &str) -> Result<TestEvent> {
        serde_json::from_str(body).context("Failed to deserialize TestEvent")
    }
}

/// The serializer set a connection uses for parameter encoding.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializer: Arc<dyn ParameterSerializer>,
}

impl SerializerRegistry {
    pub fn new(serializer: Arc<dyn ParameterSerializer>) -> Self {
        Self { serializer }
    }

    pub fn serializer(&self) -> &Arc<dyn ParameterSerializer> {
        &self.serializer
    }

    /// Encode a request into `(frame type, body)`.
    pub fn encode_request(&self, request: &WorkerRequest) -> Result<(MessageType, String)> {
        Ok((request.message_type(), self.serializer.encode_request(request)?))
    }

    pub fn decode_request(&self, message_type: MessageType, body: &str) -> Result<WorkerRequest> {
        self.serializer.decode_request(message_type, body)
    }

    pub fn encode_event(&self, event: &TestEvent) -> Result<(MessageType, String)> {
        Ok((MessageType::TestEvent, self.serializer.encode_event(event)?))
    }

    pub fn decode_event(&self, message_type: MessageType, body: &str) -> Result<TestEvent> {
        anyhow::ensure!(
            message_type == MessageType::TestEvent,
            "Unexpected event message type: {}",
            message_type
        );
        self.serializer.decode_event(body)
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        TestEventSerializer::create()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_request_body_is_camel_case_json() {
        let registry = TestEventSerializer::create();
        let (ty, body) = registry
            .encode_request(&WorkerRequest::ProcessTestClass(TestClassRunInfo::new(
                "org.example.FooTest",
            )))
            .unwrap();
        assert_eq!(ty, MessageType::ProcessTestClass);
        assert_eq!(body, r#"{"testClassName":"org.example.FooTest"}"#);
    }

    #[test]
    fn stop_has_an_empty_body() {
        let registry = TestEventSerializer::create();
        let (ty, body) = registry.encode_request(&WorkerRequest::Stop).unwrap();
        assert_eq!(ty, MessageType::Stop);
        assert!(body.is_empty());
    }

    #[test]
    fn start_processing_carries_the_protocol_version() {
        let registry = TestEventSerializer::create();
        let (ty, body) = registry
            .encode_request(&WorkerRequest::StartProcessing)
            .unwrap();
        assert_eq!(ty, MessageType::StartProcessing);
        assert_eq!(
            body,
            format!(r#"{{"protocolVersion":{}}}"#, WorkerPackage::PROTOCOL_VERSION)
        );
        assert_eq!(
            registry.decode_request(ty, &body).unwrap(),
            WorkerRequest::StartProcessing
        );
    }

    #[test]
    fn mismatched_protocol_version_is_rejected() {
        let registry = TestEventSerializer::create();
        let body = format!(
            r#"{{"protocolVersion":{}}}"#,
            WorkerPackage::PROTOCOL_VERSION + 1
        );
        let err = registry
            .decode_request(MessageType::StartProcessing, &body)
            .unwrap_err();
        assert!(err.to_string().contains("protocol version"));
        assert!(registry
            .decode_request(MessageType::StartProcessing, "")
            .is_err());
    }

    #[test]
    fn decode_event_rejects_request_frames() {
        let registry = TestEventSerializer::create();
        assert!(registry.decode_event(MessageType::Stop, "{}").is_err());
        assert!(registry
            .decode_request(MessageType::TestEvent, "{}")
            .is_err());
    }

    #[test]
    fn completed_event_is_tagged() {
        let event: TestEvent = serde_json::from_str(
            r#"{"type":"completed","testClassName":"A","result":"failure","endTime":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(event.test_class_name(), "A");
        assert!(matches!(
            event,
            TestEvent::Completed {
                result: TestResult::Failure,
                ..
            }
        ));
    }

    #[test]
    fn framework_spec_omits_missing_working_directory() {
        let spec = TestFrameworkSpec::new(["cargo", "test", "--"]);
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"command":["cargo","test","--"]}"#);
    }
}
