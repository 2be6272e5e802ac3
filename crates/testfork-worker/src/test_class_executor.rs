// Runs one test class by invoking the configured test command and turning
// its output and exit code into test events.

use anyhow::{Context, Result};
use chrono::Utc;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use testfork_common::{
    OutputDestination, TestClassRunInfo, TestEvent, TestFrameworkSpec, TestResult,
};
use testfork_sdk::{
    ClassPath, OutputStream, ProcessInvoker, ProcessOutcome, ProcessStartInfo, TraceWriter,
    WhichUtil,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct TestClassExecutor {
    framework: TestFrameworkSpec,
    search_path: OsString,
    extra_args: Vec<String>,
    trace: Arc<dyn TraceWriter>,
}

impl TestClassExecutor {
    /// The command is looked up on the implementation classpath, then the
    /// application classpath, then `system_path`.
    pub fn new(
        framework: TestFrameworkSpec,
        implementation_classpath: &ClassPath,
        application_classpath: &ClassPath,
        system_path: Option<&std::ffi::OsStr>,
        extra_args: Vec<String>,
        trace: Arc<dyn TraceWriter>,
    ) -> Result<Self> {
        anyhow::ensure!(
            !framework.command.is_empty(),
            "The test framework has no command to run"
        );
        let mut search = ClassPath::new();
        search.extend(implementation_classpath);
        search.extend(application_classpath);
        if let Some(path) = system_path {
            search.extend(&ClassPath::from_search_path(path));
        }
        let search_path = search.to_search_path()?;
        Ok(Self {
            framework,
            search_path,
            extra_args,
            trace,
        })
    }

    /// Execute one test class. Every outcome, including a command that
    /// cannot be started, is reported as events; only a closed event sink
    /// is an error.
    pub async fn execute(
        &self,
        info: &TestClassRunInfo,
        events: &mpsc::UnboundedSender<TestEvent>,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        let name = info.test_class_name.clone();
        send(
            events,
            TestEvent::Started {
                test_class_name: name.clone(),
                start_time: Utc::now(),
            },
        )?;

        let result = match self.run_command(&name, events, cancellation_token).await {
            Ok(ProcessOutcome::Exited(0)) => TestResult::Success,
            Ok(ProcessOutcome::Exited(code)) => {
                send(
                    events,
                    TestEvent::Failure {
                        test_class_name: name.clone(),
                        message: format!("Test command exited with code {code}"),
                    },
                )?;
                TestResult::Failure
            }
            Ok(ProcessOutcome::Cancelled) => {
                send(
                    events,
                    TestEvent::Failure {
                        test_class_name: name.clone(),
                        message: "Test execution was cancelled".to_string(),
                    },
                )?;
                TestResult::Failure
            }
            Err(e) => {
                self.trace.error(&format!("{name}: {e:#}"));
                send(
                    events,
                    TestEvent::Failure {
                        test_class_name: name.clone(),
                        message: format!("{e:#}"),
                    },
                )?;
                TestResult::Failure
            }
        };

        send(
            events,
            TestEvent::Completed {
                test_class_name: name,
                result,
                end_time: Utc::now(),
            },
        )
    }

    fn start_info(&self, test_class_name: &str) -> Result<ProcessStartInfo> {
        let cwd = match self.framework.working_directory {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read the current directory")?,
        };
        let program: PathBuf =
            WhichUtil::which_in(&self.framework.command[0], &self.search_path, &cwd)?;

        let mut info = ProcessStartInfo::new(program);
        info.arguments = self.framework.command[1..]
            .iter()
            .chain(&self.extra_args)
            .cloned()
            .collect();
        info.arguments.push(test_class_name.to_string());
        info.working_directory = Some(cwd);
        info.environment.insert(
            "PATH".to_string(),
            self.search_path.to_string_lossy().into_owned(),
        );
        Ok(info)
    }

    async fn run_command(
        &self,
        test_class_name: &str,
        events: &mpsc::UnboundedSender<TestEvent>,
        cancellation_token: CancellationToken,
    ) -> Result<ProcessOutcome> {
        let info = self.start_info(test_class_name)?;

        let mut invoker = ProcessInvoker::new(Arc::clone(&self.trace));
        let mut output = invoker
            .take_output_receiver()
            .context("Process output receiver already taken")?;
        let forwarder = {
            let events = events.clone();
            let name = test_class_name.to_string();
            tokio::spawn(async move {
                while let Some(line) = output.recv().await {
                    let destination = match line.stream {
                        OutputStream::Stdout => OutputDestination::StdOut,
                        OutputStream::Stderr => OutputDestination::StdErr,
                    };
                    let _ = events.send(TestEvent::Output {
                        test_class_name: name.clone(),
                        destination,
                        message: line.data,
                    });
                }
            })
        };

        let outcome = invoker.execute(&info, cancellation_token).await;
        // The receiver ends once the invoker's sender is gone.
        drop(invoker);
        let _ = forwarder.await;
        outcome
    }
}

fn send(events: &mpsc::UnboundedSender<TestEvent>, event: TestEvent) -> Result<()> {
    events
        .send(event)
        .map_err(|_| anyhow::anyhow!("Event channel to the dispatcher is closed"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use testfork_sdk::trace::NullTraceWriter;

    fn script(dir: &std::path::Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn executor(
        command: &[&str],
        implementation: &std::path::Path,
        application: &std::path::Path,
        extra_args: Vec<String>,
    ) -> TestClassExecutor {
        let mut framework = TestFrameworkSpec::new(command.iter().copied());
        framework.working_directory = Some(application.to_path_buf());
        TestClassExecutor::new(
            framework,
            &ClassPath::from_iter([implementation]),
            &ClassPath::from_iter([application]),
            std::env::var_os("PATH").as_deref(),
            extra_args,
            Arc::new(NullTraceWriter),
        )
        .unwrap()
    }

    async fn run(executor: &TestClassExecutor, class: &str) -> Vec<TestEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        executor
            .execute(&TestClassRunInfo::new(class), &tx, CancellationToken::new())
            .await
            .unwrap();
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn passing_class_reports_output_and_success() {
        let implementation = tempfile::tempdir().unwrap();
        let application = tempfile::tempdir().unwrap();
        script(application.path(), "run-suite", "echo \"running $*\"");
        let executor = executor(
            &["run-suite", "--fast"],
            implementation.path(),
            application.path(),
            vec!["--verbose".into()],
        );

        let events = run(&executor, "org.example.FooTest").await;

        assert!(matches!(events.first(), Some(TestEvent::Started { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            TestEvent::Output { destination: OutputDestination::StdOut, message, .. }
                if message == "running --fast --verbose org.example.FooTest"
        )));
        assert!(matches!(
            events.last(),
            Some(TestEvent::Completed { result: TestResult::Success, .. })
        ));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let implementation = tempfile::tempdir().unwrap();
        let application = tempfile::tempdir().unwrap();
        script(application.path(), "run-suite", "echo boom 1>&2; exit 4");
        let executor = executor(&["run-suite"], implementation.path(), application.path(), vec![]);

        let events = run(&executor, "BarTest").await;

        assert!(events.iter().any(|e| matches!(
            e,
            TestEvent::Output {
                destination: OutputDestination::StdErr,
                message,
                ..
            } if message == "boom"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            TestEvent::Failure { message, .. } if message == "Test command exited with code 4"
        )));
        assert!(matches!(
            events.last(),
            Some(TestEvent::Completed { result: TestResult::Failure, .. })
        ));
    }

    #[tokio::test]
    async fn implementation_classpath_shadows_application_classpath() {
        let implementation = tempfile::tempdir().unwrap();
        let application = tempfile::tempdir().unwrap();
        script(implementation.path(), "run-suite", "echo implementation");
        script(application.path(), "run-suite", "echo application");
        let executor = executor(&["run-suite"], implementation.path(), application.path(), vec![]);

        let events = run(&executor, "A").await;

        assert!(events.iter().any(|e| matches!(
            e,
            TestEvent::Output { message, .. } if message == "implementation"
        )));
    }

    #[tokio::test]
    async fn missing_command_is_reported_as_failure() {
        let implementation = tempfile::tempdir().unwrap();
        let application = tempfile::tempdir().unwrap();
        let executor = executor(
            &["no-such-test-runner"],
            implementation.path(),
            application.path(),
            vec![],
        );

        let events = run(&executor, "A").await;

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[1],
            TestEvent::Failure { message, .. } if message.contains("no-such-test-runner")
        ));
        assert!(matches!(
            events.last(),
            Some(TestEvent::Completed { result: TestResult::Failure, .. })
        ));
    }

    #[test]
    fn empty_command_is_rejected() {
        let result = TestClassExecutor::new(
            TestFrameworkSpec::default(),
            &ClassPath::new(),
            &ClassPath::new(),
            None,
            vec![],
            Arc::new(NullTraceWriter),
        );
        assert!(result.is_err());
    }
}
