// TestRunDriver: spreads test classes over a set of forking processors and
// turns the outcome into a process exit code.

use crate::connection::TestResultProcessor;
use crate::error::DispatchError;
use crate::forking_processor::ForkingTestClassProcessor;
use crate::module_registry::ModuleRegistry;
use crate::result_collector::{ResultCollector, RunSummary};
use crate::worker_process::WorkerProcessFactory;

use std::sync::Arc;
use testfork_common::constants::return_code;
use testfork_common::{HostContext, TestClassRunInfo, TestFrameworkSpec, Terminal, Tracing};
use testfork_sdk::{ClassPath, TraceWriter};

/// What to run.
#[derive(Debug, Clone)]
pub struct TestRunRequest {
    pub framework: TestFrameworkSpec,
    pub class_path: ClassPath,
    pub test_classes: Vec<String>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    /// First dispatch error, if any.
    pub error: Option<DispatchError>,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return_code::TERMINATED_ERROR
        } else if self.error.is_some() {
            return_code::WORKER_ERROR
        } else if self.summary.failed > 0 {
            return_code::TESTS_FAILED
        } else {
            return_code::SUCCESS
        }
    }
}

pub struct TestRunDriver {
    context: Arc<HostContext>,
    worker_factory: Arc<dyn WorkerProcessFactory>,
    module_registry: Arc<dyn ModuleRegistry>,
    trace: Tracing,
}

impl TestRunDriver {
    pub fn new(
        context: Arc<HostContext>,
        worker_factory: Arc<dyn WorkerProcessFactory>,
        module_registry: Arc<dyn ModuleRegistry>,
    ) -> Self {
        let trace = context.get_trace("TestRunDriver");
        Self {
            context,
            worker_factory,
            module_registry,
            trace,
        }
    }

    /// Run every class, round-robin over at most `max_workers` workers, and
    /// stop them all. Host shutdown kills the workers.
    pub async fn run(&self, request: TestRunRequest, terminal: Terminal) -> RunOutcome {
        let collector = Arc::new(ResultCollector::new(terminal));
        let outcome = self.run_with(request, collector.clone()).await;
        collector.print_summary();
        RunOutcome {
            summary: collector.summary(),
            error: outcome.0,
            cancelled: outcome.1,
        }
    }

    async fn run_with(
        &self,
        request: TestRunRequest,
        results: Arc<dyn TestResultProcessor>,
    ) -> (Option<DispatchError>, bool) {
        let shutdown = self.context.shutdown_token();
        let settings = self.context.settings();
        let worker_count = settings
            .max_workers
            .max(1)
            .min(request.test_classes.len().max(1));
        let parent_lease = Arc::new(self.context.lease_registry().root_lease());

        let processors: Vec<Arc<ForkingTestClassProcessor>> = (0..worker_count)
            .map(|_| {
                let processor = ForkingTestClassProcessor::new(
                    Arc::clone(&parent_lease),
                    Arc::clone(&self.worker_factory),
                    request.framework.clone(),
                    Arc::clone(&self.module_registry),
                    self.context.documentation().clone(),
                )
                .with_fork_options(settings.fork_options.clone())
                .with_class_path(request.class_path.clone())
                .with_trace(Arc::new(self.context.get_trace("ForkingTestClassProcessor")));
                processor.start_processing(Arc::clone(&results));
                Arc::new(processor)
            })
            .collect();
        self.trace.info(&format!(
            "Running {} test classes on up to {} workers",
            request.test_classes.len(),
            worker_count
        ));

        let watcher = {
            let processors = processors.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                for processor in &processors {
                    processor.stop_now().await;
                }
            })
        };

        let mut first_error = None;
        for (index, class) in request.test_classes.iter().enumerate() {
            if shutdown.is_cancelled() {
                break;
            }
            let processor = &processors[index % worker_count];
            if let Err(e) = processor
                .process_test_class(TestClassRunInfo::new(class.as_str()))
                .await
            {
                self.trace.error(&e.to_string());
                first_error = Some(e);
                break;
            }
        }

        let stops = futures::future::join_all(processors.iter().map(|p| p.stop())).await;
        watcher.abort();
        for result in stops {
            if let Err(e) = result {
                self.trace.error(&e.to_string());
                first_error.get_or_insert(e);
            }
        }

        (first_error, shutdown.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_process::InProcessWorkerFactory;
    use crate::module_registry::StaticModuleRegistry;
    use chrono::Utc;
    use testfork_common::{DispatcherSettings, ShutdownReason, TestEvent, TestResult};

    fn context(max_workers: usize) -> Arc<HostContext> {
        HostContext::new(
            "Dispatcher",
            DispatcherSettings {
                max_workers,
                ..DispatcherSettings::default()
            },
        )
        .unwrap()
    }

    fn request(classes: &[&str]) -> TestRunRequest {
        TestRunRequest {
            framework: TestFrameworkSpec::new(["run-tests"]),
            class_path: ClassPath::new(),
            test_classes: classes.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn driver(context: &Arc<HostContext>, factory: &InProcessWorkerFactory) -> TestRunDriver {
        TestRunDriver::new(
            Arc::clone(context),
            Arc::new(factory.clone()),
            Arc::new(StaticModuleRegistry::new().with_install_dir("/opt/testfork/lib")),
        )
    }

    #[tokio::test]
    async fn all_classes_pass() {
        let context = context(2);
        let factory = InProcessWorkerFactory::new();
        let outcome = driver(&context, &factory)
            .run(request(&["A", "B", "C"]), Terminal::silent())
            .await;

        assert_eq!(outcome.summary.passed, 3);
        assert_eq!(outcome.exit_code(), return_code::SUCCESS);
        assert_eq!(factory.forks(), 2);
        assert_eq!(context.lease_registry().leased(), 0);
    }

    #[tokio::test]
    async fn failing_class_sets_tests_failed() {
        let context = context(1);
        let factory = InProcessWorkerFactory::with_handler(Arc::new(|info: &TestClassRunInfo| {
            let result = if info.test_class_name == "B" {
                TestResult::Failure
            } else {
                TestResult::Success
            };
            let mut events = Vec::new();
            if result == TestResult::Failure {
                events.push(TestEvent::Failure {
                    test_class_name: info.test_class_name.clone(),
                    message: "expected 1, got 2".into(),
                });
            }
            events.push(TestEvent::Completed {
                test_class_name: info.test_class_name.clone(),
                result,
                end_time: Utc::now(),
            });
            events
        }));

        let outcome = driver(&context, &factory)
            .run(request(&["A", "B"]), Terminal::silent())
            .await;

        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.failures[0].1, vec!["expected 1, got 2"]);
        assert_eq!(outcome.exit_code(), return_code::TESTS_FAILED);
        assert_eq!(factory.forks(), 1);
    }

    #[tokio::test]
    async fn launch_failure_is_a_worker_error() {
        let context = context(1);
        let factory = InProcessWorkerFactory::new();
        factory.fail_next_starts(1);

        let outcome = driver(&context, &factory)
            .run(request(&["A", "B"]), Terminal::silent())
            .await;

        assert!(outcome.error.as_ref().is_some_and(DispatchError::is_launch_failure));
        assert_eq!(outcome.exit_code(), return_code::WORKER_ERROR);
        assert_eq!(context.lease_registry().leased(), 0);
    }

    #[tokio::test]
    async fn shutdown_before_run_dispatches_nothing() {
        let context = context(2);
        context.shutdown(ShutdownReason::UserCancelled);
        let factory = InProcessWorkerFactory::new();

        let outcome = driver(&context, &factory)
            .run(request(&["A"]), Terminal::silent())
            .await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code(), return_code::TERMINATED_ERROR);
        assert_eq!(factory.forks(), 0);
    }
}
