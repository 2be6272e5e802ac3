// Prints result events as they arrive and tallies them for the run summary.

use crate::connection::TestResultProcessor;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use testfork_common::{ConsoleColor, OutputDestination, Terminal, TestResult};

/// Totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Failed test classes with the failure messages reported for them.
    pub failures: Vec<(String, Vec<String>)>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }
}

#[derive(Default)]
struct Tally {
    summary: RunSummary,
    pending_failures: HashMap<String, Vec<String>>,
}

pub struct ResultCollector {
    terminal: Terminal,
    tally: Mutex<Tally>,
}

impl ResultCollector {
    pub fn new(terminal: Terminal) -> Self {
        Self {
            terminal,
            tally: Mutex::new(Tally::default()),
        }
    }

    pub fn summary(&self) -> RunSummary {
        self.tally.lock().summary.clone()
    }

    pub fn print_summary(&self) {
        let summary = self.summary();
        self.terminal.write_section("Summary");
        for (class, messages) in &summary.failures {
            self.terminal.write_error(&format!("{class} FAILED"));
            for message in messages {
                self.terminal.write_error(&format!("    {message}"));
            }
        }
        let color = if summary.failed > 0 {
            ConsoleColor::Red
        } else {
            ConsoleColor::Green
        };
        self.terminal.write_line(
            &format!(
                "{} test classes completed, {} passed, {} failed, {} skipped",
                summary.total(),
                summary.passed,
                summary.failed,
                summary.skipped
            ),
            Some(color),
        );
    }
}

impl TestResultProcessor for ResultCollector {
    fn started(&self, test_class_name: &str, _start_time: DateTime<Utc>) {
        self.terminal
            .write_line(&format!("{test_class_name} STARTED"), Some(ConsoleColor::Cyan));
    }

    fn output(&self, test_class_name: &str, destination: OutputDestination, message: &str) {
        let line = format!("{test_class_name} > {message}");
        match destination {
            OutputDestination::StdOut => self.terminal.write_line(&line, None),
            OutputDestination::StdErr => {
                self.terminal.write_line(&line, Some(ConsoleColor::Yellow))
            }
        }
    }

    fn failure(&self, test_class_name: &str, message: &str) {
        self.tally
            .lock()
            .pending_failures
            .entry(test_class_name.to_string())
            .or_default()
            .push(message.to_string());
    }

    fn completed(&self, test_class_name: &str, result: TestResult, _end_time: DateTime<Utc>) {
        {
            let mut tally = self.tally.lock();
            let messages = tally.pending_failures.remove(test_class_name).unwrap_or_default();
            match result {
                TestResult::Success => tally.summary.passed += 1,
                TestResult::Skipped => tally.summary.skipped += 1,
                TestResult::Failure => {
                    tally.summary.failed += 1;
                    tally
                        .summary
                        .failures
                        .push((test_class_name.to_string(), messages));
                }
            }
        }
        let color = match result {
            TestResult::Success => ConsoleColor::Green,
            TestResult::Failure => ConsoleColor::Red,
            TestResult::Skipped => ConsoleColor::Yellow,
        };
        self.terminal
            .write_line(&format!("{test_class_name} {result}"), Some(color));
    }
}
