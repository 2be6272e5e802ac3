use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A line received from the child's stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessOutputLine {
    pub stream: OutputStream,
    pub data: String,
}

/// Everything needed to launch one child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessStartInfo {
    pub file_name: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    /// Skip the SIGINT / SIGTERM grace period on cancellation.
    pub kill_process_on_cancel: bool,
}

impl ProcessStartInfo {
    pub fn new(file_name: impl Into<PathBuf>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    fn display_command(&self) -> String {
        let mut s = self.file_name.display().to_string();
        for a in &self.arguments {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// How a process run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(i32),
    Cancelled,
}

/// Spawns a child process, forwards its stdout/stderr lines through a single
/// channel in arrival order per stream, and supports graceful cancellation
/// (SIGINT → SIGTERM → SIGKILL).
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    output_tx: mpsc::UnboundedSender<ProcessOutputLine>,
    output_rx: Option<mpsc::UnboundedReceiver<ProcessOutputLine>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            output_tx,
            output_rx: Some(output_rx),
        }
    }

    /// Take the output receiver. Can only be called once; subsequent calls return `None`.
    pub fn take_output_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessOutputLine>> {
        self.output_rx.take()
    }

    /// Run the process to completion or until `cancellation_token` fires.
    ///
    /// Returns an error only when the process cannot be started or waited on;
    /// a non-zero exit is reported through [`ProcessOutcome::Exited`].
    pub async fn execute(
        &self,
        info: &ProcessStartInfo,
        cancellation_token: CancellationToken,
    ) -> Result<ProcessOutcome> {
        anyhow::ensure!(
            !info.file_name.as_os_str().is_empty(),
            "file_name must not be empty"
        );

        self.trace
            .info(&format!("Starting process: {}", info.display_command()));
        if let Some(ref dir) = info.working_directory {
            self.trace
                .verbose(&format!("  Working directory: '{}'", dir.display()));
        }

        let mut cmd = Command::new(&info.file_name);
        cmd.args(&info.arguments);
        if let Some(ref dir) = info.working_directory {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }
        cmd.envs(&info.environment);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start process '{}'", info.display_command()))?;

        let pid = child.id().unwrap_or(0);
        self.trace
            .verbose(&format!("Process started with process id {pid}, waiting for process exit."));

        let stdout_task = child
            .stdout
            .take()
            .map(|s| self.spawn_reader(s, OutputStream::Stdout));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| self.spawn_reader(s, OutputStream::Stderr));

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                ProcessOutcome::Exited(exit_code_of(status))
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                self.cancel_and_kill_process(&mut child, info.kill_process_on_cancel).await;
                ProcessOutcome::Cancelled
            }
        };

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        self.trace.info(&format!(
            "Finished process {pid} with {outcome:?}, elapsed time {:.2?}.",
            start.elapsed()
        ));

        Ok(outcome)
    }

    fn spawn_reader<R>(&self, stream: R, kind: OutputStream) -> tokio::task::JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.output_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx.send(ProcessOutputLine {
                    stream: kind,
                    data: line,
                });
            }
        })
    }

    /// Attempt graceful cancellation: SIGINT → SIGTERM → SIGKILL.
    /// If `kill_immediately` is true, skip signals and go straight to kill.
    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) {
        if !kill_immediately {
            for (signal, timeout) in [
                (Signal::Int, SIGINT_TIMEOUT),
                (Signal::Term, SIGTERM_TIMEOUT),
            ] {
                if self.send_signal_and_wait(child, signal, timeout).await {
                    self.trace
                        .info(&format!("Process exited after {signal:?}."));
                    return;
                }
            }
        }

        self.trace.info("Killing process.");
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    /// Send a signal to the child process and wait up to `timeout` for it to exit.
    /// Returns `true` if the process exited within the timeout.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let Some(pid) = child.id() else {
            return true;
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .warning(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

/// Map an exit status to a single code; signals become `128 + signo` on Unix.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}
