// Out-of-process workers: spawns the worker binary, hands it the socket to
// dial back on, and reaps or kills it.

use crate::connection::ObjectConnection;
use crate::error::ExecError;
use crate::socket_connection::SocketObjectConnection;
use crate::worker_process::{WorkerProcess, WorkerProcessBuilder, WorkerProcessFactory};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testfork_common::constants::{self, variables, worker_args};
use testfork_common::{DispatcherSettings, HostContext, ProcessChannel};
use testfork_sdk::process_invoker::exit_code_of;
use testfork_sdk::{TraceWriter, WhichUtil};
use tokio::sync::Notify;

/// Find the worker binary: the configured override, then next to the current
/// executable, then on `PATH`.
pub fn find_worker_binary(settings: &DispatcherSettings) -> Result<PathBuf> {
    if let Some(ref path) = settings.worker_executable {
        anyhow::ensure!(path.exists(), "Configured worker executable {:?} does not exist", path);
        return Ok(path.clone());
    }

    let file_name = format!("{}{}", constants::WORKER_BINARY_NAME, std::env::consts::EXE_SUFFIX);
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(dir) = exe_path.parent() {
            let candidate = dir.join(&file_name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    WhichUtil::which(constants::WORKER_BINARY_NAME)
        .context("Worker binary not found next to the current executable or on PATH")
}

/// Builds [`ChildWorkerProcess`]es.
pub struct ChildProcessFactory {
    worker_executable: PathBuf,
    socket_dir: PathBuf,
    connect_timeout: Duration,
    next_id: AtomicUsize,
    trace: Arc<dyn TraceWriter>,
}

impl ChildProcessFactory {
    pub fn new(context: &HostContext) -> Result<Self> {
        let settings = context.settings();
        Ok(Self::with_executable(
            find_worker_binary(settings)?,
            settings.socket_dir(),
            settings.connect_timeout(),
            Arc::new(context.get_trace("ChildProcessFactory")),
        ))
    }

    pub fn with_executable(
        worker_executable: PathBuf,
        socket_dir: PathBuf,
        connect_timeout: Duration,
        trace: Arc<dyn TraceWriter>,
    ) -> Self {
        Self {
            worker_executable,
            socket_dir,
            connect_timeout,
            next_id: AtomicUsize::new(1),
            trace,
        }
    }

    pub fn worker_executable(&self) -> &Path {
        &self.worker_executable
    }
}

fn search_path_value(name: &str, classpath: &testfork_sdk::ClassPath) -> Result<OsString> {
    classpath
        .to_search_path()
        .with_context(|| format!("Cannot encode {name}"))
}

impl WorkerProcessFactory for ChildProcessFactory {
    fn build(&self, builder: WorkerProcessBuilder) -> Result<Arc<dyn WorkerProcess>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let display_name = format!("{} {}", builder.base_name(), id);
        let options = builder.fork_options();

        let mut environment: Vec<(String, OsString)> = options
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), OsString::from(v)))
            .collect();
        let entry = serde_json::to_string(builder.entry())
            .context("Failed to serialize worker entry")?;
        environment.push((variables::WORKER_ENTRY.to_string(), entry.into()));
        environment.push((
            variables::IMPLEMENTATION_CLASSPATH.to_string(),
            search_path_value("implementation classpath", builder.implementation_classpath())?,
        ));
        environment.push((
            variables::APPLICATION_CLASSPATH.to_string(),
            search_path_value("application classpath", builder.application_classpath())?,
        ));

        Ok(Arc::new(ChildWorkerProcess {
            display_name,
            executable: options
                .executable
                .clone()
                .unwrap_or_else(|| self.worker_executable.clone()),
            args: options.args.clone(),
            environment,
            working_dir: options.working_dir.clone(),
            socket_dir: self.socket_dir.clone(),
            connect_timeout: self.connect_timeout,
            channel: Mutex::new(None),
            child: Mutex::new(None),
            kill_requested: Notify::new(),
            trace: Arc::clone(&self.trace),
        }))
    }
}

/// A worker running as a child process.
pub struct ChildWorkerProcess {
    display_name: String,
    executable: PathBuf,
    args: Vec<String>,
    environment: Vec<(String, OsString)>,
    working_dir: Option<PathBuf>,
    socket_dir: PathBuf,
    connect_timeout: Duration,
    channel: Mutex<Option<ProcessChannel>>,
    /// Present until `wait_for_stop` takes it.
    child: Mutex<Option<tokio::process::Child>>,
    /// Kill requests for a child owned by `wait_for_stop`. The child is only
    /// ever signalled through its handle, never by a PID that may be reused.
    kill_requested: Notify,
    trace: Arc<dyn TraceWriter>,
}

impl ChildWorkerProcess {
    fn command(&self, socket_path: &Path) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.executable);
        command
            .arg(format!("--{}", worker_args::CHANNEL))
            .arg(socket_path)
            .arg(format!("--{}", worker_args::NAME))
            .arg(&self.display_name)
            .args(&self.args)
            .envs(self.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl WorkerProcess for ChildWorkerProcess {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn start(&self) -> Result<()> {
        let mut channel = ProcessChannel::new();
        let socket_path = channel
            .start_server(&self.socket_dir)
            .context("Failed to create IPC channel for worker")?;

        self.trace.info(&format!(
            "Starting {}: {:?} --{} {}",
            self.display_name,
            self.executable,
            worker_args::CHANNEL,
            socket_path.display()
        ));
        let child = self
            .command(&socket_path)
            .spawn()
            .with_context(|| format!("Failed to spawn worker process {:?}", self.executable))?;
        self.trace.info(&format!(
            "{} spawned with PID: {}",
            self.display_name,
            child.id().unwrap_or(0)
        ));

        *self.child.lock() = Some(child);
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    fn connection(&self) -> Result<Box<dyn ObjectConnection>> {
        let channel = self
            .channel
            .lock()
            .take()
            .with_context(|| format!("{} has no connection to hand out", self.display_name))?;
        Ok(Box::new(SocketObjectConnection::new(
            self.display_name.clone(),
            channel,
            self.connect_timeout,
            Arc::clone(&self.trace),
        )))
    }

    async fn wait_for_stop(&self) -> Result<(), ExecError> {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Err(ExecError::new(
                format!("{} is not running", self.display_name),
                None,
            ));
        };

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = self.kill_requested.notified() => {
                    if let Err(e) = child.start_kill() {
                        self.trace
                            .verbose(&format!("Failed to kill {}: {e}", self.display_name));
                    }
                }
            }
        };
        let status = status.map_err(|e| {
            ExecError::new(format!("Failed to wait for {}: {e}", self.display_name), None)
        })?;

        if status.success() {
            return Ok(());
        }
        let code = exit_code_of(status);
        Err(ExecError::new(
            format!(
                "Process '{}' finished with non-zero exit value {}",
                self.display_name, code
            ),
            Some(code),
        ))
    }

    fn stop_now(&self) {
        if let Some(child) = self.child.lock().as_mut() {
            if let Err(e) = child.start_kill() {
                self.trace
                    .warning(&format!("Failed to kill {}: {e}", self.display_name));
            }
            return;
        }
        // `wait_for_stop` owns the child. A request left over after it has
        // reaped the child is never acted on.
        self.kill_requested.notify_one();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use testfork_common::{ForkOptions, TestFrameworkSpec};
    use testfork_sdk::trace::NullTraceWriter;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn factory(dir: &Path, executable: PathBuf) -> ChildProcessFactory {
        ChildProcessFactory::with_executable(
            executable,
            dir.to_path_buf(),
            Duration::from_secs(5),
            Arc::new(NullTraceWriter),
        )
    }

    fn builder() -> WorkerProcessBuilder {
        let mut builder = WorkerProcessBuilder::new(TestFrameworkSpec::new(["run-tests"]));
        builder.set_base_name("Test Executor");
        builder
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "worker", "exit 3");
        let process = factory(dir.path(), exe).build(builder()).unwrap();
        assert_eq!(process.display_name(), "Test Executor 1");

        process.start().await.unwrap();
        let err = process.wait_for_stop().await.unwrap_err();
        assert_eq!(err.exit_code, Some(3));
        assert!(err
            .message
            .contains("Process 'Test Executor 1' finished with non-zero exit value 3"));
    }

    #[tokio::test]
    async fn stop_now_kills_a_process_being_waited_on() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "worker", "exec sleep 30");
        let process = factory(dir.path(), exe).build(builder()).unwrap();
        process.start().await.unwrap();

        let waiter = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.wait_for_stop().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        process.stop_now();

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.exit_code, Some(137));
        // Killing an exited worker is harmless.
        process.stop_now();
    }

    #[tokio::test]
    async fn stop_now_racing_a_normal_exit_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let exe = script(dir.path(), "worker", "exit 0");
        let process = factory(dir.path(), exe).build(builder()).unwrap();
        process.start().await.unwrap();

        let waiter = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.wait_for_stop().await })
        };
        while !waiter.is_finished() {
            process.stop_now();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        match waiter.await.unwrap() {
            Ok(()) => {}
            Err(e) => assert_eq!(e.exit_code, Some(137)),
        }
        // The pending request outlives the child and is dropped with it.
        process.stop_now();
        process.stop_now();
    }

    #[tokio::test]
    async fn launch_environment_carries_entry_and_classpaths() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let exe = script(
            dir.path(),
            "worker",
            &format!(
                "printf '%s\\n%s\\n%s\\n%s\\n' \"$1 $3 $4 $5\" \"${}\" \"${}\" \"$EXTRA\" > {}",
                variables::IMPLEMENTATION_CLASSPATH,
                variables::APPLICATION_CLASSPATH,
                out.display()
            ),
        );

        let mut builder = builder();
        builder
            .set_implementation_classpath(["/opt/core", "/opt/logging"].into_iter().collect())
            .add_application_classpath(["/app/bin"]);
        let mut options = ForkOptions::new();
        options.env("EXTRA", "yes").arg("--verbose");
        options.copy_to(builder.fork_options_mut());

        let process = factory(dir.path(), exe).build(builder).unwrap();
        process.start().await.unwrap();
        process.wait_for_stop().await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines[0], "--channel --name Test Executor 1 --verbose");
        assert_eq!(lines[1], "/opt/core:/opt/logging");
        assert_eq!(lines[2], "/app/bin");
        assert_eq!(lines[3], "yes");
    }

    #[test]
    fn configured_worker_executable_must_exist() {
        let settings = DispatcherSettings {
            worker_executable: Some(PathBuf::from("/nonexistent/testfork-worker")),
            ..DispatcherSettings::default()
        };
        assert!(find_worker_binary(&settings).is_err());
    }

    #[test]
    fn connection_is_only_available_after_start() {
        let dir = tempfile::tempdir().unwrap();
        let process = factory(dir.path(), PathBuf::from("/bin/true")).build(builder()).unwrap();
        assert!(process.connection().is_err());
    }
}
