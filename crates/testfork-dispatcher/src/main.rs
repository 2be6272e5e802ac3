// Entry point for the `testfork` command: runs test classes in forked worker
// processes and exits with a code summarising the run.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use testfork_common::constants::return_code;
use testfork_common::{ConfigurationStore, HostContext, Terminal, TestFrameworkSpec};
use testfork_sdk::{ClassPath, StringUtil};

use testfork_dispatcher::child_process::ChildProcessFactory;
use testfork_dispatcher::driver::{TestRunDriver, TestRunRequest};
use testfork_dispatcher::module_registry::StaticModuleRegistry;

#[derive(Parser, Debug)]
#[command(name = "testfork", version, about = "Run test classes in forked worker processes")]
struct Args {
    /// Settings file. Defaults to `.testfork.json` in the current directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Test command; each test class name is appended as its last argument.
    /// Falls back to `testCommand` from the settings file.
    #[arg(long)]
    command: Option<String>,

    /// Application classpath entry handed to every worker. Repeatable.
    #[arg(long = "classpath", value_name = "DIR")]
    class_path: Vec<PathBuf>,

    /// Maximum number of workers running at once.
    #[arg(long)]
    max_workers: Option<usize>,

    /// Test classes to run, in order.
    #[arg(required = true)]
    classes: Vec<String>,
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move { run(args).await });

    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("testfork dispatcher starting.");
    tracing::info!("  Version = {}", testfork_sdk::WorkerPackage::VERSION);
    tracing::info!("  Commit  = {}", testfork_sdk::Source::COMMIT_HASH);

    match execute(args).await {
        Ok(exit_code) => {
            tracing::info!("testfork exiting with code {}", exit_code);
            exit_code
        }
        Err(e) => {
            tracing::error!("testfork failed: {:#}", e);
            return_code::TERMINATED_ERROR
        }
    }
}

async fn execute(args: Args) -> Result<i32> {
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    let store = match args.config {
        Some(ref path) => ConfigurationStore::new(path),
        None => ConfigurationStore::in_directory(&cwd),
    };
    let mut settings = store.get_settings()?;
    if let Some(max_workers) = args.max_workers {
        settings.max_workers = max_workers;
    }

    let command = match args.command {
        Some(ref line) => StringUtil::split_command_line(line)?,
        None => settings.test_command.clone(),
    };
    anyhow::ensure!(
        !command.is_empty(),
        "No test command given; pass --command or set testCommand in {:?}",
        store.config_file_path()
    );

    let context = HostContext::new("Dispatcher", settings)?;
    let mut terminal = Terminal::new();
    terminal.initialize(&context);

    let factory = ChildProcessFactory::new(&context)?;
    let mut module_registry = StaticModuleRegistry::from_settings(context.settings());
    if let Some(dir) = factory.worker_executable().parent() {
        module_registry = module_registry.with_install_dir(dir);
    }

    let mut framework = TestFrameworkSpec::new(command);
    framework.working_directory = Some(cwd);

    let driver = TestRunDriver::new(
        Arc::clone(&context),
        Arc::new(factory),
        Arc::new(module_registry),
    );
    let outcome = driver
        .run(
            TestRunRequest {
                framework,
                class_path: args.class_path.into_iter().collect::<ClassPath>(),
                test_classes: args.classes,
            },
            terminal,
        )
        .await;

    if let Some(ref error) = outcome.error {
        tracing::error!("{}", error);
    }
    Ok(outcome.exit_code())
}
