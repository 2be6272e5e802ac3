// Entry point for the testfork worker process.
//
// The dispatcher spawns the worker with `--channel <socket> --name <display name>`
// followed by any extra arguments for the test command. The test framework and
// classpaths arrive through the environment. Exits 0 after a clean stop.

use clap::Parser;
use testfork_common::constants::return_code;
use testfork_common::{DispatcherSettings, HostContext};

use testfork_worker::worker::{channel_path, Worker, WorkerEnvironment};

#[derive(Parser, Debug)]
#[command(name = "testfork-worker", version, about = "testfork test worker")]
struct Args {
    /// Socket the dispatcher listens on.
    #[arg(long)]
    channel: String,

    /// Display name assigned by the dispatcher.
    #[arg(long)]
    name: String,

    /// Extra arguments passed to the test command before the class name.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra_args: Vec<String>,
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
    // stdout belongs to the dispatcher's console.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("{} starting.", args.name);
    tracing::info!("  channel = {}", args.channel);

    let result = async {
        let channel = channel_path(&args.channel)?;
        let environment = WorkerEnvironment::from_env()?;
        let context = HostContext::new("Worker", DispatcherSettings::default())?;
        Worker::new(context)
            .run_async(&channel, &args.name, environment, args.extra_args)
            .await
    }
    .await;

    match result {
        Ok(()) => return_code::SUCCESS,
        Err(e) => {
            tracing::error!("{} failed: {:#}", args.name, e);
            return_code::WORKER_ERROR
        }
    }
}
