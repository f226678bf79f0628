use clap::{Args, Parser, Subcommand};
use jobq_client::RemoteQueueService;
use jobq_core::QueueService;
use jobq_worker::handler::{EchoHandler, SleepHandler};
use jobq_worker::signals::{self, Binding};
use jobq_worker::{
    CommandLauncher, HandlerRegistry, ProcessPoolWorker, Resume, SandboxPool, Supervisor,
    TaskPoolWorker, Worker, WorkerConfig, WorkerMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jobq-worker")]
#[command(about = "Job queue worker", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker pool
    Run(RunArgs),

    /// Run a single process-pool child
    #[command(hide = true)]
    Child(ChildArgs),
}

/// Settings shared by the parent and its children
#[derive(Args, Debug)]
struct Overrides {
    /// Queue service address
    #[arg(long)]
    queue_address: Option<String>,

    /// Queue to work on, repeat for several
    #[arg(short, long = "queue")]
    queues: Vec<String>,

    /// Seconds to sleep when no queue has work
    #[arg(long)]
    interval: Option<u64>,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,
}

impl Overrides {
    fn apply(&self, config: &mut WorkerConfig) {
        if let Some(address) = &self.queue_address {
            config.queue_address = address.clone();
        }
        if !self.queues.is_empty() {
            config.queues = self.queues.clone();
        }
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if self.log_json {
            config.log_json = true;
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Worker identity (hostname-pid if not provided)
    #[arg(long)]
    worker_name: Option<String>,

    #[arg(long, value_enum)]
    mode: Option<WorkerMode>,

    /// Concurrent tasks in task mode
    #[arg(short, long)]
    tasks: Option<usize>,

    /// Child processes in process mode
    #[arg(short, long)]
    workers: Option<usize>,

    /// Resume jobs still leased to this worker name
    #[arg(long)]
    resume: bool,

    #[arg(long)]
    sandbox_root: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut WorkerConfig) {
        self.overrides.apply(config);
        if let Some(name) = &self.worker_name {
            config.worker_name = Some(name.clone());
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(tasks) = self.tasks {
            config.tasks = tasks;
        }
        if let Some(workers) = self.workers {
            config.workers = Some(workers);
        }
        if self.resume {
            config.resume = true;
        }
        if let Some(root) = &self.sandbox_root {
            config.sandbox_root = root.clone();
        }
    }
}

#[derive(Args, Debug)]
struct ChildArgs {
    /// Working directory for every job this child runs
    #[arg(long)]
    sandbox: PathBuf,

    #[arg(long)]
    worker_name: String,

    /// Job to resume before polling, repeat for several
    #[arg(long = "resume")]
    resume: Vec<String>,

    #[command(flatten)]
    overrides: Overrides,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = WorkerConfig::load(cli.config.as_deref())?;
    match &cli.command {
        Command::Run(args) => args.apply(&mut config),
        Command::Child(args) => args.overrides.apply(&mut config),
    }

    init_tracing(config.log_json);

    let registry = HandlerRegistry::builder()
        .register("echo", EchoHandler)
        .register("sleep", SleepHandler::new(1000))
        .build()
        .install();
    tracing::info!("Registered handlers: {:?}", registry.klasses());

    if config.queues.is_empty() {
        tracing::warn!("No queues configured, the worker will only sleep");
    }

    let service: Arc<dyn QueueService> =
        Arc::new(RemoteQueueService::new(config.queue_address.clone()));

    match cli.command {
        Command::Run(_) => run_pool(config, cli.config, service, registry).await,
        Command::Child(args) => run_child(config, args, service, registry).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn run_pool(
    config: WorkerConfig,
    config_path: Option<String>,
    service: Arc<dyn QueueService>,
    registry: Arc<HandlerRegistry>,
) -> anyhow::Result<()> {
    let resume = if config.resume {
        Resume::Discover
    } else {
        Resume::None
    };
    let supervisor = Supervisor::new(service, config.worker_name(), config.queues.clone())
        .interval(config.interval())
        .resume(resume);

    let (worker, bindings): (Arc<dyn Worker>, Vec<Binding>) = match config.mode {
        WorkerMode::Task => {
            let worker =
                TaskPoolWorker::new(supervisor, registry, config.tasks, &config.sandbox_root)?;
            (Arc::new(worker), signals::task_pool_bindings())
        }
        WorkerMode::Process => {
            let launcher = CommandLauncher::current(child_args(&config, config_path.as_deref())?)?;
            let worker = ProcessPoolWorker::new(
                supervisor,
                Arc::new(launcher),
                config.workers(),
                config.sandbox_root.clone(),
            )?
            .shutdown_timeout(config.graceful_shutdown_timeout());
            (Arc::new(worker), signals::parent_bindings())
        }
    };

    serve(worker, &bindings).await
}

async fn run_child(
    config: WorkerConfig,
    args: ChildArgs,
    service: Arc<dyn QueueService>,
    registry: Arc<HandlerRegistry>,
) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(service, args.worker_name, config.queues.clone())
        .interval(config.interval())
        .resume(Resume::Jobs(args.resume));

    let sandboxes = SandboxPool::from_paths(vec![args.sandbox]);
    let worker = TaskPoolWorker::with_sandboxes(supervisor, registry, sandboxes)?;

    serve(Arc::new(worker), &signals::child_bindings()).await
}

/// Arguments that give a child the parent's resolved settings. Children run
/// inside their sandbox, so the config path is made absolute.
fn child_args(config: &WorkerConfig, config_path: Option<&str>) -> anyhow::Result<Vec<String>> {
    let mut args = Vec::new();
    if let Some(path) = config_path {
        let path = std::fs::canonicalize(path)?;
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }

    args.push("--queue-address".to_string());
    args.push(config.queue_address.clone());
    args.push("--interval".to_string());
    args.push(config.interval_secs.to_string());
    for queue in &config.queues {
        args.push("--queue".to_string());
        args.push(queue.clone());
    }
    if config.log_json {
        args.push("--log-json".to_string());
    }

    Ok(args)
}

async fn serve(worker: Arc<dyn Worker>, bindings: &[Binding]) -> anyhow::Result<()> {
    let listeners = signals::install(Arc::clone(&worker), bindings)?;

    let result = worker.run().await;

    worker.stop();
    for listener in listeners {
        let _ = listener.await;
    }

    result?;
    Ok(())
}
