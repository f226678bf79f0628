use crate::metrics::WorkerMetrics;
use crate::supervisor::{Supervisor, Worker};
use crate::{Result, WorkerError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use jobq_core::JobId;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Split `items` into `k` contiguous shares whose sizes differ by at most
/// one, the larger shares first
pub fn divide<T>(items: Vec<T>, k: usize) -> Vec<Vec<T>> {
    let k = k.max(1);
    let base = items.len() / k;
    let extra = items.len() % k;

    let mut items = items.into_iter();
    (0..k)
        .map(|i| {
            let size = base + usize::from(i < extra);
            items.by_ref().take(size).collect()
        })
        .collect()
}

/// What a child process is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub index: usize,
    pub worker_name: String,
    pub sandbox: PathBuf,
    /// Jobs the child resumes before polling
    pub resume: Vec<JobId>,
}

pub struct SpawnedChild {
    pub pid: u32,
    /// Resolves when the child exits
    pub exit: BoxFuture<'static, io::Result<ExitStatus>>,
}

/// Starts and signals child processes
pub trait ChildLauncher: Send + Sync {
    fn launch(&self, spec: &ChildSpec) -> io::Result<SpawnedChild>;

    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()>;
}

/// Re-executes a worker binary with its `child` subcommand
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    /// `args` are appended after the child's own arguments
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        CommandLauncher {
            program: program.into(),
            args,
        }
    }

    /// Launcher for the running executable
    pub fn current(args: Vec<String>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl ChildLauncher for CommandLauncher {
    fn launch(&self, spec: &ChildSpec) -> io::Result<SpawnedChild> {
        std::fs::create_dir_all(&spec.sandbox)?;
        let sandbox = spec.sandbox.canonicalize()?;

        let mut command = Command::new(&self.program);
        command
            .arg("child")
            .arg("--sandbox")
            .arg(&sandbox)
            .arg("--worker-name")
            .arg(&spec.worker_name);
        for jid in &spec.resume {
            command.arg("--resume").arg(jid);
        }
        command
            .args(&self.args)
            .current_dir(&sandbox)
            .kill_on_drop(false);

        let mut child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "child exited before reporting its pid")
        })?;

        Ok(SpawnedChild {
            pid,
            exit: Box::pin(async move { child.wait().await }),
        })
    }

    fn signal(&self, pid: u32, signal: Signal) -> nix::Result<()> {
        kill(Pid::from_raw(pid as i32), signal)
    }
}

#[derive(Debug, Clone)]
struct ChildEntry {
    index: usize,
    sandbox: PathBuf,
}

type Exit = (u32, io::Result<ExitStatus>);

/// Runs jobs in child processes, one per sandbox.
///
/// The startup resumable jobs are divided once among the children. A child
/// that exits while the pool is running is replaced right away with a child
/// bound to the same sandbox and no resumable jobs.
pub struct ProcessPoolWorker {
    supervisor: Supervisor,
    launcher: Arc<dyn ChildLauncher>,
    workers: usize,
    sandbox_root: PathBuf,
    shutdown_timeout: Duration,
    children: Mutex<HashMap<u32, ChildEntry>>,
    metrics: Arc<WorkerMetrics>,
}

impl ProcessPoolWorker {
    pub fn new(
        supervisor: Supervisor,
        launcher: Arc<dyn ChildLauncher>,
        workers: usize,
        sandbox_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(ProcessPoolWorker {
            supervisor,
            launcher,
            workers: workers.max(1),
            sandbox_root: sandbox_root.into(),
            shutdown_timeout: Duration::from_secs(60),
            children: Mutex::new(HashMap::new()),
            metrics: Arc::new(WorkerMetrics::new()?),
        })
    }

    /// How long children get to exit after SIGTERM before SIGKILL
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn sandbox_path(&self, index: usize) -> PathBuf {
        self.sandbox_root.join(format!("sandbox-{}", index))
    }

    pub fn child_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.children.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    fn take_child(&self, pid: u32) -> Option<ChildEntry> {
        self.children.lock().remove(&pid)
    }

    fn spawn_child(
        &self,
        index: usize,
        sandbox: PathBuf,
        resume: Vec<JobId>,
        exits: &mpsc::UnboundedSender<Exit>,
    ) -> io::Result<u32> {
        let spec = ChildSpec {
            index,
            worker_name: self.supervisor.worker_name().to_string(),
            sandbox,
            resume,
        };

        let child = self.launcher.launch(&spec)?;
        let pid = child.pid;
        info!(
            "Started child {} in {} with {} resumable jobs",
            pid,
            spec.sandbox.display(),
            spec.resume.len()
        );
        self.children.lock().insert(
            pid,
            ChildEntry {
                index,
                sandbox: spec.sandbox,
            },
        );

        let exits = exits.clone();
        tokio::spawn(async move {
            let status = child.exit.await;
            let _ = exits.send((pid, status));
        });

        Ok(pid)
    }

    async fn resume_ids(&self) -> Vec<JobId> {
        match self.supervisor.take_resume().await {
            Ok(jobs) => jobs.iter().map(|job| job.jid().to_string()).collect(),
            Err(e) => {
                warn!("Could not load resumable jobs: {}", e);
                Vec::new()
            }
        }
    }

    async fn shutdown_children(&self, exits: &mut mpsc::UnboundedReceiver<Exit>) {
        let pids = self.child_pids();
        info!("Stopping {} children", pids.len());
        for pid in pids {
            if let Err(e) = self.launcher.signal(pid, Signal::SIGTERM) {
                warn!("Failed to signal child {}: {}", pid, e);
            }
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        self.join_children(exits, Some(deadline)).await;

        let stragglers = self.child_pids();
        if stragglers.is_empty() {
            return;
        }

        warn!("Killing {} children that did not exit in time", stragglers.len());
        for pid in stragglers {
            if let Err(e) = self.launcher.signal(pid, Signal::SIGKILL) {
                warn!("Failed to kill child {}: {}", pid, e);
            }
        }
        self.join_children(exits, None).await;
    }

    async fn join_children(
        &self,
        exits: &mut mpsc::UnboundedReceiver<Exit>,
        deadline: Option<Instant>,
    ) {
        while self.child_count() > 0 {
            let exit = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, exits.recv()).await {
                    Ok(exit) => exit,
                    Err(_) => return,
                },
                None => exits.recv().await,
            };

            let Some((pid, status)) = exit else { return };
            if self.take_child(pid).is_none() {
                continue;
            }
            match status {
                Ok(status) => info!("Child {} exited with {}", pid, status),
                Err(e) => warn!("Failed to wait for child {}: {}", pid, e),
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessPoolWorker {
    fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    async fn run(&self) -> Result<()> {
        let shutdown = self.supervisor.shutdown_token();
        let (exits_tx, mut exits) = mpsc::unbounded_channel();

        let shares = divide(self.resume_ids().await, self.workers);
        let mut unstarted = 0;
        for (index, share) in shares.into_iter().enumerate() {
            if let Err(e) = self.spawn_child(index, self.sandbox_path(index), share, &exits_tx) {
                error!("Failed to start child {}: {}", index, e);
                unstarted += 1;
            }
        }

        // The pool only runs at full strength
        if unstarted > 0 {
            self.shutdown_children(&mut exits).await;
            return Err(WorkerError::ChildProcessFault(format!(
                "{} of {} children failed to start",
                unstarted, self.workers
            )));
        }

        loop {
            if self.child_count() == 0 {
                return Err(WorkerError::ChildProcessFault(
                    "no child processes left".to_string(),
                ));
            }

            let (pid, status) = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(exit) = exits.recv() => exit,
            };

            let Some(entry) = self.take_child(pid) else {
                continue;
            };
            let fault = match status {
                Ok(status) => format!("child {} exited with {}", pid, status),
                Err(e) => format!("lost track of child {}: {}", pid, e),
            };
            warn!("{}", WorkerError::ChildProcessFault(fault));

            if shutdown.is_cancelled() {
                break;
            }

            self.metrics.child_respawns_total.inc();
            if let Err(e) = self.spawn_child(entry.index, entry.sandbox, Vec::new(), &exits_tx) {
                error!("Failed to replace child {}: {}", pid, e);
            }
        }

        self.shutdown_children(&mut exits).await;
        info!("Worker {} stopped", self.supervisor.worker_name());
        Ok(())
    }

    fn kill(&self, jid: &str) {
        debug!("Ignoring kill for job {}: children handle their own jobs", jid);
    }

    fn introspect(&self, _verbose: bool) -> String {
        let mut report = String::new();
        let _ = writeln!(
            report,
            "Worker {} on {:?}",
            self.supervisor.worker_name(),
            self.supervisor.queue_names()
        );

        let children: Vec<(u32, ChildEntry)> = {
            let children = self.children.lock();
            children.iter().map(|(pid, entry)| (*pid, entry.clone())).collect()
        };
        for (pid, entry) in children {
            let _ = writeln!(report, "Child {} in {}", pid, entry.sandbox.display());
        }

        report.push_str(&self.metrics.render());
        report
    }
}
