//! Process signal bindings.
//!
//! Each binding gets its own listener task that lives until the worker's
//! shutdown token fires.

use crate::supervisor::Worker;
use crate::Result;
use std::backtrace::Backtrace;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Finish current work, take no new jobs
    GracefulStop,
    /// Report where the worker is without disturbing it
    StackDump,
    /// Full report including every in-flight job record
    #[cfg(feature = "debug-break")]
    DebugBreak,
}

#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub name: &'static str,
    pub kind: SignalKind,
    pub action: SignalAction,
}

impl Binding {
    pub fn new(name: &'static str, kind: SignalKind, action: SignalAction) -> Self {
        Binding { name, kind, action }
    }
}

/// Signals handled by a task pool running as the top-level worker
pub fn task_pool_bindings() -> Vec<Binding> {
    let mut bindings = vec![
        Binding::new("SIGQUIT", SignalKind::quit(), SignalAction::GracefulStop),
        Binding::new("SIGUSR1", SignalKind::user_defined1(), SignalAction::StackDump),
    ];
    #[cfg(feature = "debug-break")]
    bindings.push(Binding::new(
        "SIGUSR2",
        SignalKind::user_defined2(),
        SignalAction::DebugBreak,
    ));
    bindings
}

/// Signals handled by the parent of a process pool
pub fn parent_bindings() -> Vec<Binding> {
    vec![
        Binding::new("SIGTERM", SignalKind::terminate(), SignalAction::GracefulStop),
        Binding::new("SIGINT", SignalKind::interrupt(), SignalAction::GracefulStop),
        Binding::new("SIGQUIT", SignalKind::quit(), SignalAction::GracefulStop),
        Binding::new("SIGUSR1", SignalKind::user_defined1(), SignalAction::StackDump),
    ]
}

/// Signals handled by a process pool child
pub fn child_bindings() -> Vec<Binding> {
    vec![
        Binding::new("SIGTERM", SignalKind::terminate(), SignalAction::GracefulStop),
        Binding::new("SIGINT", SignalKind::interrupt(), SignalAction::GracefulStop),
        Binding::new("SIGQUIT", SignalKind::quit(), SignalAction::GracefulStop),
    ]
}

/// Register `bindings` for `worker`. Listeners exit once the worker stops.
pub fn install(worker: Arc<dyn Worker>, bindings: &[Binding]) -> Result<Vec<JoinHandle<()>>> {
    let shutdown = worker.supervisor().shutdown_token();
    let mut handles = Vec::with_capacity(bindings.len());

    for binding in bindings.iter().copied() {
        let mut stream = signal(binding.kind)?;
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();

        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = stream.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!("Received {}", binding.name);
                        apply(worker.as_ref(), binding.action);
                    }
                }
            }
        }));
    }

    Ok(handles)
}

/// Carry out `action` on `worker`
pub fn apply(worker: &dyn Worker, action: SignalAction) {
    match action {
        SignalAction::GracefulStop => worker.stop(),
        SignalAction::StackDump => {
            let report = format!(
                "Stack:\n{}\n{}",
                Backtrace::force_capture(),
                worker.introspect(false)
            );
            warn!("{}", report);
            eprintln!("{}", report);
        }
        #[cfg(feature = "debug-break")]
        SignalAction::DebugBreak => {
            let report = worker.introspect(true);
            warn!("{}", report);
            eprintln!("{}", report);
        }
    }
}
