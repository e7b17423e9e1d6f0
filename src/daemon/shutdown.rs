//! Exit status bookkeeping and the reaction to termination signals.

use std::{
    io,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use tokio::signal::unix::{signal, Signal, SignalKind};

use super::supervisor::{self, ProcessRecord};

/// Process-wide exit code, `0` until something marks it as failed.
#[derive(Debug, Clone, Default)]
pub struct ExitStatus(Arc<AtomicI32>);

impl ExitStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.0.store(1, Ordering::SeqCst);
    }

    pub fn code(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.code() != 0
    }
}

/// SIGINT and SIGTERM listeners of the main process.
pub struct TerminationSignals {
    sig_int: Signal,
    sig_term: Signal,
}

impl TerminationSignals {
    /// Install the handlers, then let through the signals [`spawn_probes`]
    /// held back while forking: one received in between is delivered now.
    ///
    /// [`spawn_probes`]: super::spawn_probes
    pub fn install() -> io::Result<Self> {
        let signals = Self {
            sig_int: signal(SignalKind::interrupt())?,
            sig_term: signal(SignalKind::terminate())?,
        };
        supervisor::handled_signals().thread_unblock()?;
        Ok(signals)
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sig_int.recv() => log::trace!("SIGINT received"),
            _ = self.sig_term.recv() => log::trace!("SIGTERM received"),
        }
    }
}

/// Owns the probe processes and the exit status for the whole run.
pub struct TerminationCoordinator {
    processes: Arc<[ProcessRecord]>,
    status: ExitStatus,
}

impl TerminationCoordinator {
    pub fn new(processes: Arc<[ProcessRecord]>, status: ExitStatus) -> Self {
        Self { processes, status }
    }

    pub fn processes(&self) -> &Arc<[ProcessRecord]> {
        &self.processes
    }

    pub fn status(&self) -> &ExitStatus {
        &self.status
    }

    /// Wait for SIGINT or SIGTERM. The signal handler only wakes this task up,
    /// the reaction happens in [`terminate_all`](Self::terminate_all).
    pub async fn wait_for_signal(&self, signals: &mut TerminationSignals) {
        signals.recv().await;
        log::warn!("Caught termination signal, shutting off probes and exiting");
    }

    /// Ask every probe process to terminate, without waiting for them.
    pub fn terminate_all(&self) {
        for process in self.processes.iter() {
            process.terminate();
        }
    }

    /// Terminate every probe process and hand out the final exit code.
    pub fn finish(self) -> i32 {
        self.terminate_all();
        self.status.code()
    }
}
