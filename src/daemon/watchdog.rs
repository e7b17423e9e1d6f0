//! Periodic health check of the probe processes and of the output sink.

use std::{fmt, os::fd::OwnedFd, sync::Arc, time::Duration};

use nix::{
    poll::{poll, PollFd, PollFlags},
    sys::signal::{self, Signal},
    unistd::getpid,
};

use super::{shutdown::ExitStatus, supervisor::ProcessRecord};

pub const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Why the run cannot go on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    BrokenOutput,
    ProbeTerminated(String),
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokenOutput => write!(f, "Broken output file"),
            Self::ProbeTerminated(name) => write!(f, "Probe {name} terminated unexpectedly"),
        }
    }
}

type Escalation = Box<dyn FnOnce() + Send>;

pub struct HealthWatchdog {
    processes: Arc<[ProcessRecord]>,
    sink: OwnedFd,
    status: ExitStatus,
    period: Duration,
    escalation: Escalation,
}

impl HealthWatchdog {
    /// `sink` is a duplicate of the output descriptor, it is only polled.
    pub fn new(processes: Arc<[ProcessRecord]>, sink: OwnedFd, status: ExitStatus) -> Self {
        Self {
            processes,
            sink,
            status,
            period: HEALTH_CHECK_PERIOD,
            escalation: Box::new(terminate_self),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Replace the default escalation, a SIGTERM to the current process.
    pub fn with_escalation(mut self, escalation: impl FnOnce() + Send + 'static) -> Self {
        self.escalation = Box::new(escalation);
        self
    }

    /// A single check: the sink first, then every process in order.
    pub fn check(&self) -> Result<(), HealthFailure> {
        if sink_is_broken(&self.sink) {
            return Err(HealthFailure::BrokenOutput);
        }
        match self.processes.iter().find(|process| !process.is_alive()) {
            Some(process) => Err(HealthFailure::ProbeTerminated(process.name().to_string())),
            None => Ok(()),
        }
    }

    /// Check every period until the first failure, escalate once and return.
    pub async fn run(self) -> HealthFailure {
        let mut interval = tokio::time::interval(self.period);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(failure) = self.check() {
                self.status.fail();
                log::error!("{failure}, exiting");
                (self.escalation)();
                return failure;
            }
            log::trace!("Health check passed");
        }
    }
}

/// Zero timeout poll, looking for an error condition on the descriptor.
fn sink_is_broken(sink: &OwnedFd) -> bool {
    let mut fds = [PollFd::new(sink, PollFlags::empty())];
    match poll(&mut fds, 0) {
        Ok(0) => false,
        Ok(_) => fds[0].revents().is_some_and(|revents| {
            revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
        }),
        Err(err) => {
            log::debug!("Polling the output failed: {err}");
            false
        }
    }
}

fn terminate_self() {
    if let Err(err) = signal::kill(getpid(), Signal::SIGTERM) {
        log::error!("Cannot terminate lineage: {err}");
    }
}
