//! One OS process per probe.
//!
//! Probe processes are forked from the main process, so this has to happen
//! while it is still single threaded: before the async runtime starts.

use std::{
    collections::BTreeMap,
    io,
    os::fd::OwnedFd,
    sync::{Mutex, MutexGuard, PoisonError},
};

use lineage_core::{pdk::ProbeInstance, queue::OutputQueue};
use nix::{
    errno::Errno,
    sys::{
        signal::{self, SigHandler, SigSet, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use thiserror::Error;

/// Signals handled by the main process only.
pub const HANDLED_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

pub fn handled_signals() -> SigSet {
    let mut set = SigSet::empty();
    for handled in HANDLED_SIGNALS {
        set.add(handled);
    }
    set
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("creating the event pipe of probe {probe} failed")]
    Pipe {
        probe: String,
        #[source]
        source: io::Error,
    },
    #[error("blocking termination signals failed")]
    Block(#[source] Errno),
    #[error("forking the process of probe {probe} failed")]
    Fork {
        probe: String,
        #[source]
        source: Errno,
    },
}

#[derive(Debug, Clone, Copy)]
enum ProcessState {
    Running,
    /// Reaped with this status, or gone without one.
    Ended(Option<WaitStatus>),
}

/// A probe process started by [`spawn_probes`].
#[derive(Debug)]
pub struct ProcessRecord {
    name: String,
    pid: Pid,
    state: Mutex<ProcessState>,
}

impl ProcessRecord {
    pub fn new(name: impl Into<String>, pid: Pid) -> Self {
        Self {
            name: name.into(),
            pid,
            state: Mutex::new(ProcessState::Running),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Non blocking check. A process found dead is reaped and stays dead.
    pub fn is_alive(&self) -> bool {
        let mut state = self.state();
        if let ProcessState::Ended(_) = *state {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                log::debug!("Probe {} ({}) ended: {status:?}", self.name, self.pid);
                *state = ProcessState::Ended(Some(status));
                false
            }
            // stopped or continued
            Ok(_) => true,
            Err(Errno::EINTR) => true,
            Err(err) => {
                log::debug!("Waiting for probe {} ({}): {err}", self.name, self.pid);
                *state = ProcessState::Ended(None);
                false
            }
        }
    }

    /// How the process ended, once [`is_alive`](Self::is_alive) noticed it.
    pub fn exit_status(&self) -> Option<WaitStatus> {
        match *self.state() {
            ProcessState::Running => None,
            ProcessState::Ended(status) => status,
        }
    }

    fn state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the process to terminate. Does not wait for it.
    pub fn terminate(&self) {
        match signal::kill(self.pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => log::warn!("Cannot terminate probe {} ({}): {err}", self.name, self.pid),
        }
    }
}

/// A running probe process and the read end of its event pipe.
pub struct SpawnedProbe {
    pub record: ProcessRecord,
    pub events: OwnedFd,
}

/// Fork one process per probe. Each child redirects its copy of `queue` to a
/// dedicated pipe and polls its probe until it fails.
///
/// Must be called before any other thread is started. [`HANDLED_SIGNALS`] are
/// left blocked in the calling thread, so a termination request arriving
/// before the handlers are installed is kept pending instead of killing the
/// main process with its probes still running. See
/// [`TerminationSignals::install`](super::shutdown::TerminationSignals::install).
pub fn spawn_probes(
    probes: BTreeMap<String, ProbeInstance>,
    queue: &OutputQueue,
) -> Result<Vec<SpawnedProbe>, SupervisorError> {
    handled_signals()
        .thread_block()
        .map_err(SupervisorError::Block)?;

    let mut spawned: Vec<SpawnedProbe> = Vec::with_capacity(probes.len());

    for (name, probe) in probes {
        let (reader, writer) = io::pipe().map_err(|source| SupervisorError::Pipe {
            probe: name.clone(),
            source,
        })?;

        // SAFETY: the process is single threaded, the child only runs the
        // probe and exits.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                drop(reader);
                for other in spawned {
                    drop(other.events);
                }
                queue.redirect(writer.into());
                run_probe(probe);
            }
            Ok(ForkResult::Parent { child }) => {
                drop(writer);
                log::info!("Started probe {name} with pid {child}");
                spawned.push(SpawnedProbe {
                    record: ProcessRecord::new(name, child),
                    events: reader.into(),
                });
            }
            Err(source) => {
                for other in &spawned {
                    other.record.terminate();
                }
                return Err(SupervisorError::Fork { probe: name, source });
            }
        }
    }

    Ok(spawned)
}

/// Body of a probe process.
fn run_probe(probe: ProbeInstance) -> ! {
    for handled in HANDLED_SIGNALS {
        // SAFETY: restoring the default disposition installs no handler.
        if let Err(err) = unsafe { signal::signal(handled, SigHandler::SigDfl) } {
            log::warn!("Cannot reset {handled} handler: {err}");
        }
    }
    if let Err(err) = handled_signals().thread_unblock() {
        log::warn!("Cannot unblock termination signals: {err}");
    }

    let name = probe.name().to_string();
    let code = match probe.start_polling() {
        Ok(never) => match never {},
        Err(err) => {
            lineage_core::log_error(&format!("Probe {name} failed"), err);
            1
        }
    };
    std::process::exit(code)
}
