//! The main process: it supervises one process per probe, writes their events
//! to the output and stops everything on the first failure.

use std::{os::fd::AsFd, time::Duration};

use anyhow::{Context, Result};
use lineage_core::queue::{OutputQueue, QueueReceiver};

pub mod output;
pub mod pipeline;
pub mod shutdown;
pub mod supervisor;
pub mod watchdog;

pub use output::OutputSink;
pub use shutdown::{ExitStatus, TerminationCoordinator, TerminationSignals};
pub use supervisor::{spawn_probes, ProcessRecord, SpawnedProbe};
pub use watchdog::{HealthFailure, HealthWatchdog, HEALTH_CHECK_PERIOD};

/// Deliver the events of the `spawned` probes to `sink` until a termination
/// signal or a pipeline failure, then terminate every probe process.
///
/// The watchdog checks the probes and the output every
/// `health_check_period`. Returns the exit code of the run.
pub async fn run_daemon(
    spawned: Vec<SpawnedProbe>,
    queue: OutputQueue,
    mut receiver: QueueReceiver,
    mut sink: OutputSink,
    health_check_period: Duration,
) -> Result<i32> {
    let mut signals = match TerminationSignals::install() {
        Ok(signals) => signals,
        Err(err) => {
            for probe in &spawned {
                probe.record.terminate();
            }
            return Err(err).context("Installing termination signal handlers");
        }
    };

    let mut processes = Vec::with_capacity(spawned.len());
    for SpawnedProbe { record, events } in spawned {
        tokio::spawn(pipeline::forward(
            record.name().to_string(),
            events,
            queue.clone(),
        ));
        processes.push(record);
    }

    let status = ExitStatus::new();
    let coordinator = TerminationCoordinator::new(processes.into(), status.clone());

    let sink_fd = match sink.as_fd().try_clone_to_owned() {
        Ok(fd) => fd,
        Err(err) => {
            coordinator.finish();
            return Err(err).context("Duplicating the output descriptor");
        }
    };
    let watchdog = HealthWatchdog::new(coordinator.processes().clone(), sink_fd, status.clone())
        .with_period(health_check_period);
    tokio::spawn(watchdog.run());

    tokio::select! {
        result = pipeline::drain(&mut receiver, &mut sink) => {
            if let Err(err) = result {
                status.fail();
                lineage_core::log_error("Encountered unexpected error", err);
            }
        }
        _ = coordinator.wait_for_signal(&mut signals) => {}
    }

    // held until here so dead probes are reported by the watchdog, not the drain
    drop(queue);
    Ok(coordinator.finish())
}
