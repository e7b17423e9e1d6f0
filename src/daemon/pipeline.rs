//! Event delivery inside the main process: forwarders move the lines written by
//! probe processes into the queue, the drain writes the queue to the sink.

use std::{io::Write, os::fd::OwnedFd};

use lineage_core::queue::{OutputQueue, QueueReceiver};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::unix::pipe,
};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("writing to the output failed")]
    Output(#[from] std::io::Error),
    #[error("event queue closed")]
    QueueClosed,
}

/// Push every line read from the event pipe of `probe` into `queue`, until the
/// probe process closes its end.
///
/// Must be called from within the tokio runtime.
pub async fn forward(probe: String, events: OwnedFd, queue: OutputQueue) {
    let receiver = match pipe::Receiver::from_owned_fd(events) {
        Ok(receiver) => receiver,
        Err(err) => {
            lineage_core::log_error(&format!("Reading events of probe {probe}"), err);
            return;
        }
    };

    let mut lines = BufReader::new(receiver).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if queue.push(line).is_err() {
                    log::debug!("Queue closed, stop forwarding events of probe {probe}");
                    return;
                }
            }
            Ok(None) => {
                log::debug!("Probe {probe} closed its event pipe");
                return;
            }
            Err(err) => {
                lineage_core::log_error(&format!("Reading events of probe {probe}"), err);
                return;
            }
        }
    }
}

/// Write every queued event to `sink`, one per line, flushing after each.
///
/// Only returns on failure: a write error, or every producer being gone.
pub async fn drain<W: Write>(rx: &mut QueueReceiver, sink: &mut W) -> Result<(), PipelineError> {
    while let Some(event) = rx.recv().await {
        writeln!(sink, "{event}")?;
        sink.flush()?;
    }
    Err(PipelineError::QueueClosed)
}
