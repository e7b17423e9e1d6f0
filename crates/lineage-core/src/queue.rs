//! The [`OutputQueue`] carries serialized events from every probe to the single
//! consumer living in the main process.
//!
//! A queue starts out backed by an unbounded in-process channel. Probe processes
//! are forked from the main process, so each of them owns a copy of the queue:
//! before polling starts the supervisor [redirects](OutputQueue::redirect) that
//! copy to the write end of a pipe dedicated to the probe. From then on every push
//! writes one newline-terminated line to the pipe, and the main process forwards
//! those lines into the channel.

use std::{
    fs::File,
    io::Write,
    os::fd::OwnedFd,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::mpsc;

/// Describes a queue error.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("event queue is closed")]
    Closed,
    #[error("writing to the event pipe failed")]
    Pipe(#[from] std::io::Error),
}

enum Endpoint {
    Channel(mpsc::UnboundedSender<String>),
    Pipe(File),
}

/// Producer side of the event queue. Cheap to clone, every clone pushes to the
/// same endpoint.
#[derive(Clone)]
pub struct OutputQueue {
    endpoint: Arc<Mutex<Endpoint>>,
}

/// Consumer side of the event queue.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl OutputQueue {
    pub fn new() -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            endpoint: Arc::new(Mutex::new(Endpoint::Channel(tx))),
        };
        (queue, QueueReceiver { rx })
    }

    /// Push a serialized event. Never blocks on the in-process channel.
    pub fn push(&self, item: String) -> Result<(), QueueError> {
        let mut endpoint = self.endpoint();
        match &mut *endpoint {
            Endpoint::Channel(tx) => tx.send(item).map_err(|_| QueueError::Closed),
            Endpoint::Pipe(pipe) => {
                let mut line = item;
                line.push('\n');
                pipe.write_all(line.as_bytes())?;
                Ok(())
            }
        }
    }

    /// Send every following push of this process to `pipe` as a line.
    ///
    /// Only meant to be called inside a freshly forked probe process.
    pub fn redirect(&self, pipe: OwnedFd) {
        *self.endpoint() = Endpoint::Pipe(File::from(pipe));
    }

    /// A producer panicking mid-push leaves the endpoint usable.
    fn endpoint(&self) -> MutexGuard<'_, Endpoint> {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueueReceiver {
    /// Wait for the next item. Returns `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Take the next item if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}
