//! Contract of the kernel tracing engine.
//!
//! The engine compiles the textual program of a probe, attaches it to the kernel
//! and exposes the resulting stream of raw events. Lineage only relies on the two
//! traits below; the `bpftrace-engine` crate provides the implementation used by
//! the daemon.

use std::{io, process::ExitStatus, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("tracing program rejected: {0}")]
    Rejected(String),
    #[error("starting the tracing engine failed")]
    Spawn(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("tracing engine exited ({0})")]
    Exited(ExitStatus),
    #[error("no more events")]
    Exhausted,
    #[error("reading from the tracing engine failed")]
    Io(#[from] io::Error),
}

/// Compiles probe programs and attaches them to kernel hook points.
pub trait TracingEngine: Send + Sync {
    fn compile_and_attach(&self, program: &str) -> Result<Box<dyn AttachedProgram>, CompileError>;
}

/// A program attached to the kernel. Dropping it detaches the program.
pub trait AttachedProgram: Send {
    /// Block until at least one raw event has been delivered to `on_event`, or
    /// until `timeout` elapses. When given, `on_lost` receives the number of
    /// events the kernel had to drop because its buffer was full.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        on_event: &mut dyn FnMut(&[u8]),
        on_lost: Option<&mut dyn FnMut(u64)>,
    ) -> Result<(), PollError>;
}
