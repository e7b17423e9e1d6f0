//! Kernel tracing engine backed by [bpftrace](https://github.com/bpftrace/bpftrace).
//!
//! Every attached program is a `bpftrace -f json -e <program>` child process.
//! bpftrace compiles the program, attaches it and then writes one JSON record
//! per line on its standard output:
//!
//! ```json
//! {"type": "attached_probes", "data": {"probes": 2}}
//! {"type": "printf", "data": "pid=1234 daddr=10.0.0.1 port=443\n"}
//! {"type": "lost_events", "data": {"events": 12}}
//! ```
//!
//! `printf` records are the raw events of the probe, `lost_events` records
//! report events dropped by the kernel.

use std::{
    io::{self, BufRead, BufReader},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, ChildStderr, ChildStdout, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use lineage_core::engine::{AttachedProgram, CompileError, PollError, TracingEngine};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::{prctl, signal::Signal},
    unistd::{getpid, getppid},
};
use serde::Deserialize;

/// Lines of standard error kept to explain a rejected program.
const MAX_REJECTION_LINES: usize = 64;

/// Runs probe programs through the `bpftrace` front-end.
#[derive(Debug, Clone)]
pub struct Bpftrace {
    path: PathBuf,
}

impl Bpftrace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for Bpftrace {
    fn default() -> Self {
        Self::new("bpftrace")
    }
}

impl TracingEngine for Bpftrace {
    fn compile_and_attach(&self, program: &str) -> Result<Box<dyn AttachedProgram>, CompileError> {
        let mut command = Command::new(&self.path);
        command
            .args(["-f", "json", "-e", program])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // The probe process is stopped by a signal that skips `Drop`: bpftrace
        // must not outlive the thread attaching it, or its probes stay attached.
        let parent = getpid();
        // SAFETY: prctl and getppid are async-signal-safe and allocate nothing.
        unsafe {
            command.pre_exec(move || {
                prctl::set_pdeathsig(Signal::SIGKILL)?;
                if getppid() != parent {
                    // the parent died before the death signal was armed
                    return Err(io::Error::from(Errno::ESRCH));
                }
                Ok(())
            });
        }
        let mut child = command.spawn().map_err(CompileError::Spawn)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CompileError::Spawn(io::Error::other("missing bpftrace pipes")));
        };

        let attached = Arc::new(AtomicBool::new(false));
        let stderr = forward_stderr(stderr, attached.clone());

        let mut program = BpftraceProgram {
            child,
            stdout: BufReader::new(stdout),
            pending: Vec::new(),
        };
        match program.wait_attached() {
            Ok(()) => {
                attached.store(true, Ordering::SeqCst);
                Ok(Box::new(program))
            }
            Err(err) => {
                drop(program);
                let message = stderr.join().unwrap_or_default();
                let message = if message.is_empty() {
                    err.to_string()
                } else {
                    message
                };
                Err(CompileError::Rejected(message))
            }
        }
    }
}

/// Drain standard error on a thread so bpftrace never blocks on it.
///
/// Before the program is attached the lines are kept for the rejection
/// message, after that they are logged.
fn forward_stderr(stderr: ChildStderr, attached: Arc<AtomicBool>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut kept = Vec::new();
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            if attached.load(Ordering::SeqCst) {
                log::warn!(target: "bpftrace", "{line}");
            } else if kept.len() < MAX_REJECTION_LINES {
                kept.push(line);
            }
        }
        kept.join("\n")
    })
}

/// A running bpftrace process. Dropping it detaches the program.
pub struct BpftraceProgram {
    child: Child,
    stdout: BufReader<ChildStdout>,
    /// Records read while waiting for the attachment.
    pending: Vec<Message>,
}

impl BpftraceProgram {
    fn wait_attached(&mut self) -> Result<(), PollError> {
        loop {
            match self.next_message()? {
                Message::Attached(probes) => {
                    log::debug!("bpftrace attached {probes} probes");
                    return Ok(());
                }
                message => self.pending.push(message),
            }
        }
    }

    /// Read the next record. Fails with [`PollError::Exited`] at end of output.
    fn next_message(&mut self) -> Result<Message, PollError> {
        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line)? == 0 {
                let status = self.child.wait()?;
                return Err(PollError::Exited(status));
            }
            if line.trim().is_empty() {
                continue;
            }
            match parse_message(&line) {
                Ok(message) => return Ok(message),
                Err(err) => log::warn!("Invalid bpftrace record {line:?}: {err}"),
            }
        }
    }

    /// Wait up to `timeout` for standard output to become readable.
    fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool, PollError> {
        if !self.stdout.buffer().is_empty() {
            return Ok(true);
        }
        let timeout = timeout
            .map(|timeout| timeout.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        let mut fds = [PollFd::new(self.stdout.get_ref(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(PollError::Io(io::Error::from(errno))),
        }
    }
}

impl AttachedProgram for BpftraceProgram {
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        on_event: &mut dyn FnMut(&[u8]),
        mut on_lost: Option<&mut dyn FnMut(u64)>,
    ) -> Result<(), PollError> {
        if !self.pending.is_empty() {
            for message in std::mem::take(&mut self.pending) {
                dispatch(message, on_event, on_lost.as_deref_mut());
            }
            return Ok(());
        }

        if !self.wait_readable(timeout)? {
            return Ok(());
        }
        loop {
            let message = self.next_message()?;
            dispatch(message, on_event, on_lost.as_deref_mut());
            // stop once what was already read is handled
            if self.stdout.buffer().is_empty() {
                return Ok(());
            }
        }
    }
}

impl Drop for BpftraceProgram {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn dispatch<'a, 'b>(
    message: Message,
    on_event: &mut dyn FnMut(&[u8]),
    on_lost: Option<&'a mut (dyn FnMut(u64) + 'b)>,
) {
    match message {
        Message::Event(data) => on_event(data.as_bytes()),
        Message::Lost(events) => {
            if let Some(on_lost) = on_lost {
                on_lost(events);
            }
        }
        Message::Attached(_) => {}
        Message::Other(kind) => log::debug!("Ignoring bpftrace {kind} record"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Message {
    Attached(u64),
    Event(String),
    Lost(u64),
    Other(String),
}

#[derive(Deserialize)]
struct Record {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct Count {
    #[serde(default)]
    events: u64,
    #[serde(default)]
    probes: u64,
}

fn parse_message(line: &str) -> Result<Message, serde_json::Error> {
    let record: Record = serde_json::from_str(line)?;
    let message = match record.kind.as_str() {
        "printf" => {
            let data = record.data.as_str().unwrap_or_default();
            Message::Event(data.trim_end_matches('\n').to_string())
        }
        "lost_events" => Message::Lost(serde_json::from_value::<Count>(record.data)?.events),
        "attached_probes" => {
            Message::Attached(serde_json::from_value::<Count>(record.data)?.probes)
        }
        _ => Message::Other(record.kind),
    };
    Ok(message)
}
