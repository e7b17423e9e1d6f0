//! The watchdog stops the run by signaling the main process. Kept apart from
//! the other tests so that signal reaches no other run.

use std::{io, process::Command, time::Duration};

use lineage::daemon::{run_daemon, OutputSink, ProcessRecord, SpawnedProbe};
use lineage_core::queue::OutputQueue;
use nix::{
    sys::{
        signal::Signal,
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};

fn child_probe(name: &str, command: &mut Command) -> (SpawnedProbe, Pid, io::PipeWriter) {
    let child = command.spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);
    let (events, writer) = io::pipe().unwrap();
    let probe = SpawnedProbe {
        record: ProcessRecord::new(name, pid),
        events: events.into(),
    };
    (probe, pid, writer)
}

#[tokio::test]
async fn dead_probe_terminates_the_run() {
    let (sleeper, sleeper_pid, _sleeper_events) =
        child_probe("sleeper", Command::new("sleep").arg("60"));
    let (quitter, _, _quitter_events) = child_probe("quitter", &mut Command::new("true"));

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("events.log");
    let sink = OutputSink::open(output.to_str().unwrap()).unwrap();
    let (queue, receiver) = OutputQueue::new();

    let code = tokio::time::timeout(
        Duration::from_secs(10),
        run_daemon(
            vec![sleeper, quitter],
            queue,
            receiver,
            sink,
            Duration::from_millis(100),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(code, 1);
    assert_eq!(
        waitpid(sleeper_pid, None).unwrap(),
        WaitStatus::Signaled(sleeper_pid, Signal::SIGTERM, false)
    );
}
