//! Forks a real probe process. Kept as the only test of this binary so the
//! fork happens with no other test thread running.

use std::{sync::Arc, thread, time::Duration};

use lineage::daemon::{pipeline, spawn_probes, ExitStatus, HealthFailure, HealthWatchdog};
use lineage_core::{
    pdk::{
        load_probes,
        test_utils::{test_catalog, PollStep, ScriptedEngine},
        LoadOptions, ProbesConfig,
    },
    queue::OutputQueue,
};
use nix::sys::wait::WaitStatus;
use serde_json::{json, Value};

#[test]
fn probe_runs_in_its_own_process() {
    let engine = ScriptedEngine::new(vec![
        PollStep::events(["pid=1 step=1", "pid=1 step=2"]),
        PollStep::lost(7),
        PollStep::events(["pid=1 step=3"]),
    ]);
    let (queue, mut rx) = OutputQueue::new();
    let options = LoadOptions {
        lost_event_telemetry: 2,
        ..LoadOptions::new(queue.clone(), Arc::new(engine))
    };
    let config = ProbesConfig::from_yaml("echo:\n  plugins:\n    append:\n").unwrap();
    let probes = load_probes(&config, &test_catalog(), &options).unwrap();
    drop(options);

    let mut spawned = spawn_probes(probes, &queue).unwrap();
    assert_eq!(spawned.len(), 1);
    let probe = spawned.remove(0);
    assert_eq!(probe.record.name(), "echo");
    assert_ne!(probe.record.pid(), nix::unistd::getpid());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let lines: Vec<String> = runtime.block_on(async {
        tokio::spawn(pipeline::forward("echo".to_string(), probe.events, queue));
        let mut lines = Vec::new();
        while let Ok(Some(line)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            lines.push(line);
        }
        lines
    });

    let events: Vec<Value> = lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 4, "{lines:?}");
    assert_eq!(events[0]["step"], json!(1));
    assert_eq!(events[1]["step"], json!(2));
    // second poll iteration: telemetry, not processed by plugins
    assert_eq!(events[2]["type"], json!("lost_event_telemetry"));
    assert_eq!(events[2]["count"], json!(7));
    assert_eq!(events[2].get("trail"), None);
    assert_eq!(events[3]["step"], json!(3));
    for event in [&events[0], &events[1], &events[3]] {
        assert_eq!(event["probe"], json!("echo"));
        assert_eq!(event["trail"], json!("+"));
    }

    // the scripted engine ran dry: the probe process fails
    let mut alive = true;
    for _ in 0..250 {
        alive = probe.record.is_alive();
        if !alive {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!alive);
    assert!(matches!(
        probe.record.exit_status(),
        Some(WaitStatus::Exited(_, 1))
    ));

    let (_reader, sink) = std::io::pipe().unwrap();
    let watchdog = HealthWatchdog::new(Arc::from(vec![probe.record]), sink.into(), ExitStatus::new());
    assert_eq!(
        watchdog.check(),
        Err(HealthFailure::ProbeTerminated("echo".to_string()))
    );
}
