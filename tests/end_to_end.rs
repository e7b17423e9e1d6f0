#![cfg(feature = "plugins")]

use std::{sync::Arc, thread};

use lineage::daemon::pipeline::{self, PipelineError};
use lineage_core::{
    pdk::{
        load_probes,
        test_utils::{echo_probe, PollStep, ScriptedEngine},
        LoadOptions, ProbesConfig, DEFAULT_PROBE_PATH,
    },
    queue::OutputQueue,
};
use serde_json::{json, Value};

const CONFIG: &str = r#"
_defaults: &defaults
  enabled: true
echo:
  <<: *defaults
  plugins:
    identityplugin:
"#;

#[tokio::test]
async fn events_reach_the_output_in_order() {
    let mut catalog = lineage::catalog().unwrap();
    catalog
        .register_probe(DEFAULT_PROBE_PATH, echo_probe("echo"))
        .unwrap();

    let engine = ScriptedEngine::new(vec![
        PollStep::events(["pid=10 port=22"]),
        PollStep::idle(),
        PollStep::events(["pid=11 port=80", "pid=12 port=443"]),
    ]);
    let (queue, mut rx) = OutputQueue::new();
    let options = LoadOptions::new(queue, Arc::new(engine.clone()));
    let config = ProbesConfig::from_yaml(CONFIG).unwrap();

    let mut probes = load_probes(&config, &catalog, &options).unwrap();
    assert_eq!(probes.len(), 1);
    let echo = probes.remove("echo").unwrap();
    assert_eq!(echo.plugin_count(), 1);
    drop(options);

    // the scripted engine runs dry after the last step
    let polling = thread::spawn(move || echo.start_polling());
    assert!(polling.join().unwrap().is_err());
    assert_eq!(engine.attached_programs(), vec!["echo hello"]);

    let mut sink = Vec::new();
    let result = pipeline::drain(&mut rx, &mut sink).await;
    assert!(matches!(result, Err(PipelineError::QueueClosed)));

    let output = String::from_utf8(sink).unwrap();
    let events: Vec<Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.len(), 3);

    for (event, (pid, port)) in events.iter().zip([(10, 22), (11, 80), (12, 443)]) {
        assert_eq!(event["pid"], json!(pid));
        assert_eq!(event["port"], json!(port));
        assert_eq!(event["probe"], json!("echo"));
        let timestamp = event["timestamp"].as_str().unwrap();
        assert!(timestamp.ends_with('Z'), "{timestamp}");
        assert!(is_iso8601_utc(timestamp), "{timestamp}");
    }
}

#[test]
fn unknown_plugin_aborts_the_load() {
    let mut catalog = lineage::catalog().unwrap();
    catalog
        .register_probe(DEFAULT_PROBE_PATH, echo_probe("echo"))
        .unwrap();
    let (queue, _rx) = OutputQueue::new();
    let options = LoadOptions::new(queue, Arc::new(ScriptedEngine::default()));

    let config = ProbesConfig::from_yaml("echo:\n  plugins:\n    nosuchplugin:\n").unwrap();
    let err = load_probes(&config, &catalog, &options).err().unwrap();
    let message = format!("{:#}", anyhow::Error::from(err));
    assert!(message.contains("lineage.plugins.nosuchplugin"), "{message}");

    let config = ProbesConfig::from_yaml(
        "echo:\n  plugins:\n    nosuchplugin:\n      unload_on_init_exception: true\n",
    )
    .unwrap();
    let probes = load_probes(&config, &catalog, &options).unwrap();
    assert_eq!(probes["echo"].plugin_count(), 0);
}

/// `YYYY-MM-DDTHH:MM:SS.mmm...Z`
fn is_iso8601_utc(timestamp: &str) -> bool {
    let bytes = timestamp.as_bytes();
    bytes.len() >= 24
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[10] == b'T'
        && bytes[13] == b':'
        && bytes[16] == b':'
        && bytes[19] == b'.'
}
