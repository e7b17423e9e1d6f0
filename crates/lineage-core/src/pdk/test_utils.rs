//! Test doubles for the probe development kit.
//!
//! [`ScriptedEngine`] stands in for the kernel tracing engine: each call to
//! `poll` replays the next [`PollStep`]. [`test_catalog`] registers a small set
//! of probes and plugins in the default packages.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_yaml::Value;

use super::{
    Catalog, EnrichError, EventEmitter, Plugin, PluginError, PluginRecipe, Probe, ProbeRecipe,
    ProbeSupport, ProgramSource, Settings, Sidecar, DEFAULT_PLUGIN_PATH, DEFAULT_PROBE_PATH,
};
use crate::{
    engine::{AttachedProgram, CompileError, PollError, TracingEngine},
    event::Event,
    template::Variables,
};

/// What a single `poll` call delivers.
#[derive(Debug, Clone, Default)]
pub struct PollStep {
    pub events: Vec<Vec<u8>>,
    pub lost: u64,
}

impl PollStep {
    /// Nothing happened before the timeout.
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn events<I, T>(events: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self {
            events: events.into_iter().map(|e| e.as_ref().to_vec()).collect(),
            lost: 0,
        }
    }

    pub fn lost(lost: u64) -> Self {
        Self {
            events: Vec::new(),
            lost,
        }
    }
}

/// A [`TracingEngine`] replaying a fixed script, then reporting
/// [`PollError::Exhausted`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    steps: Vec<PollStep>,
    reject: Option<String>,
    step_delay: Duration,
    attached: Arc<Mutex<Vec<String>>>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<PollStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// An engine refusing every program.
    pub fn rejecting(message: &str) -> Self {
        Self {
            reject: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Sleep before every step, like a real engine waiting for the kernel.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Programs attached so far.
    pub fn attached_programs(&self) -> Vec<String> {
        self.attached.lock().unwrap().clone()
    }
}

impl TracingEngine for ScriptedEngine {
    fn compile_and_attach(&self, program: &str) -> Result<Box<dyn AttachedProgram>, CompileError> {
        if let Some(message) = &self.reject {
            return Err(CompileError::Rejected(message.clone()));
        }
        self.attached.lock().unwrap().push(program.to_string());
        Ok(Box::new(ScriptedProgram {
            steps: self.steps.clone().into(),
            delay: self.step_delay,
        }))
    }
}

struct ScriptedProgram {
    steps: VecDeque<PollStep>,
    delay: Duration,
}

impl AttachedProgram for ScriptedProgram {
    fn poll(
        &mut self,
        _timeout: Option<Duration>,
        on_event: &mut dyn FnMut(&[u8]),
        on_lost: Option<&mut dyn FnMut(u64)>,
    ) -> Result<(), PollError> {
        let step = self.steps.pop_front().ok_or(PollError::Exhausted)?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(on_lost) = on_lost {
            if step.lost > 0 {
                on_lost(step.lost);
            }
        }
        for raw in &step.events {
            on_event(raw);
        }
        Ok(())
    }
}

/// A probe turning `key=value` records into events.
///
/// Config: `message` (string, default `hello`) is its only template variable
/// by default. `sidecar: true` starts a sidecar emitting `{sidecar: true}`
/// once. Records containing a `fail` key fail enrichment.
pub struct EchoProbe {
    program: ProgramSource,
    message: String,
    sidecar: bool,
}

impl EchoProbe {
    pub fn from_settings(settings: &Settings) -> Result<Self, EnrichError> {
        Ok(Self {
            program: ProgramSource::Inline("echo {message}"),
            message: settings.with_default("message", "hello".to_string())?,
            sidecar: settings.with_default("sidecar", false)?,
        })
    }

    pub fn from_file(path: PathBuf) -> Self {
        Self {
            program: ProgramSource::File(path),
            message: "hello".to_string(),
            sidecar: false,
        }
    }
}

impl Probe for EchoProbe {
    fn program(&self) -> ProgramSource {
        self.program.clone()
    }

    fn config_defaults(&self) -> Variables {
        Variables::from([("message".to_string(), Value::from(self.message.as_str()))])
    }

    fn enrich_event(&self, raw: &[u8]) -> Result<Option<Event>, EnrichError> {
        let event = Event::from_key_values(&String::from_utf8_lossy(raw));
        if event.contains_key("fail") {
            return Err("cannot enrich record".into());
        }
        Ok(Some(event))
    }

    fn sidecars(&self) -> Vec<Sidecar> {
        if !self.sidecar {
            return Vec::new();
        }
        vec![Box::new(|emitter: EventEmitter| {
            if let Err(err) = emitter.emit(Event::new().with("sidecar", true)) {
                log::warn!("sidecar: {err}");
            }
        })]
    }
}

pub fn echo_probe(name: &'static str) -> ProbeRecipe {
    ProbeRecipe::new(name, |settings: &Settings| EchoProbe::from_settings(settings))
}

/// Appends `suffix` (default `+`) to the `trail` field.
struct Append(String);

impl Plugin for Append {
    fn process(&self, mut event: Event) -> Result<Event, PluginError> {
        let mut trail = event
            .get("trail")
            .and_then(|trail| trail.as_str())
            .unwrap_or_default()
            .to_string();
        trail.push_str(&self.0);
        event.insert("trail".to_string(), trail.into());
        Ok(event)
    }
}

pub fn append_plugin(name: &'static str, probe_support: ProbeSupport) -> PluginRecipe {
    PluginRecipe::new(name, probe_support, |settings: &Settings| {
        Ok(Append(settings.with_default("suffix", "+".to_string())?))
    })
}

/// Uppercases the `trail` field.
struct Shout;

impl Plugin for Shout {
    fn process(&self, mut event: Event) -> Result<Event, PluginError> {
        if let Some(trail) = event.get("trail").and_then(|trail| trail.as_str()) {
            let trail = trail.to_uppercase();
            event.insert("trail".to_string(), trail.into());
        }
        Ok(event)
    }
}

/// Fails on events with a `drop` field.
struct Dropper;

impl Plugin for Dropper {
    fn process(&self, event: Event) -> Result<Event, PluginError> {
        if event.contains_key("drop") {
            return Err("event marked for drop".into());
        }
        Ok(event)
    }
}

/// Catalog with the `echo` probe and the `append`, `shout`, `dropper`,
/// `tcp_only` (supports `tcp_connect` only) and `broken` (setup always fails)
/// plugins.
pub fn test_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    let plugins = [
        append_plugin("append", ProbeSupport::Any),
        append_plugin("tcp_only", ProbeSupport::Only(&["tcp_connect"])),
        PluginRecipe::new("shout", ProbeSupport::Any, |_: &Settings| Ok(Shout)),
        PluginRecipe::new("dropper", ProbeSupport::Any, |_: &Settings| Ok(Dropper)),
        PluginRecipe::new("broken", ProbeSupport::Any, |_: &Settings| {
            Err::<Shout, PluginError>("broken on purpose".into())
        }),
    ];

    // names are unique, registration cannot fail
    catalog
        .register_probe(DEFAULT_PROBE_PATH, echo_probe("echo"))
        .unwrap();
    for plugin in plugins {
        catalog.register_plugin(DEFAULT_PLUGIN_PATH, plugin).unwrap();
    }
    catalog
}
