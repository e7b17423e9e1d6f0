use std::{
    collections::BTreeMap, convert::Infallible, io, path::PathBuf, sync::Arc, thread,
    time::Duration,
};

use thiserror::Error;

use super::{
    config::{ConfigError, ProbesConfig, Settings},
    plugin::{load_plugins, PluginChain, PluginLoadError},
    registry::{Catalog, ComponentName, DiscoveryError},
    telemetry::LostEventTelemetry,
};
use crate::{
    engine::{AttachedProgram, CompileError, PollError, TracingEngine},
    event::Event,
    queue::{OutputQueue, QueueError},
    template::{self, TemplateError, Variables},
};

/// Poll timeout used while lost event telemetry is enabled, so the countdown
/// advances even when no event arrives.
pub const TELEMETRY_POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub type ProbeError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type EnrichError = ProbeError;

/// Unsupervised helper started next to the poll loop of a probe.
pub type Sidecar = Box<dyn FnOnce(EventEmitter) + Send + 'static>;

/// Where the program template of a probe comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSource {
    Inline(&'static str),
    File(PathBuf),
}

pub trait Probe: Send + Sync {
    fn program(&self) -> ProgramSource;

    /// Template variables used when the configuration doesn't set them.
    fn config_defaults(&self) -> Variables {
        Variables::new()
    }

    /// Restrict the template variables to exactly these keys.
    fn template_vars(&self) -> Option<&'static [&'static str]> {
        None
    }

    /// Turn a raw event into an [`Event`]. `None` drops the event.
    fn enrich_event(&self, raw: &[u8]) -> Result<Option<Event>, EnrichError>;

    fn sidecars(&self) -> Vec<Sidecar> {
        Vec::new()
    }
}

pub type ProbeSetupFn = dyn Fn(&Settings) -> Result<Box<dyn Probe>, ProbeError> + Send + Sync;

/// Contains the informations to identify a probe and the recipe to build it.
///
/// The setup function validates the configuration. It must not touch any kernel
/// resource.
pub struct ProbeRecipe {
    pub name: ComponentName,
    pub setup_fn: Box<ProbeSetupFn>,
}

impl ProbeRecipe {
    pub fn new<N, F, P>(name: N, setup_fn: F) -> Self
    where
        N: Into<ComponentName>,
        F: Fn(&Settings) -> Result<P, ProbeError>,
        F: Send + Sync + 'static,
        P: Probe + 'static,
    {
        Self {
            name: name.into(),
            setup_fn: Box::new(move |settings| {
                let probe = setup_fn(settings)?;
                Ok(Box::new(probe) as Box<dyn Probe>)
            }),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProbeLoadError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("invalid configuration for probe {probe}")]
    Config {
        probe: String,
        #[source]
        source: ConfigError,
    },
    #[error("invalid configuration for probe {probe}")]
    Setup {
        probe: String,
        #[source]
        source: ProbeError,
    },
    #[error("reading program of probe {probe} from {path} failed")]
    ProgramFile {
        probe: String,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("template variable {variable} of probe {probe} is not set")]
    MissingVariable { probe: String, variable: String },
    #[error("rendering program of probe {probe} failed")]
    Template {
        probe: String,
        #[source]
        source: TemplateError,
    },
    #[error("loading plugins of probe {probe} failed")]
    Plugins {
        probe: String,
        #[source]
        source: PluginLoadError,
    },
}

#[derive(Error, Debug)]
pub enum ProbeRunError {
    #[error("attaching program of probe {probe} failed")]
    Compile {
        probe: String,
        #[source]
        source: CompileError,
    },
    #[error("polling probe {probe} failed")]
    Poll {
        probe: String,
        #[source]
        source: PollError,
    },
    #[error("probe {probe} cannot deliver events")]
    Queue {
        probe: String,
        #[source]
        source: QueueError,
    },
}

/// Delivers the events of one probe: stamping, plugin chain, queue.
#[derive(Clone)]
pub struct EventEmitter {
    probe_name: ComponentName,
    plugins: Arc<PluginChain>,
    queue: OutputQueue,
}

impl EventEmitter {
    pub fn new(probe_name: ComponentName, plugins: PluginChain, queue: OutputQueue) -> Self {
        Self {
            probe_name,
            plugins: Arc::new(plugins),
            queue,
        }
    }

    pub fn probe_name(&self) -> &str {
        &self.probe_name
    }

    /// Stamp `event`, run it through the plugin chain and queue it.
    ///
    /// A failing plugin only drops this event. Only a queue failure is an error.
    pub fn emit(&self, mut event: Event) -> Result<(), QueueError> {
        event.stamp(&self.probe_name);
        match self.plugins.apply(event) {
            Ok(event) => self.push(&event),
            Err(err) => {
                log::warn!("Dropping event of probe {}: {err}", self.probe_name);
                Ok(())
            }
        }
    }

    /// Queue a stamped telemetry event, bypassing the plugin chain.
    pub fn emit_telemetry(&self, count: u64) -> Result<(), QueueError> {
        let mut event = Event::lost_event_telemetry(count);
        event.stamp(&self.probe_name);
        self.push(&event)
    }

    fn push(&self, event: &Event) -> Result<(), QueueError> {
        match event.serialize() {
            Ok(line) => self.queue.push(line),
            Err(err) => {
                log::warn!("Cannot serialize event of probe {}: {err}", self.probe_name);
                Ok(())
            }
        }
    }
}

/// Settings shared by every probe of a [`load_probes`] call.
#[derive(Clone)]
pub struct LoadOptions {
    pub queue: OutputQueue,
    pub engine: Arc<dyn TracingEngine>,
    pub extra_probe_path: Option<String>,
    pub extra_plugin_path: Option<String>,
    /// Poll iterations between two telemetry events, `<= 0` disables them.
    pub lost_event_telemetry: i64,
}

impl LoadOptions {
    pub fn new(queue: OutputQueue, engine: Arc<dyn TracingEngine>) -> Self {
        Self {
            queue,
            engine,
            extra_probe_path: None,
            extra_plugin_path: None,
            lost_event_telemetry: -1,
        }
    }
}

/// A configured probe, ready to be run inside its own process.
pub struct ProbeInstance {
    name: ComponentName,
    program_text: String,
    probe: Box<dyn Probe>,
    emitter: EventEmitter,
    telemetry: LostEventTelemetry,
    engine: Arc<dyn TracingEngine>,
}

impl ProbeInstance {
    /// Render the program of `probe`. Nothing is attached to the kernel yet.
    pub fn new(
        name: ComponentName,
        probe: Box<dyn Probe>,
        settings: &Settings,
        plugins: PluginChain,
        options: &LoadOptions,
    ) -> Result<Self, ProbeLoadError> {
        let template = match probe.program() {
            ProgramSource::Inline(text) => text.to_string(),
            ProgramSource::File(path) => {
                std::fs::read_to_string(&path).map_err(|source| ProbeLoadError::ProgramFile {
                    probe: name.to_string(),
                    path: path.display().to_string(),
                    source,
                })?
            }
        };

        let variables = template_variables(&name, probe.as_ref(), settings)?;
        let program_text =
            template::render(&template, &variables).map_err(|source| ProbeLoadError::Template {
                probe: name.to_string(),
                source,
            })?;

        Ok(Self {
            emitter: EventEmitter::new(name.clone(), plugins, options.queue.clone()),
            name,
            program_text,
            probe,
            telemetry: LostEventTelemetry::new(options.lost_event_telemetry),
            engine: options.engine.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program_text(&self) -> &str {
        &self.program_text
    }

    pub fn plugin_count(&self) -> usize {
        self.emitter.plugins.len()
    }

    pub fn telemetry(&self) -> &LostEventTelemetry {
        &self.telemetry
    }

    /// Start the sidecars, attach the program and poll it forever.
    pub fn start_polling(mut self) -> Result<Infallible, ProbeRunError> {
        for (index, sidecar) in self.probe.sidecars().into_iter().enumerate() {
            let emitter = self.emitter.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-sidecar-{index}", self.name))
                .spawn(move || sidecar(emitter));
            if let Err(err) = spawned {
                crate::log_error(&format!("Starting sidecar of probe {}", self.name), err);
            }
        }

        let mut program = self.attach()?;
        log::info!("Probe {} attached", self.name);

        loop {
            self.poll_once(program.as_mut())?;
        }
    }

    pub fn attach(&self) -> Result<Box<dyn AttachedProgram>, ProbeRunError> {
        self.engine
            .compile_and_attach(&self.program_text)
            .map_err(|source| ProbeRunError::Compile {
                probe: self.name.to_string(),
                source,
            })
    }

    /// A single iteration of the poll loop.
    pub fn poll_once(&mut self, program: &mut dyn AttachedProgram) -> Result<(), ProbeRunError> {
        let telemetry_enabled = self.telemetry.enabled();
        let timeout = telemetry_enabled.then_some(TELEMETRY_POLL_TIMEOUT);

        let probe = self.probe.as_ref();
        let emitter = &self.emitter;
        let mut failure = None;
        let mut on_event = |raw: &[u8]| {
            if failure.is_none() {
                failure = handle_event(probe, emitter, raw).err();
            }
        };
        let telemetry = &mut self.telemetry;
        let mut on_lost = |lost: u64| telemetry.record_lost(lost);
        let on_lost: Option<&mut dyn FnMut(u64)> = if telemetry_enabled {
            Some(&mut on_lost)
        } else {
            None
        };

        let polled = program.poll(timeout, &mut on_event, on_lost);
        if let Some(source) = failure {
            return Err(self.queue_error(source));
        }
        polled.map_err(|source| ProbeRunError::Poll {
            probe: self.name.to_string(),
            source,
        })?;

        if let Some(count) = self.telemetry.tick() {
            self.emitter
                .emit_telemetry(count)
                .map_err(|source| self.queue_error(source))?;
        }
        Ok(())
    }

    fn queue_error(&self, source: QueueError) -> ProbeRunError {
        ProbeRunError::Queue {
            probe: self.name.to_string(),
            source,
        }
    }
}

fn handle_event(probe: &dyn Probe, emitter: &EventEmitter, raw: &[u8]) -> Result<(), QueueError> {
    match probe.enrich_event(raw) {
        Ok(Some(event)) if !event.is_empty() => emitter.emit(event),
        Ok(_) => Ok(()),
        Err(err) => {
            log::warn!(
                "Dropping event of probe {}: enrichment failed: {err}",
                emitter.probe_name()
            );
            Ok(())
        }
    }
}

/// Defaults, overlaid by the configuration, then either projected on the
/// declared variables or stripped of `plugins`.
fn template_variables(
    name: &str,
    probe: &dyn Probe,
    settings: &Settings,
) -> Result<Variables, ProbeLoadError> {
    let mut variables = probe.config_defaults();
    for (key, value) in settings.iter() {
        variables.insert(key.to_string(), value.clone());
    }

    match probe.template_vars() {
        Some(allowed) => allowed
            .iter()
            .map(|key| {
                variables
                    .remove(*key)
                    .map(|value| (key.to_string(), value))
                    .ok_or_else(|| ProbeLoadError::MissingVariable {
                        probe: name.to_string(),
                        variable: key.to_string(),
                    })
            })
            .collect(),
        None => {
            variables.remove("plugins");
            Ok(variables)
        }
    }
}

/// Build one [`ProbeInstance`] per enabled, non reserved entry of `config`.
///
/// Either every probe loads or the first error is returned.
pub fn load_probes(
    config: &ProbesConfig,
    catalog: &Catalog,
    options: &LoadOptions,
) -> Result<BTreeMap<String, ProbeInstance>, ProbeLoadError> {
    let mut probes = BTreeMap::new();

    for (name, settings) in config.probes() {
        let config_error = |source| ProbeLoadError::Config {
            probe: name.to_string(),
            source,
        };
        if !settings.enabled().map_err(config_error)? {
            log::info!("Probe {name} is disabled");
            continue;
        }

        let recipe = catalog.probe(name, options.extra_probe_path.as_deref())?;
        let probe = (recipe.setup_fn)(settings).map_err(|source| ProbeLoadError::Setup {
            probe: name.to_string(),
            source,
        })?;

        let plugins = settings.plugins().map_err(config_error)?;
        let plugins = load_plugins(
            &plugins,
            &recipe.name,
            catalog,
            options.extra_plugin_path.as_deref(),
        )
        .map_err(|source| ProbeLoadError::Plugins {
            probe: name.to_string(),
            source,
        })?;

        let instance = ProbeInstance::new(
            recipe.name.clone(),
            probe,
            settings,
            PluginChain::from(plugins),
            options,
        )?;
        log::debug!("Loaded probe {name}");
        probes.insert(name.to_string(), instance);
    }

    Ok(probes)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::{json, Value};

    use super::*;
    use crate::pdk::test_utils::{test_catalog, EchoProbe, PollStep, ScriptedEngine};

    fn options(engine: ScriptedEngine, telemetry: i64) -> (LoadOptions, crate::queue::QueueReceiver) {
        let (queue, rx) = OutputQueue::new();
        let mut options = LoadOptions::new(queue, Arc::new(engine));
        options.lost_event_telemetry = telemetry;
        (options, rx)
    }

    fn load(yaml: &str, options: &LoadOptions) -> Result<BTreeMap<String, ProbeInstance>, ProbeLoadError> {
        load_probes(&ProbesConfig::from_yaml(yaml).unwrap(), &test_catalog(), options)
    }

    fn drain(rx: &mut crate::queue::QueueReceiver) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv())
            .map(|line| serde_json::from_str(&line).unwrap())
            .collect()
    }

    #[test]
    fn empty_config_loads_nothing() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        assert!(load("", &options).unwrap().is_empty());
    }

    #[test]
    fn reserved_keys_are_ignored() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let probes = load(
            "_defaults: &defaults\n  message: hi\necho:\n  <<: *defaults\n",
            &options,
        )
        .unwrap();
        assert_eq!(probes.keys().collect::<Vec<_>>(), vec!["echo"]);
        assert_eq!(probes["echo"].program_text(), "echo hi");
    }

    #[test]
    fn disabled_probes_are_not_resolved() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let probes = load("unknown:\n  enabled: false\n", &options).unwrap();
        assert!(probes.is_empty());
    }

    #[test]
    fn unknown_probe_aborts_the_load() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let err = load("echo:\nunknown:\n", &options).err().unwrap();
        assert!(matches!(err, ProbeLoadError::Discovery(_)));
        assert!(err.to_string().contains("lineage.probes.unknown"));
    }

    #[test]
    fn setup_validates_configuration() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let err = load("echo:\n  message: [1, 2]\n", &options).err().unwrap();
        assert!(matches!(err, ProbeLoadError::Setup { ref probe, .. } if probe == "echo"));
    }

    struct Verbatim;

    impl Probe for Verbatim {
        fn program(&self) -> ProgramSource {
            ProgramSource::Inline("{plugins}")
        }

        fn enrich_event(&self, _raw: &[u8]) -> Result<Option<Event>, EnrichError> {
            Ok(None)
        }
    }

    #[test]
    fn plugins_are_not_template_variables() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let settings = Settings::new(serde_yaml::from_str("{plugins: {append: null}}").unwrap());
        let err = ProbeInstance::new(
            "verbatim".into(),
            Box::new(Verbatim),
            &settings,
            PluginChain::default(),
            &options,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProbeLoadError::Template { .. }));

        let probes = load("echo:\n  plugins:\n    append:\n    shout:\n", &options).unwrap();
        assert_eq!(probes["echo"].plugin_count(), 2);
    }

    struct Strict;

    impl Probe for Strict {
        fn program(&self) -> ProgramSource {
            ProgramSource::Inline("{a} {b}")
        }

        fn config_defaults(&self) -> Variables {
            Variables::from([("a".to_string(), serde_yaml::Value::from(1))])
        }

        fn template_vars(&self) -> Option<&'static [&'static str]> {
            Some(&["a", "b"])
        }

        fn enrich_event(&self, _raw: &[u8]) -> Result<Option<Event>, EnrichError> {
            Ok(None)
        }
    }

    #[test]
    fn template_vars_projection() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let settings = Settings::new(serde_yaml::from_str("{b: two, c: unused}").unwrap());
        let probe = ProbeInstance::new(
            "strict".into(),
            Box::new(Strict),
            &settings,
            PluginChain::default(),
            &options,
        )
        .unwrap();
        assert_eq!(probe.program_text(), "1 two");

        let err = ProbeInstance::new(
            "strict".into(),
            Box::new(Strict),
            &Settings::default(),
            PluginChain::default(),
            &options,
        )
        .err()
        .unwrap();
        assert!(
            matches!(err, ProbeLoadError::MissingVariable { ref variable, .. } if variable == "b")
        );
    }

    #[test]
    fn program_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "probe on {{port}}").unwrap();

        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let settings = Settings::new(serde_yaml::from_str("{port: 22}").unwrap());
        let probe = EchoProbe::from_file(file.path().to_path_buf());
        let instance = ProbeInstance::new(
            "echo".into(),
            Box::new(probe),
            &settings,
            PluginChain::default(),
            &options,
        )
        .unwrap();
        assert_eq!(instance.program_text(), "probe on 22");
    }

    #[test]
    fn missing_program_file() {
        let (options, _rx) = options(ScriptedEngine::default(), -1);
        let probe = EchoProbe::from_file(PathBuf::from("/nonexistent/echo.bt"));
        let err = ProbeInstance::new(
            "echo".into(),
            Box::new(probe),
            &Settings::default(),
            PluginChain::default(),
            &options,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProbeLoadError::ProgramFile { .. }));
    }

    #[test]
    fn events_are_stamped_and_processed() {
        let engine = ScriptedEngine::new(vec![PollStep::events([
            "pid=1 comm=curl",
            "",
            "fail=1",
            "pid=2",
        ])]);
        let (options, mut rx) = options(engine, -1);
        let mut probes = load("echo:\n  plugins:\n    append: {suffix: x}\n", &options).unwrap();
        let mut probe = probes.remove("echo").unwrap();

        let mut program = probe.attach().unwrap();
        probe.poll_once(program.as_mut()).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["pid"], json!(1));
        assert_eq!(events[0]["comm"], json!("curl"));
        assert_eq!(events[0]["probe"], json!("echo"));
        assert_eq!(events[0]["trail"], json!("x"));
        assert!(events[0]["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(events[1]["pid"], json!(2));

        assert!(matches!(
            probe.poll_once(program.as_mut()),
            Err(ProbeRunError::Poll {
                source: PollError::Exhausted,
                ..
            })
        ));
    }

    #[test]
    fn plugin_failure_drops_only_that_event() {
        let engine = ScriptedEngine::new(vec![PollStep::events(["pid=1 drop=1", "pid=2"])]);
        let (options, mut rx) = options(engine, -1);
        let mut probes = load("echo:\n  plugins:\n    dropper:\n", &options).unwrap();
        let mut probe = probes.remove("echo").unwrap();

        let mut program = probe.attach().unwrap();
        probe.poll_once(program.as_mut()).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["pid"], json!(2));
    }

    #[test]
    fn lost_event_telemetry_is_periodic() {
        let mut steps = vec![PollStep::lost(3), PollStep::idle(), PollStep::lost(2)];
        steps.extend((0..7).map(|_| PollStep::idle()));
        let (options, mut rx) = options(ScriptedEngine::new(steps), 5);
        let mut probes = load("echo:\n  plugins:\n    append:\n", &options).unwrap();
        let mut probe = probes.remove("echo").unwrap();
        let mut program = probe.attach().unwrap();

        for _ in 0..5 {
            probe.poll_once(program.as_mut()).unwrap();
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], json!("lost_event_telemetry"));
        assert_eq!(events[0]["count"], json!(5));
        assert_eq!(events[0]["probe"], json!("echo"));
        // telemetry bypasses the plugin chain
        assert!(events[0].get("trail").is_none());
        assert_eq!(probe.telemetry().timer(), 5);

        for _ in 0..4 {
            probe.poll_once(program.as_mut()).unwrap();
        }
        assert!(drain(&mut rx).is_empty());
        probe.poll_once(program.as_mut()).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn lost_events_ignored_when_telemetry_is_disabled() {
        let engine = ScriptedEngine::new(vec![PollStep::lost(3); 5]);
        let (options, mut rx) = options(engine, 0);
        let mut probes = load("echo:\n", &options).unwrap();
        let mut probe = probes.remove("echo").unwrap();
        let mut program = probe.attach().unwrap();

        for _ in 0..5 {
            probe.poll_once(program.as_mut()).unwrap();
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(probe.telemetry().count(), 0);
    }

    #[test]
    fn closed_queue_is_fatal() {
        let engine = ScriptedEngine::new(vec![PollStep::events(["pid=1"])]);
        let (options, rx) = options(engine, -1);
        drop(rx);
        let mut probes = load("echo:\n", &options).unwrap();
        let mut probe = probes.remove("echo").unwrap();
        let mut program = probe.attach().unwrap();

        assert!(matches!(
            probe.poll_once(program.as_mut()),
            Err(ProbeRunError::Queue { .. })
        ));
    }

    #[test]
    fn rejected_program() {
        let (options, _rx) = options(ScriptedEngine::rejecting("syntax error"), -1);
        let probes = load("echo:\n", &options).unwrap();
        let err = probes.into_values().next().unwrap().start_polling().unwrap_err();
        assert!(matches!(
            err,
            ProbeRunError::Compile {
                source: CompileError::Rejected(_),
                ..
            }
        ));
    }

    #[test]
    fn sidecars_emit_through_the_chain() {
        let (options, mut rx) = options(ScriptedEngine::default(), -1);
        let mut probes = load(
            "echo:\n  sidecar: true\n  plugins:\n    shout:\n    append: {suffix: s}\n",
            &options,
        )
        .unwrap();
        let probe = probes.remove("echo").unwrap();

        // nothing scripted: polling stops right after the sidecar starts
        assert!(probe.start_polling().is_err());

        let line = (0..100)
            .find_map(|_| {
                rx.try_recv().or_else(|| {
                    thread::sleep(Duration::from_millis(20));
                    None
                })
            })
            .unwrap();
        let event: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(event["sidecar"], json!(true));
        assert_eq!(event["probe"], json!("echo"));
        assert_eq!(event["trail"], json!("s"));
    }
}
