use std::fmt;

use thiserror::Error;

use super::{
    config::{ConfigError, Settings},
    registry::{Catalog, ComponentName, DiscoveryError},
};
use crate::event::Event;

pub type PluginError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A chainable event transformer.
///
/// Plugins are built once per probe instance and never shared between probes.
pub trait Plugin: Send + Sync {
    fn process(&self, event: Event) -> Result<Event, PluginError>;
}

/// Probes a plugin can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSupport {
    Any,
    Only(&'static [&'static str]),
}

impl ProbeSupport {
    pub fn supports(&self, probe: &str) -> bool {
        match self {
            ProbeSupport::Any => true,
            ProbeSupport::Only(probes) => probes.contains(&probe),
        }
    }
}

impl fmt::Display for ProbeSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeSupport::Any => write!(f, "*"),
            ProbeSupport::Only(probes) => write!(f, "[{}]", probes.join(", ")),
        }
    }
}

pub type PluginSetupFn = dyn Fn(&Settings) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync;

/// Contains the informations to identify a plugin and the recipe to build it.
pub struct PluginRecipe {
    pub name: ComponentName,
    pub probe_support: ProbeSupport,
    pub setup_fn: Box<PluginSetupFn>,
}

impl PluginRecipe {
    pub fn new<N, F, P>(name: N, probe_support: ProbeSupport, setup_fn: F) -> Self
    where
        N: Into<ComponentName>,
        F: Fn(&Settings) -> Result<P, PluginError>,
        F: Send + Sync + 'static,
        P: Plugin + 'static,
    {
        Self {
            name: name.into(),
            probe_support,
            setup_fn: Box::new(move |settings| {
                let plugin = setup_fn(settings)?;
                Ok(Box::new(plugin) as Box<dyn Plugin>)
            }),
        }
    }
}

#[derive(Error, Debug)]
pub enum PluginLoadError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("invalid configuration for plugin {plugin}")]
    Config {
        plugin: String,
        #[source]
        source: ConfigError,
    },
    #[error("{probe} is not among supported probes for plugin {plugin}: {support}")]
    Incompatible {
        plugin: String,
        probe: String,
        support: ProbeSupport,
    },
    #[error("setting up plugin {plugin} failed")]
    Setup {
        plugin: String,
        #[source]
        source: PluginError,
    },
}

/// Build the plugin chain of `calling_probe`.
///
/// Plugins are returned in declaration order. Disabled plugins are never
/// resolved. A plugin failing to load aborts the whole chain unless it sets
/// `unload_on_init_exception`, in which case the error is logged and the plugin
/// left out.
pub fn load_plugins(
    plugins: &[(String, Settings)],
    calling_probe: &str,
    catalog: &Catalog,
    extra_plugin_path: Option<&str>,
) -> Result<Vec<Box<dyn Plugin>>, PluginLoadError> {
    let mut loaded = Vec::with_capacity(plugins.len());

    for (name, settings) in plugins {
        let config_error = |source| PluginLoadError::Config {
            plugin: name.clone(),
            source,
        };
        if !settings.enabled().map_err(config_error)? {
            log::debug!("Plugin {name} of probe {calling_probe} is disabled");
            continue;
        }
        let unload_on_init_exception = settings.unload_on_init_exception().map_err(config_error)?;

        match load_plugin(name, settings, calling_probe, catalog, extra_plugin_path) {
            Ok(plugin) => loaded.push(plugin),
            Err(err) if unload_on_init_exception => {
                crate::log_error(&format!("Unloading plugin of probe {calling_probe}"), err);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(loaded)
}

fn load_plugin(
    name: &str,
    settings: &Settings,
    calling_probe: &str,
    catalog: &Catalog,
    extra_plugin_path: Option<&str>,
) -> Result<Box<dyn Plugin>, PluginLoadError> {
    let recipe = catalog.plugin(name, extra_plugin_path)?;

    if !recipe.probe_support.supports(calling_probe) {
        return Err(PluginLoadError::Incompatible {
            plugin: name.to_string(),
            probe: calling_probe.to_string(),
            support: recipe.probe_support,
        });
    }

    let plugin = (recipe.setup_fn)(settings).map_err(|source| PluginLoadError::Setup {
        plugin: name.to_string(),
        source,
    })?;
    log::debug!("Loaded plugin {name} for probe {calling_probe}");
    Ok(plugin)
}

/// Ordered plugins of a probe, each one fed with the output of the previous.
#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginChain {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn apply(&self, event: Event) -> Result<Event, PluginError> {
        self.plugins
            .iter()
            .try_fold(event, |event, plugin| plugin.process(event))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl From<Vec<Box<dyn Plugin>>> for PluginChain {
    fn from(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self::new(plugins)
    }
}
