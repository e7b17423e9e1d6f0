//! This module includes all the necessary to build probes and plugins for lineage
//!
//! A probe implements [`Probe`]: it names its tracing program, the defaults of the
//! template variables and how a raw event becomes an [`Event`](crate::event::Event).
//! A plugin implements [`Plugin`]: a single `process` step of the chain each probe
//! runs on its events.
//!
//! Both are published through a recipe ([`ProbeRecipe`], [`PluginRecipe`]) which
//! validates the configuration and builds the implementation. Recipes are
//! registered in a [`Catalog`] under an import path, and [`load_probes`] turns a
//! [`ProbesConfig`] into ready to run [`ProbeInstance`]s.
//!
//! # Example
//!
//! A plugin adding a fixed field to every event of every probe.
//!
//! ```
//! use lineage_core::event::Event;
//! use lineage_core::pdk::{
//!     Catalog, Plugin, PluginError, PluginRecipe, ProbeSupport, Settings, DEFAULT_PLUGIN_PATH,
//! };
//!
//! struct Datacenter(String);
//!
//! impl Plugin for Datacenter {
//!     fn process(&self, event: Event) -> Result<Event, PluginError> {
//!         Ok(event.with("datacenter", self.0.as_str()))
//!     }
//! }
//!
//! let recipe = PluginRecipe::new("datacenter", ProbeSupport::Any, |settings: &Settings| {
//!     Ok(Datacenter(settings.required("name")?))
//! });
//!
//! let mut catalog = Catalog::new();
//! catalog.register_plugin(DEFAULT_PLUGIN_PATH, recipe).unwrap();
//! assert!(catalog.plugin("datacenter", None).is_ok());
//! ```

mod config;
mod plugin;
mod probe;
mod registry;
mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{is_reserved, ConfigError, ProbesConfig, Settings, RESERVED_PREFIX};
pub use plugin::{
    load_plugins, Plugin, PluginChain, PluginError, PluginLoadError, PluginRecipe, PluginSetupFn,
    ProbeSupport,
};
pub use probe::{
    load_probes, EnrichError, EventEmitter, LoadOptions, Probe, ProbeError, ProbeInstance,
    ProbeLoadError, ProbeRecipe, ProbeRunError, ProbeSetupFn, ProgramSource, Sidecar,
    TELEMETRY_POLL_TIMEOUT,
};
pub use registry::{
    Catalog, Component, ComponentKind, ComponentName, DiscoveryError, RegistryError,
    DEFAULT_PLUGIN_PATH, DEFAULT_PROBE_PATH,
};
pub use telemetry::LostEventTelemetry;
