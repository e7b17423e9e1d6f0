//! Building blocks shared by the lineage daemon, its probes and its plugins.
//!
//! - [`event`]: the open [`Event`](event::Event) mapping flowing through the pipeline
//! - [`queue`]: the cross-process [`OutputQueue`](queue::OutputQueue)
//! - [`engine`]: the contract a kernel tracing engine must fulfil
//! - [`template`]: rendering of probe program templates
//! - [`pdk`]: the probe development kit (config, registries, probe instances, plugins)
//! - [`procfs`]: process ancestry helpers used by probe enrichment
//! - [`enrich`] and [`ports`]: pieces shared by the builtin network probes

pub mod engine;
pub mod enrich;
pub mod event;
pub mod pdk;
pub mod ports;
pub mod procfs;
pub mod queue;
pub mod template;

/// Log `err` after `msg`, followed by the chain of its sources.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:#}", msg, anyhow::Error::from(err));
}
