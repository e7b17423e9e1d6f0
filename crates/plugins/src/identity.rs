use lineage_core::{
    event::Event,
    pdk::{Plugin, PluginError, PluginRecipe, ProbeSupport, Settings},
};

pub const PLUGIN_NAME: &str = "identityplugin";

pub fn plugin() -> PluginRecipe {
    PluginRecipe::new(PLUGIN_NAME, ProbeSupport::Any, |_: &Settings| Ok(Identity))
}

struct Identity;

impl Plugin for Identity {
    fn process(&self, event: Event) -> Result<Event, PluginError> {
        Ok(event)
    }
}
