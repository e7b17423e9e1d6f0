//! Builtin plugins.
//!
//! - `identityplugin`: returns every event unchanged
//! - `sourceipmap`: names the source address of `tcp_connect` events
//! - `loginuidmap`: adds the login user of the process behind an event

use lineage_core::pdk::PluginRecipe;

pub mod identity;
pub mod loginuidmap;
pub mod sourceipmap;

/// Every builtin plugin.
pub fn plugins() -> Vec<PluginRecipe> {
    vec![identity::plugin(), sourceipmap::plugin(), loginuidmap::plugin()]
}
