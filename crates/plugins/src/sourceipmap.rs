//! Names the source address of `tcp_connect` events using hosts files.
//!
//! Configuration:
//! - `hostfiles`: non empty list of files in `/etc/hosts` format
//! - `attribute_key`: field receiving the name, `source_host` by default

use std::{collections::HashMap, fs, io, path::PathBuf};

use lineage_core::{
    event::Event,
    pdk::{ConfigError, Plugin, PluginError, PluginRecipe, ProbeSupport, Settings},
};
use serde_json::Value;
use thiserror::Error;

pub const PLUGIN_NAME: &str = "sourceipmap";

const PROBE_SUPPORT: ProbeSupport = ProbeSupport::Only(&["tcp_connect"]);

pub fn plugin() -> PluginRecipe {
    PluginRecipe::new(PLUGIN_NAME, PROBE_SUPPORT, |settings: &Settings| {
        let config = Config::try_from(settings)?;
        Ok(SourceIpMap::load(config)?)
    })
}

#[derive(Debug, Error)]
pub enum SourceIpMapError {
    #[error("reading hosts file {path} failed")]
    HostsFile {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    hostfiles: Vec<PathBuf>,
    attribute_key: String,
}

impl TryFrom<&Settings> for Config {
    type Error = ConfigError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        let hostfiles: Vec<PathBuf> = settings.required("hostfiles")?;
        if hostfiles.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "hostfiles".to_string(),
                value: "[]".to_string(),
                err: "at least one hosts file is required".to_string(),
            });
        }
        Ok(Self {
            hostfiles,
            attribute_key: settings.with_default("attribute_key", "source_host".to_string())?,
        })
    }
}

struct SourceIpMap {
    hosts: HashMap<String, String>,
    attribute_key: String,
}

impl SourceIpMap {
    fn load(config: Config) -> Result<Self, SourceIpMapError> {
        let mut hosts = HashMap::new();
        for path in &config.hostfiles {
            let content =
                fs::read_to_string(path).map_err(|source| SourceIpMapError::HostsFile {
                    path: path.display().to_string(),
                    source,
                })?;
            for (address, name) in parse_hosts(&content) {
                hosts.entry(address).or_insert(name);
            }
        }
        log::debug!("{PLUGIN_NAME}: {} known addresses", hosts.len());
        Ok(Self {
            hosts,
            attribute_key: config.attribute_key,
        })
    }
}

impl Plugin for SourceIpMap {
    fn process(&self, mut event: Event) -> Result<Event, PluginError> {
        let name = event
            .get("saddr")
            .and_then(Value::as_str)
            .and_then(|saddr| self.hosts.get(saddr))
            .cloned();
        if let Some(name) = name {
            event.insert(self.attribute_key.clone(), Value::from(name));
        }
        Ok(event)
    }
}

/// `(address, canonical name)` pairs of a hosts file. The first mapping of an
/// address wins.
fn parse_hosts(content: &str) -> impl Iterator<Item = (String, String)> + '_ {
    content.lines().filter_map(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let address = fields.next()?;
        let name = fields.next()?;
        Some((address.to_string(), name.to_string()))
    })
}
