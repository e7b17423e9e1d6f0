use std::{io, path::Path};

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Top level keys starting with this prefix are not probes. They are free to
/// hold shared, anchored defaults.
pub const RESERVED_PREFIX: char = '_';

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
    #[error("configuration of {what} must be a mapping")]
    NotAMapping { what: String },
    #[error("error loading configuration from {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid YAML configuration")]
    Syntax(#[from] serde_yaml::Error),
}

/// Configuration of a single probe or plugin
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    inner: Mapping,
}

impl Settings {
    pub fn new(inner: Mapping) -> Self {
        Self { inner }
    }

    /// A missing (null) configuration means "all defaults".
    fn from_value(value: Value, what: &str) -> Result<Self, ConfigError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Mapping(inner) => Ok(Self { inner }),
            _ => Err(ConfigError::NotAMapping {
                what: what.to_string(),
            }),
        }
    }

    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Option<Value> {
        self.inner.insert(Value::from(key), value.into())
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&Value> {
        self.inner.get(config_name)
    }

    /// Returns a typed configuration value.
    pub fn required<T: DeserializeOwned>(&self, config_name: &str) -> Result<T, ConfigError> {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T: DeserializeOwned>(
        &self,
        config_name: &str,
    ) -> Result<Option<T>, ConfigError> {
        self.inner
            .get(config_name)
            .filter(|value| !value.is_null())
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` when it's missing.
    pub fn with_default<T: DeserializeOwned>(
        &self,
        config_name: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Return a list of values. Return empty vector if field is missing.
    pub fn get_list<T: DeserializeOwned>(&self, config_name: &str) -> Result<Vec<T>, ConfigError> {
        self.with_default(config_name, Vec::new())
    }

    /// Disabled entries are skipped entirely.
    pub fn enabled(&self) -> Result<bool, ConfigError> {
        self.with_default("enabled", true)
    }

    /// When set on a plugin, an error while loading it only gets logged.
    pub fn unload_on_init_exception(&self) -> Result<bool, ConfigError> {
        self.with_default("unload_on_init_exception", false)
    }

    /// Plugin configurations of a probe, in declaration order.
    pub fn plugins(&self) -> Result<Vec<(String, Settings)>, ConfigError> {
        let plugins = match self.inner.get("plugins") {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(Value::Mapping(plugins)) => plugins,
            Some(_) => {
                return Err(ConfigError::NotAMapping {
                    what: "plugins".to_string(),
                });
            }
        };

        plugins
            .iter()
            .map(|(name, config)| {
                let name = key_name(name, "plugins")?;
                let settings = Settings::from_value(config.clone(), &format!("plugin {name}"))?;
                Ok((name, settings))
            })
            .collect()
    }

    /// Iterate over the entries with a string key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner
            .iter()
            .filter_map(|(key, value)| key.as_str().map(|key| (key, value)))
    }
}

/// Probe configurations, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ProbesConfig {
    entries: Vec<(String, Settings)>,
}

impl ProbesConfig {
    /// Construct a [`ProbesConfig`] from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Construct a [`ProbesConfig`] from a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut document: Value = serde_yaml::from_str(text)?;
        document.apply_merge()?;

        let mapping = match document {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::NotAMapping {
                    what: "the configuration root".to_string(),
                });
            }
        };

        let entries = mapping
            .into_iter()
            .map(|(name, config)| {
                let name = key_name(&name, "the configuration root")?;
                if is_reserved(&name) {
                    // reserved entries are never interpreted
                    return Ok((name, Settings::default()));
                }
                let settings = Settings::from_value(config, &format!("probe {name}"))?;
                log::debug!("{name}: {settings:?}");
                Ok((name, settings))
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(Self { entries })
    }

    /// Every top level entry, reserved ones included.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Settings)> {
        self.entries
            .iter()
            .map(|(name, settings)| (name.as_str(), settings))
    }

    /// Top level entries describing probes.
    pub fn probes(&self) -> impl Iterator<Item = (&str, &Settings)> {
        self.entries().filter(|(name, _)| !is_reserved(name))
    }
}

/// Names starting with [`RESERVED_PREFIX`] never denote a probe.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

fn key_name(key: &Value, what: &str) -> Result<String, ConfigError> {
    match key {
        Value::String(name) => Ok(name.clone()),
        other => Err(ConfigError::InvalidValue {
            field: what.to_string(),
            value: to_text(other),
            err: "keys must be strings".to_string(),
        }),
    }
}

fn parse<T: DeserializeOwned>(value: &Value, config_name: &str) -> Result<T, ConfigError> {
    serde_yaml::from_value(value.clone()).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: to_text(value),
        err: err.to_string(),
    })
}

fn to_text(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|text| text.trim_end().to_string())
        .unwrap_or_else(|_| format!("{value:?}"))
}
