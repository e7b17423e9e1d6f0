use std::{borrow::Cow, collections::BTreeMap, fmt, ops::Deref};

use thiserror::Error;

use super::{plugin::PluginRecipe, probe::ProbeRecipe};

/// Package searched first when resolving a probe name.
pub const DEFAULT_PROBE_PATH: &str = "lineage.probes";
/// Package searched first when resolving a plugin name.
pub const DEFAULT_PLUGIN_PATH: &str = "lineage.plugins";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentName(Cow<'static, str>);

impl Deref for ComponentName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&'static str> for ComponentName {
    fn from(val: &'static str) -> ComponentName {
        ComponentName(Cow::Borrowed(val))
    }
}

impl From<String> for ComponentName {
    fn from(val: String) -> ComponentName {
        ComponentName(Cow::Owned(val))
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Probe,
    Plugin,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Probe => write!(f, "probe"),
            ComponentKind::Plugin => write!(f, "plugin"),
        }
    }
}

/// Something which can be looked up by import path.
pub enum Component {
    Probe(ProbeRecipe),
    Plugin(PluginRecipe),
}

impl Component {
    pub fn name(&self) -> &ComponentName {
        match self {
            Component::Probe(recipe) => &recipe.name,
            Component::Plugin(recipe) => &recipe.name,
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Probe(_) => ComponentKind::Probe,
            Component::Plugin(_) => ComponentKind::Plugin,
        }
    }
}

impl From<ProbeRecipe> for Component {
    fn from(recipe: ProbeRecipe) -> Self {
        Component::Probe(recipe)
    }
}

impl From<PluginRecipe> for Component {
    fn from(recipe: PluginRecipe) -> Self {
        Component::Plugin(recipe)
    }
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("could not import {kind} {name}, tried {}", .tried.join(", "))]
    NotFound {
        kind: ComponentKind,
        name: String,
        tried: Vec<String>,
    },
    #[error("could not find {expected} in {path}: found a {found}")]
    WrongKind {
        path: String,
        expected: ComponentKind,
        found: ComponentKind,
    },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    Duplicate(String),
}

/// Every probe and plugin implementation known to the process, keyed by
/// import path (`<package>.<name>`).
#[derive(Default)]
pub struct Catalog {
    components: BTreeMap<String, Component>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under `package`.
    pub fn register(
        &mut self,
        package: &str,
        component: impl Into<Component>,
    ) -> Result<(), RegistryError> {
        let component = component.into();
        let path = import_path(package, component.name());
        if self.components.contains_key(&path) {
            return Err(RegistryError::Duplicate(path));
        }
        log::trace!("registered {} {path}", component.kind());
        self.components.insert(path, component);
        Ok(())
    }

    pub fn register_probe(
        &mut self,
        package: &str,
        recipe: ProbeRecipe,
    ) -> Result<(), RegistryError> {
        self.register(package, recipe)
    }

    pub fn register_plugin(
        &mut self,
        package: &str,
        recipe: PluginRecipe,
    ) -> Result<(), RegistryError> {
        self.register(package, recipe)
    }

    /// Resolve a probe, looking in [`DEFAULT_PROBE_PATH`] and then in `extra_path`.
    pub fn probe(
        &self,
        name: &str,
        extra_path: Option<&str>,
    ) -> Result<&ProbeRecipe, DiscoveryError> {
        self.resolve(ComponentKind::Probe, name, DEFAULT_PROBE_PATH, extra_path, |c| {
            match c {
                Component::Probe(recipe) => Some(recipe),
                Component::Plugin(_) => None,
            }
        })
    }

    /// Resolve a plugin, looking in [`DEFAULT_PLUGIN_PATH`] and then in `extra_path`.
    pub fn plugin(
        &self,
        name: &str,
        extra_path: Option<&str>,
    ) -> Result<&PluginRecipe, DiscoveryError> {
        self.resolve(ComponentKind::Plugin, name, DEFAULT_PLUGIN_PATH, extra_path, |c| {
            match c {
                Component::Plugin(recipe) => Some(recipe),
                Component::Probe(_) => None,
            }
        })
    }

    /// Import paths of every registered component.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// The first package containing `name` wins, even if it holds the wrong kind.
    fn resolve<'a, T>(
        &'a self,
        kind: ComponentKind,
        name: &str,
        default_path: &str,
        extra_path: Option<&str>,
        select: impl Fn(&'a Component) -> Option<&'a T>,
    ) -> Result<&'a T, DiscoveryError> {
        let mut tried = Vec::new();
        for package in std::iter::once(default_path).chain(extra_path) {
            let path = import_path(package, name);
            let Some(component) = self.components.get(&path) else {
                tried.push(path);
                continue;
            };
            return select(component).ok_or(DiscoveryError::WrongKind {
                path,
                expected: kind,
                found: component.kind(),
            });
        }
        Err(DiscoveryError::NotFound {
            kind,
            name: name.to_string(),
            tried,
        })
    }
}

fn import_path(package: &str, name: &str) -> String {
    format!("{package}.{name}")
}
