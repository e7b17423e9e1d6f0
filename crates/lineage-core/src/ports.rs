//! Port filtering shared by the network probes.
//!
//! Configured with either `includeports` or `excludeports`, never both. The
//! filter renders to a tracing program expression and can also be checked in
//! userspace.

use std::fmt::Write;

use crate::pdk::{ConfigError, Settings};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PortFilter {
    #[default]
    Any,
    Include(Vec<u16>),
    Exclude(Vec<u16>),
}

impl TryFrom<&Settings> for PortFilter {
    type Error = ConfigError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        let include: Vec<u16> = settings.get_list("includeports")?;
        let exclude: Vec<u16> = settings.get_list("excludeports")?;

        if let Some(field) = [("includeports", &include), ("excludeports", &exclude)]
            .into_iter()
            .find_map(|(field, ports)| ports.contains(&0).then_some(field))
        {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                value: "0".to_string(),
                err: "port 0 is not a valid port".to_string(),
            });
        }

        match (include.is_empty(), exclude.is_empty()) {
            (true, true) => Ok(PortFilter::Any),
            (false, true) => Ok(PortFilter::Include(include)),
            (true, false) => Ok(PortFilter::Exclude(exclude)),
            (false, false) => Err(ConfigError::InvalidValue {
                field: "includeports".to_string(),
                value: format!("{include:?}"),
                err: "includeports and excludeports are mutually exclusive".to_string(),
            }),
        }
    }
}

impl PortFilter {
    pub fn matches(&self, port: u16) -> bool {
        match self {
            PortFilter::Any => true,
            PortFilter::Include(ports) => ports.contains(&port),
            PortFilter::Exclude(ports) => !ports.contains(&port),
        }
    }

    /// Boolean expression over the program variable `var`.
    pub fn predicate(&self, var: &str) -> String {
        let (ports, op, join) = match self {
            PortFilter::Any => return "1".to_string(),
            PortFilter::Include(ports) => (ports, "==", " || "),
            PortFilter::Exclude(ports) => (ports, "!=", " && "),
        };
        let mut expression = String::from("(");
        for (index, port) in ports.iter().enumerate() {
            if index > 0 {
                expression.push_str(join);
            }
            let _ = write!(expression, "{var} {op} {port}");
        }
        expression.push(')');
        expression
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(yaml: &str) -> Result<PortFilter, ConfigError> {
        PortFilter::try_from(&Settings::new(serde_yaml::from_str(yaml).unwrap()))
    }

    #[test]
    fn predicates() {
        assert_eq!(filter("{}").unwrap().predicate("$port"), "1");
        assert_eq!(
            filter("{includeports: [22, 80]}").unwrap().predicate("$port"),
            "($port == 22 || $port == 80)"
        );
        assert_eq!(
            filter("{excludeports: [443]}").unwrap().predicate("$port"),
            "($port != 443)"
        );
    }

    #[test]
    fn matches() {
        let include = filter("{includeports: [22]}").unwrap();
        assert!(include.matches(22));
        assert!(!include.matches(80));
        let exclude = filter("{excludeports: [22], includeports: []}").unwrap();
        assert!(!exclude.matches(22));
        assert!(exclude.matches(80));
    }

    #[test]
    fn invalid_filters() {
        assert!(matches!(
            filter("{includeports: [22], excludeports: [80]}"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            filter("{excludeports: [0]}"),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "excludeports"
        ));
        assert!(matches!(
            filter("{includeports: [70000]}"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
