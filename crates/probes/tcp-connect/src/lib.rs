//! The `tcp_connect` probe reports successful outbound IPv4 TCP connections,
//! together with the ancestry of the connecting process.
//!
//! Configuration:
//! - `includeports`: only report connections to these ports
//! - `excludeports`: never report connections to these ports
//!
//! Event fields: `pid`, `proctree`, `saddr`, `daddr`, `port`.

use lineage_core::{
    enrich,
    event::Event,
    pdk::{ConfigError, EnrichError, Probe, ProbeRecipe, ProgramSource, Settings},
    ports::PortFilter,
    template::Variables,
};

pub const PROBE_NAME: &str = "tcp_connect";

const PROGRAM: &str = include_str!("tcp_connect.bt");

pub fn probe() -> ProbeRecipe {
    ProbeRecipe::new(PROBE_NAME, |settings: &Settings| {
        let config = Config::try_from(settings)?;
        log::debug!("{PROBE_NAME} port filter: {:?}", config.port_filter);
        Ok(TcpConnect { config })
    })
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    port_filter: PortFilter,
}

impl TryFrom<&Settings> for Config {
    type Error = ConfigError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        Ok(Self {
            port_filter: PortFilter::try_from(settings)?,
        })
    }
}

struct TcpConnect {
    config: Config,
}

impl Probe for TcpConnect {
    fn program(&self) -> ProgramSource {
        ProgramSource::Inline(PROGRAM)
    }

    fn config_defaults(&self) -> Variables {
        Variables::from([(
            "port_filter".to_string(),
            self.config.port_filter.predicate("$port").into(),
        )])
    }

    fn template_vars(&self) -> Option<&'static [&'static str]> {
        Some(&["port_filter"])
    }

    fn enrich_event(&self, raw: &[u8]) -> Result<Option<Event>, EnrichError> {
        Ok(enrich::process_event(raw))
    }
}
