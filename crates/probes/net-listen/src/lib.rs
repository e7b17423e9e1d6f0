//! The `net_listen` probe reports TCP sockets entering the listen state,
//! together with the ancestry of the listening process.
//!
//! Configuration:
//! - `includeports` / `excludeports`: same semantics as `tcp_connect`
//! - `snapshot_periodicity`: seconds between two snapshots of the sockets
//!   already listening, `0` disables snapshots (default 12 hours)
//!
//! Event fields: `pid`, `proctree`, `laddr`, `port`, `protocol`, and
//! `snapshot: true` for events coming from a snapshot.

use std::{collections::HashMap, thread, time::Duration};

use lineage_core::{
    enrich,
    event::Event,
    pdk::{
        ConfigError, EnrichError, EventEmitter, Probe, ProbeRecipe, ProgramSource, Settings,
        Sidecar,
    },
    ports::PortFilter,
    template::Variables,
};
use procfs::{
    net::{TcpNetEntry, TcpState},
    process::FDTarget,
    ProcResult,
};

pub const PROBE_NAME: &str = "net_listen";

const PROGRAM: &str = include_str!("net_listen.bt");

const DEFAULT_SNAPSHOT_PERIODICITY: u64 = 43200;

pub fn probe() -> ProbeRecipe {
    ProbeRecipe::new(PROBE_NAME, |settings: &Settings| {
        Ok(NetListen {
            config: Config::try_from(settings)?,
        })
    })
}

#[derive(Debug, Clone)]
pub struct Config {
    port_filter: PortFilter,
    snapshot_periodicity: u64,
}

impl TryFrom<&Settings> for Config {
    type Error = ConfigError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        Ok(Self {
            port_filter: PortFilter::try_from(settings)?,
            snapshot_periodicity: settings
                .with_default("snapshot_periodicity", DEFAULT_SNAPSHOT_PERIODICITY)?,
        })
    }
}

struct NetListen {
    config: Config,
}

impl Probe for NetListen {
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

    fn sidecars(&self) -> Vec<Sidecar> {
        if self.config.snapshot_periodicity == 0 {
            return Vec::new();
        }
        let period = Duration::from_secs(self.config.snapshot_periodicity);
        let port_filter = self.config.port_filter.clone();
        vec![Box::new(move |emitter: EventEmitter| {
            snapshot_worker(emitter, port_filter, period)
        })]
    }
}

/// Periodically emit an event for every socket already listening.
fn snapshot_worker(emitter: EventEmitter, port_filter: PortFilter, period: Duration) {
    loop {
        match snapshot(&port_filter) {
            Ok(events) => {
                log::debug!("{} listening sockets in snapshot", events.len());
                for event in events {
                    if let Err(err) = emitter.emit(event) {
                        log::error!("Stopping {PROBE_NAME} snapshots: {err}");
                        return;
                    }
                }
            }
            Err(err) => log::warn!("{PROBE_NAME} snapshot failed: {err}"),
        }
        thread::sleep(period);
    }
}

/// Events describing the TCP sockets currently listening.
pub fn snapshot(port_filter: &PortFilter) -> ProcResult<Vec<Event>> {
    let mut listening: Vec<TcpNetEntry> = procfs::net::tcp()?;
    // IPv6 may be disabled
    listening.extend(procfs::net::tcp6().unwrap_or_default());
    listening.retain(|entry| {
        entry.state == TcpState::Listen && port_filter.matches(entry.local_address.port())
    });

    let owners = socket_owners()?;
    Ok(listening
        .into_iter()
        .filter_map(|entry| {
            let pid = *owners.get(&entry.inode)?;
            let mut event = Event::new()
                .with("pid", pid)
                .with("laddr", entry.local_address.ip().to_string())
                .with("port", entry.local_address.port())
                .with("protocol", "tcp")
                .with("snapshot", true);
            enrich::add_process_tree(&mut event, pid);
            Some(event)
        })
        .collect())
}

/// Map socket inodes to the pid of a process holding them.
///
/// Processes we are not allowed to inspect are skipped.
fn socket_owners() -> ProcResult<HashMap<u64, i32>> {
    let mut owners = HashMap::new();
    for process in procfs::process::all_processes()?.filter_map(Result::ok) {
        let Ok(fds) = process.fd() else {
            continue;
        };
        for fd in fds.filter_map(Result::ok) {
            if let FDTarget::Socket(inode) = fd.target {
                owners.entry(inode).or_insert(process.pid());
            }
        }
    }
    Ok(owners)
}
