//! Lineage reports the process ancestry behind network activity.
//!
//! A set of *probes*, each one a kernel tracing program, is selected and
//! configured through a YAML document. Every probe runs in its own process:
//! it enriches the raw events of its program with the ancestry of the process
//! that caused them, passes them through its chain of *plugins*, and sends
//! them to the main process, which writes one JSON event per line to the
//! output.
//!
//! ```yaml
//! tcp_connect:
//!   excludeports: [22]
//!   plugins:
//!     sourceipmap:
//!       hostfiles: [/etc/hosts]
//! net_listen:
//!   snapshot_periodicity: 3600
//! ```
//!
//! Probes and plugins are looked up by name in a [`Catalog`]. The builtin
//! ones are registered by [`catalog`]; programs embedding lineage register
//! their own in another package and select it with `--extra-probe-path` or
//! `--extra-plugin-path`. See [`lineage_core::pdk`] for how to write them.
//!
//! ## Feature flags
//!
//! - `default`: Enables `full`.
//! - `full`: Enables `probes` and `plugins`.
//! - `probes`: Enables the `tcp-connect` and `net-listen` probes.
//! - `tcp-connect`: Outbound IPv4 TCP connections.
//! - `net-listen`: TCP sockets entering the listen state.
//! - `plugins`: Enables the builtin plugins: `identityplugin`, `sourceipmap`
//!   and `loginuidmap`.

use std::{
    collections::BTreeMap,
    env,
    io::{self, Write},
    sync::Arc,
};

use anyhow::{Context, Result};
use bpftrace_engine::Bpftrace;
use lineage_core::{
    pdk::{load_probes, Catalog, LoadOptions, ProbeInstance, ProbesConfig, RegistryError},
    queue::OutputQueue,
};

pub mod cli;
pub mod daemon;

pub use cli::LineageOpts;

/// Init logger. We log from info level and above.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}

/// Catalog of the builtin probes and plugins, registered in the default
/// packages.
pub fn catalog() -> Result<Catalog, RegistryError> {
    #[allow(unused_mut)]
    let mut catalog = Catalog::new();

    #[cfg(feature = "tcp-connect")]
    catalog.register_probe(lineage_core::pdk::DEFAULT_PROBE_PATH, tcp_connect::probe())?;

    #[cfg(feature = "net-listen")]
    catalog.register_probe(lineage_core::pdk::DEFAULT_PROBE_PATH, net_listen::probe())?;

    #[cfg(feature = "plugins")]
    for plugin in lineage_plugins::plugins() {
        catalog.register_plugin(lineage_core::pdk::DEFAULT_PLUGIN_PATH, plugin)?;
    }

    Ok(catalog)
}

/// Load the configured probes from `catalog` and run them until termination.
///
/// Returns the exit code of the run. Probe processes are forked here, so this
/// must be called before any thread is started.
pub fn run_lineage(options: &LineageOpts, catalog: Catalog) -> Result<i32> {
    log::trace!("Lineage options: {:?}", options);

    let config = match &options.config {
        Some(path) => ProbesConfig::from_file(path)
            .with_context(|| format!("Loading configuration {}", path.display()))?,
        None => ProbesConfig::default(),
    };

    let (queue, receiver) = OutputQueue::new();
    let load_options = LoadOptions {
        extra_probe_path: options.extra_probe_path.clone(),
        extra_plugin_path: options.extra_plugin_path.clone(),
        lost_event_telemetry: options.lost_event_telemetry,
        ..LoadOptions::new(queue.clone(), Arc::new(Bpftrace::new(&options.tracer)))
    };
    let probes = load_probes(&config, &catalog, &load_options).context("Loading probes")?;
    log::info!(
        "Loaded probes: {}",
        probes.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
    );

    if options.print_and_quit {
        print_programs(&probes, &mut io::stdout().lock()).context("Printing probe programs")?;
        return Ok(0);
    }

    let sink = daemon::OutputSink::open(&options.output_file)
        .with_context(|| format!("Opening output {}", options.output_file))?;

    let spawned = daemon::spawn_probes(probes, &queue).context("Starting probes")?;

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            for probe in &spawned {
                probe.record.terminate();
            }
            return Err(err).context("Starting the async runtime");
        }
    };

    runtime.block_on(daemon::run_daemon(
        spawned,
        queue,
        receiver,
        sink,
        daemon::HEALTH_CHECK_PERIOD,
    ))
}

/// Write the rendered program of every probe, each under a header line.
pub fn print_programs<W: Write>(
    probes: &BTreeMap<String, ProbeInstance>,
    out: &mut W,
) -> io::Result<()> {
    for (name, probe) in probes {
        writeln!(out, "----- {name} -----")?;
        writeln!(out, "{}", probe.program_text())?;
        writeln!(out)?;
    }
    out.flush()
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    matches!(env::var("RUST_BACKTRACE").as_deref(), Ok("1"))
}

/// Log `e` with its whole chain of causes, and with the backtrace when
/// debugging.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
