use std::{ffi::OsString, path::PathBuf};

use clap::{ArgAction, Parser};

pub const NAME: &str = "lineage";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Process ancestry for network activity, traced from the kernel")]
#[clap(version)]
#[clap(disable_help_subcommand = true)]
pub struct LineageOpts {
    /// YAML configuration of the probes to run.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Print the program of every probe and exit.
    #[clap(short, long)]
    pub print_and_quit: bool,

    /// Where events are written, `-` for standard output.
    #[clap(short = 'f', long, default_value = "-")]
    pub output_file: String,

    /// Poll iterations between two lost event reports, disabled when <= 0.
    #[clap(long, value_name = "NEVENTS", default_value_t = -1, allow_negative_numbers = true)]
    pub lost_event_telemetry: i64,

    /// Extra package searched for probes.
    #[clap(long, value_name = "PACKAGE")]
    pub extra_probe_path: Option<String>,

    /// Extra package searched for plugins.
    #[clap(long, value_name = "PACKAGE")]
    pub extra_plugin_path: Option<String>,

    /// bpftrace executable.
    #[clap(long, value_name = "PATH", default_value = "bpftrace")]
    pub tracer: PathBuf,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl LineageOpts {
    pub fn override_log_level(&self) -> Option<log::LevelFilter> {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> LineageOpts {
    LineageOpts::parse()
}

pub fn try_parse_from<I, T>(args: I) -> Result<LineageOpts, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    LineageOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> Option<log::LevelFilter> {
    match num {
        0 => None,
        1 => Some(log::LevelFilter::Debug),
        2..=u8::MAX => Some(log::LevelFilter::Trace),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = try_parse_from(["lineage"]).unwrap();
        assert_eq!(opts.config, None);
        assert!(!opts.print_and_quit);
        assert_eq!(opts.output_file, "-");
        assert_eq!(opts.lost_event_telemetry, -1);
        assert_eq!(opts.tracer, PathBuf::from("bpftrace"));
        assert_eq!(opts.override_log_level(), None);
    }

    #[test]
    fn every_option() {
        let opts = try_parse_from([
            "lineage",
            "-c",
            "/etc/lineage.yaml",
            "-p",
            "-f",
            "/var/log/lineage.log",
            "--lost-event-telemetry",
            "100",
            "--extra-probe-path",
            "acme.probes",
            "--extra-plugin-path",
            "acme.plugins",
            "--tracer",
            "/opt/bpftrace",
            "-vv",
        ])
        .unwrap();
        assert_eq!(opts.config, Some(PathBuf::from("/etc/lineage.yaml")));
        assert!(opts.print_and_quit);
        assert_eq!(opts.output_file, "/var/log/lineage.log");
        assert_eq!(opts.lost_event_telemetry, 100);
        assert_eq!(opts.extra_probe_path.as_deref(), Some("acme.probes"));
        assert_eq!(opts.extra_plugin_path.as_deref(), Some("acme.plugins"));
        assert_eq!(opts.tracer, PathBuf::from("/opt/bpftrace"));
        assert_eq!(opts.override_log_level(), Some(log::LevelFilter::Trace));
    }

    #[test]
    fn negative_telemetry_period() {
        let opts = try_parse_from(["lineage", "--lost-event-telemetry", "-5"]).unwrap();
        assert_eq!(opts.lost_event_telemetry, -5);
    }

    #[test]
    fn verbosity() {
        let opts = try_parse_from(["lineage", "-v"]).unwrap();
        assert_eq!(opts.override_log_level(), Some(log::LevelFilter::Debug));
    }
}
