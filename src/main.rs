use lineage::cli;

fn main() {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    // Override the default log_level if there is a greater verbosity flag
    lineage::init_logger(options.override_log_level());

    // Probe processes are forked before any runtime thread exists, so the
    // async runtime is started by `run_lineage` itself
    let code = lineage::catalog()
        .map_err(anyhow::Error::from)
        .and_then(|catalog| lineage::run_lineage(&options, catalog));

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            lineage::report_error(&e);
            std::process::exit(1);
        }
    }
}
