//! meshconf CLI entry point.

use std::io;
use std::process::ExitCode;

use clap::Parser;

use meshconf_cli::config::{FileConfig, Settings};
use meshconf_cli::{Cli, CliResult, session};
use meshconf_core::{TracingConfig, init_tracing};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let file = match &cli.config {
        Some(path) => FileConfig::load_from(path)?,
        None => FileConfig::load()?,
    };
    let settings = Settings::resolve(&cli, file)?;
    init_tracing(TracingConfig::cli(settings.debug))?;

    session::run(&settings, io::stdin().lock(), io::stdout())
}
