#![cfg(unix)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate error_chain;
extern crate clap;
extern crate libc;
extern crate nix;
extern crate stderrlog;
extern crate sandbox;

mod config;
mod report;
mod runner;

use error_chain::ChainedError;

use config::HarnessConfig;
use report::Report;
use runner::{BaselineProbe, InteractiveRunner};


error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    links {
        Sandbox(::sandbox::Error, ::sandbox::ErrorKind);
    }

    foreign_links {
        Io(::std::io::Error);
        Clap(::clap::Error);
    }
}


fn init_logging(config: &HarnessConfig) -> Result<()> {
    stderrlog::new()
        .module(module_path!())
        .module("sandbox")
        .verbosity(config.verbosity)
        .quiet(config.quiet)
        .init()
        .map_err(|e| Error::from(format!("failed to initialize logger: {}", e)))
}

fn do_main() -> Result<()> {
    let matches = config::app().get_matches();
    let config = HarnessConfig::from_matches(&matches)?;
    init_logging(&config)?;
    trace!("Harness configuration: {:?}", config);

    // Everything after argument parsing ends up in the report rather than in the exit code.
    let baseline = BaselineProbe::new(&config).run();
    let run = InteractiveRunner::new(&config).run();

    let report = Report::new(
        run.main_command_line,
        run.interactor_command_line,
        baseline.map(|outcome| outcome.usage),
        run.outcome);

    let stdout = std::io::stdout();
    if let Err(e) = report.emit(&mut stdout.lock()) {
        error!("Cannot write report: {}", e);
    }

    Ok(())
}

fn main() -> Result<()> {
    match do_main() {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {}", e.display_chain().to_string());
            Err(e)
        }
    }
}
