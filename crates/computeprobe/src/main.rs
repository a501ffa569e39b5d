//! Entry point: parse the CLI, initialise tracing, dispatch to the run or `info` path, and
//! turn failures into a single stderr line plus a class-specific exit status.

mod bootstrap;
mod cli;
mod paths;
mod run;

use std::process::ExitCode;

use cli::Command;

fn main() -> ExitCode {
    let cli = cli::parse();
    run::initialise_tracing();

    let outcome = match &cli.command {
        Some(Command::Info(info_args)) => run::info(&cli.run, info_args),
        None => run::run(&cli.run),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let failure = run::classify(&err);
            eprintln!("error[{}]: {err:#}", failure.label);
            ExitCode::from(failure.code)
        }
    }
}
