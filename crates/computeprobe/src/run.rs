//! Drives a probe run: bring up the headless context, report driver strings, compile and
//! dispatch the shader, wait for completion, then tear everything down in reverse order.
//!
//! Types:
//!
//! - `Failure` pairs an exit status with the label printed on stderr.
//!
//! Functions:
//!
//! - `run` and `info` are the two entry points selected by `main`.
//! - `initialise_tracing` configures logging on stderr so stdout carries only the report.
//! - `classify` maps an error chain onto a failure class and exit status.

use std::io::{self, Write};

use anyhow::{Context, Result};
use headless::{ComputeProgram, HeadlessContext, ProbeError, ShaderSource};
use probeconfig::{ConfigError, Settings};
use tracing_subscriber::EnvFilter;

use crate::bootstrap::{context_config, resolve_settings};
use crate::cli::{InfoArgs, RunArgs};

/// Exit status for configuration and usage problems (matches clap's usage errors).
pub const EXIT_CONFIG: u8 = 2;

/// Exit status when the report or build log cannot be written to stdout.
pub const EXIT_OUTPUT: u8 = 14;

/// Exit status for failures outside every known class.
pub const EXIT_OTHER: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    pub code: u8,
    pub label: &'static str,
}

pub fn initialise_tracing() {
    let default_filter = "warn,computeprobe=info,headless=info";
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

pub fn run(args: &RunArgs) -> Result<()> {
    let settings = resolve_settings(args)?;
    tracing::debug!(
        device = %settings.device.display(),
        shader = %settings.shader.display(),
        verbose = settings.verbose,
        wait = settings.wait,
        fence_timeout = ?settings.fence_timeout,
        "resolved probe settings"
    );

    let ctx = HeadlessContext::initialize(&context_config(&settings)).with_context(|| {
        format!(
            "failed to bring up a headless context on {}",
            settings.device.display()
        )
    })?;

    let outcome = print_report(&ctx, settings.verbose).and_then(|()| run_shader(&ctx, &settings));
    ctx.shutdown();
    outcome
}

pub fn info(args: &RunArgs, info_args: &InfoArgs) -> Result<()> {
    let settings = resolve_settings(args)?;
    let ctx = HeadlessContext::initialize(&context_config(&settings)).with_context(|| {
        format!(
            "failed to bring up a headless context on {}",
            settings.device.display()
        )
    })?;

    let outcome = if info_args.json {
        let info = ctx.driver_info();
        serde_json::to_string_pretty(&info)
            .context("failed to encode driver information")
            .and_then(|json| write_stdout(|out| writeln!(out, "{json}")))
    } else {
        print_report(&ctx, settings.verbose)
    };
    ctx.shutdown();
    outcome
}

/// Runs `write` against a locked stdout and flushes it.
fn write_stdout<F>(write: F) -> Result<()>
where
    F: FnOnce(&mut io::StdoutLock<'static>) -> io::Result<()>,
{
    let mut out = io::stdout().lock();
    write(&mut out)
        .and_then(|()| out.flush())
        .context("failed to write to stdout")
}

fn print_report(ctx: &HeadlessContext, verbose: bool) -> Result<()> {
    let info = ctx.driver_info();
    write_stdout(|out| info.write_report(out, verbose)).context("failed to write driver report")
}

fn run_shader(ctx: &HeadlessContext, settings: &Settings) -> Result<()> {
    let source = ShaderSource::read(&settings.shader)?;
    if settings.verbose {
        write_stdout(|out| writeln!(out, "Compute shader source:\n{}", source.text()))?;
    }

    let program = match ComputeProgram::compile(ctx, &source) {
        Ok(program) => program,
        Err(err) => {
            if let Err(write_err) = write_stdout(|out| write_build_log(&err, out)) {
                tracing::warn!(error = %format!("{write_err:#}"), "build log not printed");
            }
            return Err(err.into());
        }
    };

    program.run()?;
    if settings.wait {
        ctx.wait_idle(settings.fence_timeout)?;
    } else {
        tracing::warn!("completion wait disabled; dispatched work may still be running at teardown");
    }
    program.unload()?;
    tracing::info!(shader = %settings.shader.display(), "compute dispatch succeeded");
    Ok(())
}

fn write_build_log<W: Write>(err: &ProbeError, out: &mut W) -> io::Result<()> {
    match err {
        ProbeError::Compile { path, log } => {
            writeln!(out, "Shader compilation error: {}\n {}", path.display(), log)
        }
        ProbeError::Link { path, log } => {
            writeln!(out, "Program link error: {}\n {}", path.display(), log)
        }
        _ => Ok(()),
    }
}

/// Finds the failure class anywhere in the error chain.
///
/// Probe errors keep their own class, configuration errors exit like usage errors, and
/// failures writing the report to stdout are reported as output failures.
pub fn classify(err: &anyhow::Error) -> Failure {
    for cause in err.chain() {
        if let Some(probe) = cause.downcast_ref::<ProbeError>() {
            let kind = probe.kind();
            return Failure {
                code: u8::try_from(kind.exit_code()).unwrap_or(EXIT_OTHER),
                label: kind.as_str(),
            };
        }
        if cause.is::<ConfigError>() {
            return Failure {
                code: EXIT_CONFIG,
                label: "configuration",
            };
        }
        if cause.is::<io::Error>() || cause.is::<serde_json::Error>() {
            return Failure {
                code: EXIT_OUTPUT,
                label: "output",
            };
        }
    }
    Failure {
        code: EXIT_OTHER,
        label: "failure",
    }
}
