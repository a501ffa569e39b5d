use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "computeprobe",
    author,
    version,
    about = "Run one OpenGL ES compute shader on a DRM render node without a display server",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Compute shader source file (defaults to `shader.cs`).
    #[arg(value_name = "SHADER")]
    pub shader: Option<PathBuf>,

    /// DRM render node to open (defaults to `/dev/dri/renderD128`).
    #[arg(long, env = "COMPUTEPROBE_DEVICE", value_name = "PATH")]
    pub device: Option<PathBuf>,

    /// Configuration file; otherwise `computeprobe.toml` in the user config directory is used
    /// when present.
    #[arg(long, env = "COMPUTEPROBE_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print extension strings and echo the shader source.
    #[arg(short, long)]
    pub verbose: bool,

    /// Skip the completion fence and tear down right after dispatch.
    #[arg(long)]
    pub no_wait: bool,

    /// How long to wait for dispatched work before giving up (e.g. `500ms`, `5s`).
    #[arg(long, value_name = "DURATION", value_parser = parse_fence_timeout)]
    pub fence_timeout: Option<Duration>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring up the context, print driver information, and shut down without running a shader.
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Emit the driver information as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_fence_timeout(value: &str) -> Result<Duration, String> {
    let duration = probeconfig::parse_duration(value)?;
    if duration.is_zero() {
        return Err("fence timeout must be greater than zero; use --no-wait to skip".to_string());
    }
    probeconfig::check_fence_timeout(duration)?;
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "computeprobe",
            "--device",
            "/dev/dri/renderD129",
            "--fence-timeout",
            "250ms",
            "-v",
            "probe.cs",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.shader, Some(PathBuf::from("probe.cs")));
        assert_eq!(cli.run.device, Some(PathBuf::from("/dev/dri/renderD129")));
        assert_eq!(cli.run.fence_timeout, Some(Duration::from_millis(250)));
        assert!(cli.run.verbose);
        assert!(!cli.run.no_wait);
    }

    #[test]
    fn parses_info_subcommand() {
        let cli = Cli::try_parse_from(["computeprobe", "info", "--json"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Info(InfoArgs { json: true }))));
    }

    #[test]
    fn rejects_zero_fence_timeout() {
        assert!(parse_fence_timeout("0s").is_err());
        assert!(parse_fence_timeout("later").is_err());
        assert_eq!(parse_fence_timeout("2s").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_fence_timeouts_beyond_the_limit() {
        assert!(parse_fence_timeout("500000000000years").is_err());
        assert!(parse_fence_timeout("25h").is_err());
        assert_eq!(
            parse_fence_timeout("24h").unwrap(),
            probeconfig::MAX_FENCE_TIMEOUT
        );
    }
}
