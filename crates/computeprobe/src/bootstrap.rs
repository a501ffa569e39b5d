//! Turns CLI arguments and the optional configuration file into the settings a probe run
//! consumes.
//!
//! Functions:
//!
//! - `resolve_settings` loads the config (explicit path, then user default) and applies CLI
//!   overrides.
//! - `context_config` maps settings onto the `headless` bring-up parameters.

use std::path::Path;

use anyhow::{Context, Result};
use headless::ContextConfig;
use probeconfig::{Overrides, ProbeConfig, Settings};
use tracing::debug;

use crate::cli::RunArgs;
use crate::paths::AppPaths;

pub fn resolve_settings(args: &RunArgs) -> Result<Settings> {
    let config = load_config(args.config.as_deref())?;
    let overrides = Overrides {
        device: args.device.clone(),
        shader: args.shader.clone(),
        verbose: args.verbose,
        no_wait: args.no_wait,
        fence_timeout: args.fence_timeout,
    };
    Ok(config.resolve(&overrides))
}

fn load_config(explicit: Option<&Path>) -> Result<ProbeConfig> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading configuration");
        return ProbeConfig::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()));
    }

    let Some(paths) = AppPaths::discover() else {
        debug!("no user configuration directory; using defaults");
        return Ok(ProbeConfig::default());
    };
    let candidate = paths.config_file();
    if candidate.is_file() {
        debug!(path = %candidate.display(), "loading user configuration");
        ProbeConfig::load(&candidate)
            .with_context(|| format!("failed to load configuration {}", candidate.display()))
    } else {
        debug!(
            config_dir = %paths.config_dir().display(),
            "no configuration file found; using defaults"
        );
        Ok(ProbeConfig::default())
    }
}

pub fn context_config(settings: &Settings) -> ContextConfig {
    ContextConfig {
        render_node: settings.device.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn explicit_config_is_loaded_and_overridden() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.toml");
        fs::write(
            &path,
            "device = \"/dev/dri/renderD129\"\nshader = \"noop.cs\"\n[sync]\ntimeout = \"2s\"\n",
        )
        .unwrap();

        let args = RunArgs {
            shader: Some(PathBuf::from("override.cs")),
            config: Some(path),
            ..RunArgs::default()
        };
        let settings = resolve_settings(&args).unwrap();
        assert_eq!(settings.device, PathBuf::from("/dev/dri/renderD129"));
        assert_eq!(settings.shader, PathBuf::from("override.cs"));
        assert_eq!(settings.fence_timeout, Duration::from_secs(2));
        assert_eq!(
            context_config(&settings).render_node,
            PathBuf::from("/dev/dri/renderD129")
        );
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let args = RunArgs {
            config: Some(dir.path().join("absent.toml")),
            ..RunArgs::default()
        };
        let err = resolve_settings(&args).unwrap_err();
        assert!(format!("{err:#}").contains("absent.toml"));
    }
}
