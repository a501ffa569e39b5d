use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEVICE: &str = "/dev/dri/renderD128";
pub const DEFAULT_SHADER: &str = "shader.cs";
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest completion wait accepted from the config file or the command line.
pub const MAX_FENCE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk probe configuration. Every field is optional; CLI flags win over file values.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shader: Option<PathBuf>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            device: None,
            shader: None,
            verbose: false,
            sync: SyncConfig::default(),
        }
    }
}

/// Whether to wait for dispatched work before teardown, and for how long.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_wait")]
    pub wait: bool,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            wait: default_wait(),
            timeout: default_timeout(),
        }
    }
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub device: Option<PathBuf>,
    pub shader: Option<PathBuf>,
    pub verbose: bool,
    pub no_wait: bool,
    pub fence_timeout: Option<Duration>,
}

/// Fully resolved settings for one probe run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub device: PathBuf,
    pub shader: PathBuf,
    pub verbose: bool,
    pub wait: bool,
    pub fence_timeout: Duration,
}

fn default_version() -> u32 {
    1
}

fn default_wait() -> bool {
    true
}

fn default_timeout() -> Duration {
    DEFAULT_FENCE_TIMEOUT
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() || !v.is_finite() {
                return Err(E::custom("duration must be a finite non-negative number"));
            }
            Duration::try_from_secs_f64(v).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Parses `"250ms"`, `"5s"`, `"1m 30s"` and similar.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw.trim()).map_err(|err| format!("invalid duration '{raw}': {err}"))
}

/// Rejects completion waits longer than [`MAX_FENCE_TIMEOUT`].
pub fn check_fence_timeout(timeout: Duration) -> Result<(), String> {
    if timeout > MAX_FENCE_TIMEOUT {
        return Err(format!(
            "fence timeout {} exceeds the {} limit",
            humantime::format_duration(timeout),
            humantime::format_duration(MAX_FENCE_TIMEOUT)
        ));
    }
    Ok(())
}

impl ProbeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: ProbeConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if let Some(device) = &self.device {
            if device.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("device path may not be empty".into()));
            }
        }

        if let Some(shader) = &self.shader {
            if shader.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("shader path may not be empty".into()));
            }
        }

        if self.sync.wait && self.sync.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "sync.timeout must be greater than zero when sync.wait is enabled".into(),
            ));
        }

        check_fence_timeout(self.sync.timeout).map_err(ConfigError::Invalid)?;

        Ok(())
    }

    /// Merges command-line overrides over file values over built-in defaults.
    pub fn resolve(&self, overrides: &Overrides) -> Settings {
        let device = overrides
            .device
            .clone()
            .or_else(|| self.device.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE));
        let shader = overrides
            .shader
            .clone()
            .or_else(|| self.shader.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SHADER));

        Settings {
            device,
            shader,
            verbose: overrides.verbose || self.verbose,
            wait: !overrides.no_wait && self.sync.wait,
            fence_timeout: overrides.fence_timeout.unwrap_or(self.sync.timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1
device = "/dev/dri/renderD129"
shader = "probes/noop.cs"
verbose = true

[sync]
wait = true
timeout = "750ms"
"#;

    #[test]
    fn parses_sample_config() {
        let config = ProbeConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.version, 1);
        assert_eq!(config.device.as_deref(), Some(Path::new("/dev/dri/renderD129")));
        assert_eq!(config.shader.as_deref(), Some(Path::new("probes/noop.cs")));
        assert!(config.verbose);
        assert_eq!(config.sync.timeout, Duration::from_millis(750));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = ProbeConfig::from_toml_str("").unwrap();
        let settings = config.resolve(&Overrides::default());
        assert_eq!(settings.device, PathBuf::from(DEFAULT_DEVICE));
        assert_eq!(settings.shader, PathBuf::from(DEFAULT_SHADER));
        assert!(!settings.verbose);
        assert!(settings.wait);
        assert_eq!(settings.fence_timeout, DEFAULT_FENCE_TIMEOUT);
    }

    #[test]
    fn numeric_timeouts_are_seconds() {
        let config = ProbeConfig::from_toml_str("[sync]\ntimeout = 2\n").unwrap();
        assert_eq!(config.sync.timeout, Duration::from_secs(2));
        let config = ProbeConfig::from_toml_str("[sync]\ntimeout = 0.5\n").unwrap();
        assert_eq!(config.sync.timeout, Duration::from_millis(500));
    }

    #[test]
    fn oversized_float_timeout_is_a_parse_error() {
        let err = ProbeConfig::from_toml_str("[sync]\ntimeout = 1e30\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_timeouts_beyond_the_limit() {
        let err =
            ProbeConfig::from_toml_str("[sync]\ntimeout = 9223372036854775807\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("exceeds")));

        let config = ProbeConfig::from_toml_str("[sync]\ntimeout = \"24h\"\n").unwrap();
        assert_eq!(config.sync.timeout, MAX_FENCE_TIMEOUT);
        assert!(check_fence_timeout(MAX_FENCE_TIMEOUT + Duration::from_nanos(1)).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        let err = ProbeConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_timeout_when_waiting() {
        let err = ProbeConfig::from_toml_str("[sync]\ntimeout = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config =
            ProbeConfig::from_toml_str("[sync]\nwait = false\ntimeout = \"0s\"\n").unwrap();
        assert!(!config.sync.wait);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = ProbeConfig::from_toml_str("devcie = \"/dev/dri/renderD128\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_empty_paths() {
        let err = ProbeConfig::from_toml_str("device = \"\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn overrides_take_precedence() {
        let config = ProbeConfig::from_toml_str(SAMPLE).unwrap();
        let overrides = Overrides {
            device: Some(PathBuf::from("/dev/dri/renderD130")),
            shader: None,
            verbose: false,
            no_wait: true,
            fence_timeout: Some(Duration::from_secs(1)),
        };
        let settings = config.resolve(&overrides);
        assert_eq!(settings.device, PathBuf::from("/dev/dri/renderD130"));
        assert_eq!(settings.shader, PathBuf::from("probes/noop.cs"));
        assert!(settings.verbose, "file verbosity still applies");
        assert!(!settings.wait);
        assert_eq!(settings.fence_timeout, Duration::from_secs(1));
    }

    #[test]
    fn parses_human_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 1m 30s ").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }
}
