//! Locates the per-user configuration directory, honouring `COMPUTEPROBE_CONFIG_DIR`.
//!
//! Types:
//!
//! - `AppPaths` holds the resolved configuration directory.
//!
//! Functions:
//!
//! - `AppPaths::discover` applies the environment override before falling back to the
//!   platform default from `directories-next`.

use std::env;
use std::path::{Path, PathBuf};

use directories_next::ProjectDirs;

pub const ENV_CONFIG_DIR: &str = "COMPUTEPROBE_CONFIG_DIR";
pub const CONFIG_FILE_NAME: &str = "computeprobe.toml";

const QUALIFIER: &str = "org";
const ORGANISATION: &str = "computeprobe";
const APPLICATION: &str = "computeprobe";

#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
}

impl AppPaths {
    /// Returns `None` when neither the override nor a home directory is available.
    pub fn discover() -> Option<Self> {
        if let Some(config_dir) = env_override(ENV_CONFIG_DIR) {
            return Some(Self { config_dir });
        }
        let project_dirs = ProjectDirs::from(QUALIFIER, ORGANISATION, APPLICATION)?;
        Some(Self {
            config_dir: project_dirs.config_dir().to_path_buf(),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }
}

fn env_override(name: &str) -> Option<PathBuf> {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => Some(PathBuf::from(value)),
        _ => None,
    }
}
