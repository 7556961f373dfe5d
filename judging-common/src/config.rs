//! Configuration loading and root folder resolution
//!
//! A missing configuration file is never fatal: callers get compiled
//! defaults and a warning in the log.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable consulted for the root folder
pub const ROOT_FOLDER_ENV: &str = "JUDGING_ROOT_FOLDER";

/// Directory name used under the platform config/data dirs
const APP_DIR: &str = "judging";

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `root_folder` key of the TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(
    cli_arg: Option<&str>,
    env_var_name: &str,
    config_file: Option<&Path>,
) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(config_path) = config_file {
        if let Ok(toml_content) = std::fs::read_to_string(config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                    return PathBuf::from(root_folder);
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Locate the platform configuration file, if one exists
///
/// Linux checks `~/.config/judging/config.toml` then `/etc/judging/config.toml`;
/// other platforms only check the user config dir.
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc").join(APP_DIR).join("config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/judging (or /var/lib/judging for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/var/lib").join(APP_DIR))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support").join(APP_DIR))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData").join(APP_DIR))
    } else {
        PathBuf::from("./judging_data")
    }
}

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Parsed from this file
    File(PathBuf),
    /// Compiled defaults; holds the path that was looked for, if any
    Defaults(Option<PathBuf>),
}

impl ConfigOrigin {
    /// Report the origin; call once logging is initialized
    pub fn log(&self) {
        match self {
            ConfigOrigin::File(path) => info!("Loaded config file {}", path.display()),
            ConfigOrigin::Defaults(None) => warn!("No config file found, using compiled defaults"),
            ConfigOrigin::Defaults(Some(path)) => {
                warn!("Config file {} not found, using compiled defaults", path.display())
            }
        }
    }
}

/// Load a TOML document into `T`, falling back to `T::default()`
///
/// - `None` or a path that does not exist: defaults
/// - unreadable or malformed file: `Error::Config`
///
/// Nothing is logged here, since this usually runs before the subscriber
/// is installed; log the returned [`ConfigOrigin`] afterwards.
pub fn load_toml_or_default<T>(path: Option<&Path>) -> Result<(T, ConfigOrigin)>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        return Ok((T::default(), ConfigOrigin::Defaults(None)));
    };

    if !path.exists() {
        return Ok((T::default(), ConfigOrigin::Defaults(Some(path.to_path_buf()))));
    }

    let content = std::fs::read_to_string(path)?;
    let parsed = toml::from_str::<T>(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    Ok((parsed, ConfigOrigin::File(path.to_path_buf())))
}
