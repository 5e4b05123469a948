//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `~/.hotplug/config.toml` (or `$HOTPLUG_HOME/config.toml`)
//! 3. Merge `{workspace}/.hotplug/config.toml`
//! 4. Apply `HOTPLUG_*` environment overrides
//! 5. Deserialize merged tree → `Config`
//! 6. Validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Environment variables mapped onto dotted config paths.
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("HOTPLUG_INSTALL_DIR", "plugins.install_dir", EnvKind::String),
    (
        "HOTPLUG_INSTALL_TIMEOUT_SECS",
        "plugins.install_timeout_secs",
        EnvKind::Integer,
    ),
    ("HOTPLUG_PACKAGE_MANAGER", "plugins.package_manager", EnvKind::String),
    ("HOTPLUG_REGISTRY_URL", "registry.index_url", EnvKind::String),
    ("HOTPLUG_LOG_LEVEL", "logging.level", EnvKind::String),
];

#[derive(Clone, Copy)]
enum EnvKind {
    String,
    Integer,
}

/// A loaded configuration together with the files that contributed to it.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final merged, validated configuration.
    pub config: Config,
    /// Config files that were found and merged, lowest precedence first.
    pub loaded_files: Vec<String>,
}

/// Load the configuration with layered file precedence.
///
/// `workspace_root` is the root of the current project; if `None`, the
/// workspace layer is skipped. `home_override` replaces the `.hotplug`
/// directory used for the user layer.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, or if the
/// final merged configuration fails validation.
pub fn load(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
) -> ConfigResult<ResolvedConfig> {
    let env_vars: HashMap<String, String> = std::env::vars()
        .filter(|(k, _)| k.starts_with("HOTPLUG_"))
        .collect();
    load_with_env(workspace_root, home_override, &env_vars)
}

fn load_with_env(
    workspace_root: Option<&Path>,
    home_override: Option<&Path>,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let mut loaded_files = Vec::new();

    // User layer.
    let user_dir = match home_override {
        Some(h) => Some(h.to_path_buf()),
        None => match env_vars.get("HOTPLUG_HOME") {
            Some(h) => Some(PathBuf::from(h)),
            None => Some(home_directory()?.join(".hotplug")),
        },
    };
    if let Some(dir) = user_dir {
        let path = dir.join("config.toml");
        if let Some(overlay) = try_load_file(&path)? {
            deep_merge(&mut merged, overlay);
            info!(path = %path.display(), "loaded user config");
            loaded_files.push(path.display().to_string());
        }
    }

    // Workspace layer.
    if let Some(root) = workspace_root {
        let path = root.join(".hotplug").join("config.toml");
        if let Some(overlay) = try_load_file(&path)? {
            deep_merge(&mut merged, overlay);
            info!(path = %path.display(), "loaded workspace config");
            loaded_files.push(path.display().to_string());
        }
    }

    let applied = apply_env_overrides(&mut merged, env_vars)?;
    if applied > 0 {
        debug!(count = applied, "applied environment variable overrides");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        loaded_files,
    })
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let value = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Try to load a file, returning `None` if the file doesn't exist.
///
/// Uses a single read operation instead of an `exists()` check followed by
/// a read.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

/// Recursively merge `overlay` into `base`. Tables merge key by key; any
/// other value in the overlay replaces the base value.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        },
        (base, overlay) => *base = overlay,
    }
}

/// Write recognised `HOTPLUG_*` variables into the merged tree.
///
/// Returns the number of overrides applied.
fn apply_env_overrides(
    merged: &mut toml::Value,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<usize> {
    let mut applied = 0usize;
    for (var, path, kind) in ENV_OVERRIDES {
        let Some(raw) = env_vars.get(*var) else {
            continue;
        };
        let value = match kind {
            EnvKind::String => toml::Value::String(raw.clone()),
            EnvKind::Integer => {
                let n: i64 = raw.trim().parse().map_err(|_| ConfigError::ValidationError {
                    field: (*var).to_owned(),
                    message: format!("expected an integer, got '{raw}'"),
                })?;
                toml::Value::Integer(n)
            },
        };
        set_path(merged, path, value);
        applied = applied.saturating_add(1);
    }
    Ok(applied)
}

fn set_path(root: &mut toml::Value, dotted: &str, value: toml::Value) {
    let mut current = root;
    let mut parts = dotted.split('.').peekable();
    while let Some(part) = parts.next() {
        let toml::Value::Table(table) = current else {
            return;
        };
        if parts.peek().is_none() {
            table.insert(part.to_owned(), value);
            return;
        }
        current = table
            .entry(part.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
