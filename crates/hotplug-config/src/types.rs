//! Configuration types for the plugin lifecycle manager.
//!
//! Every struct implements [`Default`] with production defaults so that a
//! bare `[section]` header in TOML produces a working configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Installation settings (target directory, external tools, timeout).
    pub plugins: PluginsSection,
    /// Remote plugin catalog settings.
    pub registry: RegistrySection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

impl Config {
    /// Directory under which installed plugin artifacts are placed.
    ///
    /// Uses `plugins.install_dir` when set, otherwise `~/.hotplug/plugins`.
    /// Falls back to a relative `.hotplug/plugins` when no home directory
    /// can be determined.
    #[must_use]
    pub fn resolved_install_dir(&self) -> PathBuf {
        if let Some(dir) = &self.plugins.install_dir {
            return PathBuf::from(dir);
        }
        directories::BaseDirs::new().map_or_else(
            || PathBuf::from(".hotplug").join("plugins"),
            |d| d.home_dir().join(".hotplug").join("plugins"),
        )
    }
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Plugin installation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Root directory for installed plugins. `None` uses `~/.hotplug/plugins`.
    pub install_dir: Option<String>,
    /// Upper bound (in seconds) on a single install operation.
    pub install_timeout_secs: u64,
    /// Package manager executable used for managed-package installs and
    /// dependency installation inside cloned repositories.
    pub package_manager: String,
    /// Git executable used for source-repository installs.
    pub git_command: String,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            install_dir: None,
            install_timeout_secs: 60,
            package_manager: "npm".to_owned(),
            git_command: "git".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistrySection
// ---------------------------------------------------------------------------

/// Remote plugin catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// URL of the JSON index mapping plugin names to registry entries.
    pub index_url: String,
    /// How long (in seconds) a fetched catalog is served from cache.
    pub cache_ttl_secs: u64,
    /// HTTP request timeout (in seconds) for index fetches.
    pub request_timeout_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            index_url: "https://raw.githubusercontent.com/hotplug-registry/registry/main/index.json"
                .to_owned(),
            cache_ttl_secs: 3600,
            request_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"`, or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["hotplug_plugins=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_sections_use_defaults() {
        let config: Config = toml::from_str("[plugins]\n[registry]\n[logging]\n").unwrap();
        assert_eq!(config.plugins.install_timeout_secs, 60);
        assert_eq!(config.plugins.package_manager, "npm");
        assert_eq!(config.registry.cache_ttl_secs, 3600);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn explicit_install_dir_wins() {
        let mut config = Config::default();
        config.plugins.install_dir = Some("/opt/plugins".to_owned());
        assert_eq!(config.resolved_install_dir(), PathBuf::from("/opt/plugins"));
    }

    #[test]
    fn default_install_dir_ends_with_plugins() {
        let config = Config::default();
        let dir = config.resolved_install_dir();
        assert!(dir.ends_with(".hotplug/plugins"));
    }
}
