//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound on the install timeout (one hour).
const MAX_INSTALL_TIMEOUT_SECS: u64 = 3600;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_registry(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let p = &config.plugins;

    if p.install_timeout_secs == 0 || p.install_timeout_secs > MAX_INSTALL_TIMEOUT_SECS {
        return Err(ConfigError::ValidationError {
            field: "plugins.install_timeout_secs".to_owned(),
            message: format!(
                "{} is out of range; must be between 1 and {MAX_INSTALL_TIMEOUT_SECS}",
                p.install_timeout_secs
            ),
        });
    }

    if p.package_manager.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "plugins.package_manager".to_owned(),
            message: "must not be empty".to_owned(),
        });
    }

    if p.git_command.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "plugins.git_command".to_owned(),
            message: "must not be empty".to_owned(),
        });
    }

    if let Some(dir) = &p.install_dir
        && dir.trim().is_empty()
    {
        return Err(ConfigError::ValidationError {
            field: "plugins.install_dir".to_owned(),
            message: "must not be empty when set".to_owned(),
        });
    }

    Ok(())
}

fn validate_registry(config: &Config) -> ConfigResult<()> {
    let r = &config.registry;

    if !(r.index_url.starts_with("https://") || r.index_url.starts_with("http://")) {
        return Err(ConfigError::ValidationError {
            field: "registry.index_url".to_owned(),
            message: format!("'{}' must be an http:// or https:// URL", r.index_url),
        });
    }

    if r.cache_ttl_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "registry.cache_ttl_secs".to_owned(),
            message: "must be greater than zero".to_owned(),
        });
    }

    if r.request_timeout_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "registry.request_timeout_secs".to_owned(),
            message: "must be greater than zero".to_owned(),
        });
    }

    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;

    if !matches!(
        l.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unknown level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        });
    }

    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unknown format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn zero_install_timeout_rejected() {
        let mut config = Config::default();
        config.plugins.install_timeout_secs = 0;
        let err = validate(&config).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref field, .. } if field == "plugins.install_timeout_secs")
        );
    }

    #[test]
    fn non_http_registry_url_rejected() {
        let mut config = Config::default();
        config.registry.index_url = "file:///etc/passwd".to_owned();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn empty_package_manager_rejected() {
        let mut config = Config::default();
        config.plugins.package_manager = "  ".to_owned();
        assert!(validate(&config).is_err());
    }
}
