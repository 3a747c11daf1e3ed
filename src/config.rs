//! Shared configuration helpers.
//!
//! Component configs (`EngineConfig`, `MonitorConfig`, `OrchestratorConfig`)
//! read `QUOTEFLOW_*` environment variables through these helpers so that
//! invalid values are reported the same way everywhere.

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Reads and parses `key` if it is set.
pub(crate) fn env_value<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => parse_env_value(&val, key).map(Some),
        Err(_) => Ok(None),
    }
}

/// Reads `key` as a boolean if it is set.
pub(crate) fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => parse_env_bool(&val, key).map(Some),
        Err(_) => Ok(None),
    }
}

/// Parse an environment variable value into a type.
pub(crate) fn parse_env_value<T: std::str::FromStr>(
    value: &str,
    key: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_value() {
        let n: usize = parse_env_value(" 8 ", "QUOTEFLOW_WORKERS").unwrap();
        assert_eq!(n, 8);

        let err = parse_env_value::<u64>("eight", "QUOTEFLOW_WORKERS").unwrap_err();
        assert!(err.to_string().contains("QUOTEFLOW_WORKERS"));
        assert!(err.to_string().contains("eight"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(parse_env_bool("on", "test").unwrap());

        assert!(!parse_env_bool("false", "test").unwrap());
        assert!(!parse_env_bool("0", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());

        assert!(parse_env_bool("maybe", "test").is_err());
    }

    #[test]
    fn test_env_value_unset() {
        let value: Option<u32> = env_value("QUOTEFLOW_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert!(value.is_none());
    }
}
