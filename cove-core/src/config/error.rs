//! Failures raised while loading or validating configuration

use thiserror::Error;

/// Why a configuration could not be produced
///
/// Env-derived and file-derived settings fail differently: a bad
/// environment variable names itself, a bad file read carries the IO
/// detail, and `Invalid` is the validation verdict over an otherwise
/// well-formed aggregate.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Read(String),

    #[error("could not write config file: {0}")]
    Write(String),

    #[error("malformed config TOML: {0}")]
    Malformed(String),

    #[error("could not render config as TOML: {0}")]
    Render(String),

    #[error("bad environment value: {0}")]
    BadEnvValue(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_source() {
        let err = ConfigError::BadEnvValue("COVE_DEDUP_MAX_ENTRIES: not a number".to_string());
        assert!(err.to_string().starts_with("bad environment value"));

        let err = ConfigError::Invalid("dedup.keep_entries exceeds max_entries".to_string());
        assert!(err.to_string().contains("dedup.keep_entries"));
    }
}
