//! Agent configuration
//!
//! The agent is configured with a single options string, typically taken
//! from the `CALLSCOPE_AGENT` environment variable:
//!
//! ```text
//! CALLSCOPE_AGENT="port=7890,waitconn=true,verbosity=2"
//! ```
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `port` | 7890 | TCP port of the command server (0 = any free port) |
//! | `waitconn` | false | Block startup until a console sends the first rules |
//! | `verbosity` | 1 | 0 = warn, 1 = info, 2 = debug, 3+ = trace |
//! | `enabled` | true | Start the command server at all |
//! | `exitonfailure` | true | Exit the process on a fatal engine error |
//! | `snapshotonexit` | false | Save a snapshot file on shutdown |
//! | `stackdepth` | 1024 | Maximum instrumented call depth per thread |
//! | `maxmethods` | 65535 | Maximum methods per session (capped at 65535) |
//!
//! A boolean key without a value (`waitconn`) means `true`.

use crate::domain::ConfigError;
use crate::engine::EngineLimits;
use callscope_common::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_PORT, MAX_METHODS_PER_SESSION};
use log::LevelFilter;
use std::str::FromStr;

/// Environment variable holding the agent options string
pub const AGENT_OPTIONS_ENV: &str = "CALLSCOPE_AGENT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub port: u16,
    pub wait_connection: bool,
    pub verbosity: u8,
    pub enabled: bool,
    pub exit_on_failure: bool,
    pub snapshot_on_exit: bool,
    pub max_call_depth: usize,
    pub max_methods: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            wait_connection: false,
            verbosity: 1,
            enabled: true,
            exit_on_failure: true,
            snapshot_on_exit: false,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_methods: MAX_METHODS_PER_SESSION,
        }
    }
}

impl AgentConfig {
    /// Read [`AGENT_OPTIONS_ENV`], falling back to defaults when unset.
    ///
    /// # Errors
    /// Malformed options in the variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(AGENT_OPTIONS_ENV) {
            Ok(options) => options.parse(),
            Err(_) => Ok(Self::default()),
        }
    }

    #[must_use]
    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            max_methods: self.max_methods.min(MAX_METHODS_PER_SESSION),
            max_call_depth: self.max_call_depth,
        }
    }

    /// Log level implied by `verbosity`
    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: Option<&str>) -> Result<T, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.unwrap_or_default().to_string(),
    };
    value.ok_or_else(invalid)?.trim().parse().map_err(|_| invalid())
}

fn parse_flag(key: &str, value: Option<&str>) -> Result<bool, ConfigError> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("true" | "on" | "yes" | "1") => Ok(true),
        Some("false" | "off" | "no" | "0") => Ok(false),
        Some(other) => {
            Err(ConfigError::InvalidValue { key: key.to_string(), value: other.to_string() })
        }
    }
}

impl FromStr for AgentConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = AgentConfig::default();
        for arg in s.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value)),
                None => (arg, None),
            };
            match key.to_ascii_lowercase().as_str() {
                "port" => config.port = parse_value(key, value)?,
                "waitconn" => config.wait_connection = parse_flag(key, value)?,
                "verbosity" => config.verbosity = parse_value(key, value)?,
                "enabled" => config.enabled = parse_flag(key, value)?,
                "exitonfailure" => config.exit_on_failure = parse_flag(key, value)?,
                "snapshotonexit" => config.snapshot_on_exit = parse_flag(key, value)?,
                "stackdepth" => config.max_call_depth = parse_value(key, value)?,
                "maxmethods" => {
                    config.max_methods =
                        parse_value::<usize>(key, value)?.min(MAX_METHODS_PER_SESSION);
                }
                _ => return Err(ConfigError::UnknownOption(key.to_string())),
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_gives_defaults() {
        assert_eq!("".parse::<AgentConfig>().unwrap(), AgentConfig::default());
    }

    #[test]
    fn test_parse_all_options() {
        let config: AgentConfig = "port=0, waitconn, verbosity=3,enabled=false,exitonfailure=off,\
                                   snapshotonexit=true,stackdepth=64,maxmethods=100"
            .parse()
            .unwrap();
        assert_eq!(config.port, 0);
        assert!(config.wait_connection);
        assert_eq!(config.log_level(), LevelFilter::Trace);
        assert!(!config.enabled);
        assert!(!config.exit_on_failure);
        assert!(config.snapshot_on_exit);
        assert_eq!(config.engine_limits(), EngineLimits { max_methods: 100, max_call_depth: 64 });
    }

    #[test]
    fn test_max_methods_is_capped() {
        let config: AgentConfig = "maxmethods=100000".parse().unwrap();
        assert_eq!(config.max_methods, MAX_METHODS_PER_SESSION);
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        assert_eq!(
            "password=secret".parse::<AgentConfig>(),
            Err(ConfigError::UnknownOption("password".into()))
        );
    }

    #[test]
    fn test_bad_values_are_rejected() {
        assert!(matches!(
            "port=http".parse::<AgentConfig>(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "port"
        ));
        assert!("waitconn=maybe".parse::<AgentConfig>().is_err());
        assert!("port".parse::<AgentConfig>().is_err());
    }
}
