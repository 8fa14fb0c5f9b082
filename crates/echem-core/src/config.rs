//! Engine configuration.
//!
//! Configuration is layered with `figment`:
//! 1. built-in defaults ([`EngineConfig::default`])
//! 2. an optional TOML file
//! 3. environment variables prefixed with `ECHEM_`, nested keys separated by
//!    `__` (for example `ECHEM_RETRY__MAX_ATTEMPTS=5`)
//!
//! Durations use human readable strings such as `"250ms"` or `"5s"`.
//!
//! # Example
//! ```no_run
//! use echem_core::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("echem.toml")?;
//! println!("polling every {:?}", config.poll_interval);
//! # Ok::<(), echem_core::EchemError>(())
//! ```

use crate::error::{EchemError, Result};
use crate::retry::RetryPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "ECHEM_";

/// Settings shared by every channel executor of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the sleep between two polls of a running channel.
    ///
    /// The effective cadence is the smaller of this value and the sampling
    /// interval declared by the loaded techniques.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Deadline of a single driver call (load, start, stop, poll, ...).
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Deadline of a connection attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Retry policy for transient driver failures.
    pub retry: RetryPolicy,

    /// Connect on `run()` and disconnect once the last session ends.
    pub autoconnect: bool,

    /// Hold every channel at a barrier until all of them started.
    pub sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            autoconnect: true,
            sync: false,
        }
    }
}

impl EngineConfig {
    /// Layered provider: defaults, then `path` when given, then environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Loads defaults and environment overrides.
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment(None))
    }

    /// Loads defaults, the TOML file at `path`, and environment overrides.
    ///
    /// A missing file is not an error; its layer is simply empty.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::extract(Self::figment(Some(path.as_ref())))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero durations.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("poll_interval", self.poll_interval),
            ("call_timeout", self.call_timeout),
            ("connect_timeout", self.connect_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(EchemError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults() {
        let config = EngineConfig::load().unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.autoconnect);
        assert!(!config.sync);
    }

    #[test]
    #[serial]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
            poll_interval = "250ms"
            sync = true

            [retry]
            max_attempts = 5
            backoff = "1s"
            "#,
        );
        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.sync);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_delay, Duration::from_secs(1));
        assert_eq!(config.call_timeout, Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let file = write_config("call_timeout = \"2s\"\n");
        std::env::set_var("ECHEM_CALL_TIMEOUT", "750ms");
        std::env::set_var("ECHEM_RETRY__MAX_ATTEMPTS", "0");
        let result = EngineConfig::load_from(file.path());
        std::env::remove_var("ECHEM_CALL_TIMEOUT");
        std::env::remove_var("ECHEM_RETRY__MAX_ATTEMPTS");

        let config = result.unwrap();
        assert_eq!(config.call_timeout, Duration::from_millis(750));
        assert_eq!(config.retry.max_attempts, 0);
    }

    #[test]
    #[serial]
    fn test_zero_duration_rejected() {
        let file = write_config("poll_interval = \"0s\"\n");
        let err = EngineConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, EchemError::Config(ref msg) if msg.contains("poll_interval")));
    }

    #[test]
    #[serial]
    fn test_malformed_duration_is_config_error() {
        let file = write_config("connect_timeout = \"soon\"\n");
        assert!(matches!(
            EngineConfig::load_from(file.path()),
            Err(EchemError::Config(_))
        ));
    }
}
