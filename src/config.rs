//! Client configuration.
//!
//! A [`ClientConfig`] can be built in code or read from the environment:
//!
//! | Variable                         | Meaning                             |
//! |----------------------------------|-------------------------------------|
//! | `CHANNELBOX_TOKEN`               | transport login token (required)    |
//! | `CHANNELBOX_CHANNEL_ID`          | broadcast channel id (required)     |
//! | `CHANNELBOX_LOGIN_COOLDOWN_SECS` | backoff after a failed login        |

use std::time::Duration;

use crate::transport::Credentials;
use crate::types::{ChannelBoxError, Result, DEFAULT_LOGIN_FAILURE_COOLDOWN_SECS};

pub const ENV_TOKEN: &str = "CHANNELBOX_TOKEN";
pub const ENV_CHANNEL_ID: &str = "CHANNELBOX_CHANNEL_ID";
pub const ENV_LOGIN_COOLDOWN_SECS: &str = "CHANNELBOX_LOGIN_COOLDOWN_SECS";

/// Configuration for a [`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Transport login credentials.
    pub credentials: Credentials,
    /// Id of the broadcast channel to join.
    pub channel_id: String,
    /// Cooldown armed after a failed login or channel fetch.
    pub login_failure_cooldown_secs: u64,
    /// Period of the cooldown timer. One second outside of tests.
    pub tick_interval: Duration,
}

impl ClientConfig {
    /// Creates a configuration with default timings.
    pub fn new(token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(token),
            channel_id: channel_id.into(),
            login_failure_cooldown_secs: DEFAULT_LOGIN_FAILURE_COOLDOWN_SECS,
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Reads the configuration from `CHANNELBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let token = lookup(ENV_TOKEN)
            .ok_or_else(|| ChannelBoxError::ConfigError(format!("{ENV_TOKEN} is not set")))?;
        let channel_id = lookup(ENV_CHANNEL_ID)
            .ok_or_else(|| ChannelBoxError::ConfigError(format!("{ENV_CHANNEL_ID} is not set")))?;

        let mut config = Self::new(token, channel_id);
        if let Some(raw) = lookup(ENV_LOGIN_COOLDOWN_SECS) {
            let secs = raw.trim().parse::<u64>().map_err(|e| {
                ChannelBoxError::ConfigError(format!("{ENV_LOGIN_COOLDOWN_SECS}={raw:?}: {e}"))
            })?;
            config = config.with_login_failure_cooldown(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_login_failure_cooldown(mut self, secs: u64) -> Self {
        self.login_failure_cooldown_secs = secs;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Checks that a connect attempt has everything it needs.
    pub fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            return Err(ChannelBoxError::ConfigError(
                "missing transport credentials".to_string(),
            ));
        }
        if self.channel_id.trim().is_empty() {
            return Err(ChannelBoxError::ConfigError("missing channel id".to_string()));
        }
        if self.login_failure_cooldown_secs == 0 {
            return Err(ChannelBoxError::ConfigError(
                "login failure cooldown must be at least one second".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(ChannelBoxError::ConfigError(
                "tick interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("token", "general");
        assert_eq!(config.login_failure_cooldown_secs, 120);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_are_config_errors() {
        for config in [
            ClientConfig::new("", "general"),
            ClientConfig::new("token", "  "),
            ClientConfig::new("token", "general").with_tick_interval(Duration::ZERO),
            ClientConfig::new("token", "general").with_login_failure_cooldown(0),
        ] {
            assert!(matches!(
                config.validate(),
                Err(ChannelBoxError::ConfigError(_))
            ));
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_TOKEN, "abc"),
            (ENV_CHANNEL_ID, "general"),
            (ENV_LOGIN_COOLDOWN_SECS, "30"),
        ]))
        .unwrap();
        assert_eq!(config.credentials.token(), "abc");
        assert_eq!(config.channel_id, "general");
        assert_eq!(config.login_failure_cooldown_secs, 30);
    }

    #[test]
    fn test_from_lookup_errors() {
        assert!(ClientConfig::from_lookup(lookup(&[(ENV_CHANNEL_ID, "general")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[(ENV_TOKEN, "abc")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[
            (ENV_TOKEN, "abc"),
            (ENV_CHANNEL_ID, "general"),
            (ENV_LOGIN_COOLDOWN_SECS, "soon"),
        ]))
        .is_err());
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[
                (ENV_TOKEN, "abc"),
                (ENV_CHANNEL_ID, "general"),
                (ENV_LOGIN_COOLDOWN_SECS, "0"),
            ])),
            Err(ChannelBoxError::ConfigError(_))
        ));
    }
}
