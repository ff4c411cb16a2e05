//! Client configuration.
//!
//! Defaults match the wire behavior of the protocol: calls expire after 5s and
//! the connection is pinged every 5s. Both can be overridden in code, from a
//! serialized config, or from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `JSONRPC_WS_CALL_TIMEOUT_MS` | `call_timeout` |
//! | `JSONRPC_WS_KEEPALIVE_MS` | `keepalive_interval` |

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default time a call waits for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between keepalive pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const CALL_TIMEOUT_ENV: &str = "JSONRPC_WS_CALL_TIMEOUT_MS";
const KEEPALIVE_ENV: &str = "JSONRPC_WS_KEEPALIVE_MS";

/// Tunables for a [`Client`](crate::Client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long a call waits for its response before it expires.
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    /// Interval between keepalive pings once connected. Zero disables them.
    #[serde(rename = "keepalive_interval_ms", with = "millis")]
    pub keepalive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Load overrides from the environment on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but is not a whole number of
    /// milliseconds.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(timeout) = duration_from_env(CALL_TIMEOUT_ENV)? {
            config.call_timeout = timeout;
        }
        if let Some(interval) = duration_from_env(KEEPALIVE_ENV)? {
            config.keepalive_interval = interval;
        }

        Ok(config)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

fn duration_from_env(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value: {}", name, raw))?;
            Ok(Some(Duration::from_millis(millis)))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", name)),
    }
}

/// Serialize a `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::ser::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis())
            .map_err(|_| S::Error::custom(format!("{:?} does not fit in u64 milliseconds", value)))?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
