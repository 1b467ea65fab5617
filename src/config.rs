use crate::error::{Result, WmpError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default WMP port of IntesisBox firmware
pub const DEFAULT_PORT: u16 = 3310;

/// Settings for one gateway connection
///
/// Only `host` is required; everything else has the defaults the gateway
/// firmware is known to tolerate. Durations are (de)serialized as
/// milliseconds.
///
/// # Example
///
/// ```
/// use intesisbox_wmp::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("192.168.1.50")
///     .with_request_timeout(Duration::from_secs(3))
///     .with_max_backoff(Duration::from_secs(30));
/// assert_eq!(config.port, 3310);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// AC unit index on the gateway
    pub unit: u8,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Deadline for each handshake and discovery reply
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Deadline for `set_value` / `get_value`
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
    #[serde(with = "millis")]
    pub ambient_poll_interval: Duration,
    #[serde(with = "millis")]
    pub status_poll_interval: Duration,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            unit: 1,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(45),
            ambient_poll_interval: Duration::from_secs(10),
            status_poll_interval: Duration::from_secs(300),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            event_capacity: 100,
        }
    }
}

impl ClientConfig {
    /// Configuration for a gateway at `host` on the default port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration, e.g. one stored by the host platform
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the TCP port (default 3310)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// AC unit index behind the gateway (default 1)
    pub fn with_unit(mut self, unit: u8) -> Self {
        self.unit = unit;
        self
    }

    /// Limit on establishing the TCP connection
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Limit on each reply during login and discovery
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Limit on each `set_value` / `get_value` call
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Interval between `PING`s
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Interval between `AMBTEMP` reads
    pub fn with_ambient_poll_interval(mut self, interval: Duration) -> Self {
        self.ambient_poll_interval = interval;
        self
    }

    /// Interval between full `GET,<unit>:*` polls
    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    /// First reconnect delay
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Cap on the reconnect delay
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Events buffered per subscriber before it lags
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// `host:port` as dialled
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject settings the session engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(WmpError::Config("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(WmpError::Config("port must be non-zero".to_string()));
        }
        let intervals = [
            ("connect_timeout", self.connect_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("request_timeout", self.request_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("ambient_poll_interval", self.ambient_poll_interval),
            ("status_poll_interval", self.status_poll_interval),
            ("initial_backoff", self.initial_backoff),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(WmpError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.max_backoff < self.initial_backoff {
            return Err(WmpError::Config(
                "max_backoff is shorter than initial_backoff".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(WmpError::Config("event_capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    ///
    /// Doubles from `initial_backoff` and saturates at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_in_defaults() {
        let config = ClientConfig::from_json(r#"{"host": "10.0.0.7", "request_timeout": 2500}"#)
            .unwrap();
        assert_eq!(config.host, "10.0.0.7");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.unit, 1);
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn json_without_host_is_rejected() {
        let err = ClientConfig::from_json(r#"{"port": 3310}"#).unwrap_err();
        assert!(matches!(err, WmpError::Config(_)), "got {err:?}");
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = ClientConfig::from_json("{host").unwrap_err();
        assert!(matches!(err, WmpError::Json(_)), "got {err:?}");
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let config = ClientConfig::new("h")
            .with_initial_backoff(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(60));
        let delays: Vec<u64> = (1..=8).map(|n| config.backoff_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(config.backoff_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = ClientConfig::new("h")
            .with_initial_backoff(Duration::from_secs(10))
            .with_max_backoff(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }
}
