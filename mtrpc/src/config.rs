use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// Upper bound for the server side of the TLS handshake.
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Default grace period used by the demo server on shutdown.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Deadline for unary calls.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Upper bound for TCP connect plus TLS handshake; unbounded if unset.
    #[serde_inline_default(Some(Duration::from_secs(5)))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    #[serde_inline_default(false)]
    pub use_msgpack: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.grace_period, Duration::from_secs(5));

        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(!config.use_msgpack);

        let config: ClientConfig = serde_json::from_str(
            r#"{ "timeout": "250ms", "connect_timeout": null, "use_msgpack": true }"#,
        )
        .unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, None);
        assert!(config.use_msgpack);
    }
}
