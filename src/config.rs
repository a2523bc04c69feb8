//! Server configuration consumed once at worker startup.

use std::time::Duration;

/// Default interval between heartbeat events, in seconds.
pub const DEFAULT_HEARTBEAT_SECS: f64 = 1.0;

/// Settings the supervisor hands to the worker.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Raw heartbeat interval setting, a float number of seconds. `None`
    /// keeps the default; an unparseable value is warned about and ignored.
    pub heartbeat_secs: Option<String>,
}

impl ServerConfig {
    /// Read configuration from the environment (`KILN_HEARTBEAT_SECS`).
    pub fn from_env() -> Self {
        Self {
            heartbeat_secs: std::env::var("KILN_HEARTBEAT_SECS").ok(),
        }
    }

    /// Resolve the heartbeat interval, falling back to the default when the
    /// setting is absent or invalid.
    pub fn heartbeat_interval(&self) -> Duration {
        let secs = match self.heartbeat_secs.as_deref() {
            None => DEFAULT_HEARTBEAT_SECS,
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(value) if value > 0.0 && value.is_finite() => value,
                _ => {
                    log::warn!(
                        "Ignoring invalid heartbeat interval {raw:?}, must be a float specifying seconds"
                    );
                    DEFAULT_HEARTBEAT_SECS
                }
            },
        };
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_heartbeat_interval() {
        let config = ServerConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_heartbeat_interval_override() {
        let config = ServerConfig {
            heartbeat_secs: Some("0.25".into()),
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_heartbeat_interval_keeps_default() {
        for raw in ["banana", "", "-3", "0", "NaN"] {
            let config = ServerConfig {
                heartbeat_secs: Some(raw.into()),
            };
            assert_eq!(
                config.heartbeat_interval(),
                Duration::from_secs(1),
                "raw setting {raw:?} should fall back to the default"
            );
        }
    }
}
