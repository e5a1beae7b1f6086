use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
}

/// Acknowledgment, retry and keep-alive policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a PULL_RESP may stay unacknowledged before it is retried
    pub ack_timeout_ms: u64,
    /// Retransmissions before a downlink is reported as failed
    pub max_retries: u32,
    /// A gateway silent for this long is dropped
    pub inactivity_timeout_secs: u64,
    /// Period of the retry/eviction sweep
    pub sweep_interval_ms: u64,
}

impl SessionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2000,
            max_retries: 1,
            inactivity_timeout_secs: 60,
            sweep_interval_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig {
                bind: "0.0.0.0:1700".to_string(),
            },
            session: SessionConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [udp]
            bind = "127.0.0.1:1700"

            [session]
            ack_timeout_ms = 500
            max_retries = 2
            inactivity_timeout_secs = 30
            sweep_interval_ms = 100

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.udp.bind, "127.0.0.1:1700");
        assert_eq!(config.session.ack_timeout(), Duration::from_millis(500));
        assert_eq!(config.session.max_retries, 2);
        assert_eq!(config.session.inactivity_timeout(), Duration::from_secs(30));
        assert_eq!(config.session.sweep_interval(), Duration::from_millis(100));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_session_section_defaults() {
        let config = Config::parse(
            r#"
            [udp]
            bind = "0.0.0.0:1700"

            [session]
            max_retries = 0

            [logging]
            level = "info"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.max_retries, 0);
        assert_eq!(config.session.ack_timeout_ms, 2000);
        assert_eq!(config.session.inactivity_timeout_secs, 60);
    }

    #[test]
    fn test_missing_udp_section_fails() {
        assert!(Config::parse("[logging]\nlevel = \"info\"\n").is_err());
    }
}
