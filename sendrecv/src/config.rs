use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use sendrecv_lib::{connection::RtcEngineConfig, endpoint::EndpointConfig};
use serde::Deserialize;
use tokio::fs::read_to_string;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub server: String,
    pub our_id: Option<String>,
    pub peer_id: Option<String>,
    pub connect_retries: u32,
    pub retry_interval_sec: u64,
    pub registration_attempts: u32,
    pub stun_servers: Vec<String>,
    pub ice_failed_timeout_sec: u64,
    /// Zero disables the statistics log.
    pub stats_interval_sec: u64,
    pub ping_interval_ms: u64,
    /// IVF (VP8) file replayed as the video test pattern
    pub test_pattern: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "ws://127.0.0.1:8443".to_owned(),
            our_id: None,
            peer_id: None,
            connect_retries: 5,
            retry_interval_sec: 3,
            registration_attempts: 3,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
            ice_failed_timeout_sec: 20 * 60,
            stats_interval_sec: 5,
            ping_interval_ms: 2000,
            test_pattern: None,
            log_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.ping_interval_ms == 0 {
            bail!("ping_interval_ms must be positive");
        }
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_sec)
    }

    pub fn engine_config(&self) -> RtcEngineConfig {
        RtcEngineConfig {
            stun_servers: self.stun_servers.clone(),
            ice_failed_timeout: Duration::from_secs(self.ice_failed_timeout_sec),
            stats_interval: Duration::from_secs(self.stats_interval_sec),
        }
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            our_id: self.our_id.clone(),
            peer_id: self.peer_id.clone(),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            registration_attempts: self.registration_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config = Config::parse(
            r#"
server = "ws://relay.example:8443"
peer_id = "1234"
stun_servers = []
"#,
        )
        .unwrap();
        assert_eq!(config.server, "ws://relay.example:8443");
        assert_eq!(config.peer_id.as_deref(), Some("1234"));
        assert!(config.stun_servers.is_empty());
        assert_eq!(config.connect_retries, 5);
        assert_eq!(
            config.endpoint_config().ping_interval,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_zero_ping_interval_is_rejected() {
        assert!(Config::parse("ping_interval_ms = 0").is_err());
        let config = Config::parse("stats_interval_sec = 0").unwrap();
        assert!(config.engine_config().stats_interval.is_zero());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Config::parse("connect_retries = \"many\"").is_err());
    }
}
