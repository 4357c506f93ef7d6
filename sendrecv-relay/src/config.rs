use std::{net::SocketAddr, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs::read_to_string;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8443)),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
        assert_eq!(
            Config::parse(r#"listen = "127.0.0.1:9000""#).unwrap().listen,
            "127.0.0.1:9000".parse().unwrap()
        );
        assert!(Config::parse(r#"listen = "nowhere""#).is_err());
    }
}
