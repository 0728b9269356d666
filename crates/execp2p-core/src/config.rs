//! Application configuration with sensible defaults.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Inclusive port range the listener allocates from.
    pub min_port: u16,
    pub max_port: u16,
    /// Room capacity; the transport itself is 1-to-1.
    pub max_peers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_port: 9000,
            max_port: 9009,
            max_peers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base port for the BitTorrent DHT node; a random 0..10 offset is
    /// added per instance.
    pub bt_dht_port: u16,
    /// Rendezvous server URL; empty/absent disables signalling.
    pub signaling_server: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bt_dht_port: 6881,
            signaling_server: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_localhost_sweep_range() {
        let config = Config::default();
        assert_eq!(config.network.min_port, 9000);
        assert_eq!(config.network.max_port, 9009);
        assert!(config.discovery.signaling_server.is_none());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"network": {"max_port": 9500}}"#).unwrap();
        assert_eq!(config.network.min_port, 9000);
        assert_eq!(config.network.max_port, 9500);
        assert_eq!(config.discovery.bt_dht_port, 6881);
    }
}
