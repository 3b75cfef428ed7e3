use std::time::Duration;

use serde::Deserialize;

use crate::wire::{MAX_MESSAGE_SIZE, MDNS_PORT};

/// Tunables for one engine instance. Every field has a protocol-recommended
/// default so an empty `[engine]` table is valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default = "default_true")]
    pub ipv6: bool,
    /// Interface names to use; empty means every usable interface.
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,
    /// Re-sends after the first transmission of a one-shot query.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
    /// Known answers expiring within this window are not listed.
    #[serde(default = "default_known_answer_window")]
    pub known_answer_window_ms: u64,
    /// Points in a cached record's lifetime at which it is re-queried.
    #[serde(default = "default_refresh_percent")]
    pub refresh_percent: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_announce_count")]
    pub announce_count: u32,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtlConfig {
    /// A/AAAA/SRV records, which name a host.
    #[serde(default = "default_host_ttl")]
    pub host_secs: u32,
    /// PTR/TXT records.
    #[serde(default = "default_service_ttl")]
    pub service_secs: u32,
    #[serde(default = "default_legacy_unicast_ttl")]
    pub legacy_unicast_secs: u32,
}

fn default_port() -> u16 {
    MDNS_PORT
}

fn default_true() -> bool {
    true
}

fn default_max_packet_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_initial_interval() -> u64 {
    1000
}

fn default_max_interval() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_jitter() -> u64 {
    120
}

fn default_known_answer_window() -> u64 {
    1000
}

fn default_refresh_percent() -> Vec<u8> {
    vec![80, 85, 90, 95]
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_interval() -> u64 {
    250
}

fn default_announce_count() -> u32 {
    2
}

fn default_announce_interval() -> u64 {
    1000
}

fn default_host_ttl() -> u32 {
    120
}

fn default_service_ttl() -> u32 {
    4500
}

fn default_legacy_unicast_ttl() -> u32 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ipv4: true,
            ipv6: true,
            interfaces: Vec::new(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            max_retries: default_max_retries(),
            jitter_ms: default_jitter(),
            known_answer_window_ms: default_known_answer_window(),
            refresh_percent: default_refresh_percent(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_count: default_probe_count(),
            probe_interval_ms: default_probe_interval(),
            announce_count: default_announce_count(),
            announce_interval_ms: default_announce_interval(),
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            host_secs: default_host_ttl(),
            service_secs: default_service_ttl(),
            legacy_unicast_secs: default_legacy_unicast_ttl(),
        }
    }
}

impl QueryConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.initial_interval_ms))
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn known_answer_window(&self) -> Duration {
        Duration::from_millis(self.known_answer_window_ms)
    }
}

impl ProbeConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.transport.port, 5353);
        assert_eq!(config.query.initial_interval(), Duration::from_secs(1));
        assert_eq!(config.query.refresh_percent, vec![80, 85, 90, 95]);
        assert_eq!(config.probe.probe_count, 3);
        assert_eq!(config.ttl.legacy_unicast_secs, 10);
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [transport]
            port = 5454
            ipv6 = false
            interfaces = ["eth0"]

            [query]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.port, 5454);
        assert!(config.transport.ipv4);
        assert!(!config.transport.ipv6);
        assert_eq!(config.transport.interfaces, vec!["eth0".to_string()]);
        assert_eq!(config.query.max_retries, 5);
        assert_eq!(config.query.jitter_ms, 120);
        assert_eq!(config.probe.probe_interval_ms, 250);
    }

    #[test]
    fn test_max_interval_not_below_initial() {
        let config = QueryConfig {
            initial_interval_ms: 5000,
            max_interval_ms: 100,
            ..QueryConfig::default()
        };
        assert_eq!(config.max_interval(), Duration::from_secs(5));
    }
}
