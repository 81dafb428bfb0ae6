use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use orepool_rpc::DaemonEndpoint;
use orepool_stratum::{BanningPolicy, ListenerDescriptor, TlsListenerMaterial, VardiffOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Coin-family selection plus family-specific extension fields, discriminated
/// by `coin.type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoinConfig {
    /// Header-based, memory-hard proof of work with a per-epoch dataset.
    #[serde(rename_all = "camelCase")]
    MemoryHard {
        #[serde(default)]
        dag_epoch_length: Option<u64>,
    },
    /// SHA-family chain that builds the coinbase pool-side.
    #[serde(rename_all = "camelCase")]
    Sha2Chain {
        #[serde(default)]
        coinbase_signature: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// One stratum listening endpoint of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumEndpointConfig {
    #[serde(default = "default_listen_address")]
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    pub difficulty: f64,
    #[serde(default)]
    pub var_diff: Option<VardiffOptions>,
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

impl StratumEndpointConfig {
    pub fn listener_descriptor(&self) -> ListenerDescriptor {
        ListenerDescriptor {
            bind: SocketAddr::new(self.address, self.port),
            base_difficulty: self.difficulty,
            tls: self.tls.as_ref().map(|tls| TlsListenerMaterial { cert_path: tls.cert_path.clone(), key_path: tls.key_path.clone() }),
            vardiff: self.var_diff.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardRecipientConfig {
    pub address: String,
    pub percentage: f64,
}

/// A remote relay to subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalStratumConfig {
    pub url: String,
    pub topics: Vec<String>,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub coin: CoinConfig,
    pub daemons: Vec<DaemonEndpoint>,
    #[serde(default)]
    pub stratums: Vec<StratumEndpointConfig>,
    /// Template poll cadence, milliseconds.
    #[serde(default = "default_block_refresh_ms")]
    pub block_refresh_interval: u64,
    #[serde(default = "default_true")]
    pub enable_internal_stratum: bool,
    #[serde(default)]
    pub external_stratums: Vec<ExternalStratumConfig>,
    #[serde(default)]
    pub reward_recipients: Vec<RewardRecipientConfig>,
    /// Extra-nonce prefix width handed to workers.
    #[serde(default = "default_extranonce_size")]
    pub extranonce_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_block_refresh_ms() -> u64 {
    500
}

fn default_extranonce_size() -> usize {
    2
}

impl PoolConfig {
    pub fn block_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.block_refresh_interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRelayConfig {
    pub publish_url: String,
    #[serde(default)]
    pub binary_format: bool,
}

/// The whole process configuration: one JSON document, deserialized once at
/// startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub cluster_name: String,
    #[serde(default)]
    pub banning: BanningPolicy,
    #[serde(default)]
    pub share_relay: Option<ShareRelayConfig>,
    pub pools: Vec<PoolConfig>,
    /// Optional log file; stdout only when absent.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl ClusterConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::Invalid("clusterName must not be empty".into()));
        }
        if self.pools.is_empty() {
            return Err(ConfigError::Invalid("at least one pool must be configured".into()));
        }

        let mut pool_ids = HashSet::new();
        let mut ports = HashSet::new();
        for pool in &self.pools {
            if !pool_ids.insert(&pool.id) {
                return Err(ConfigError::Invalid(format!("duplicate pool id: {}", pool.id)));
            }
            if pool.daemons.is_empty() {
                return Err(ConfigError::Invalid(format!("pool {} has no daemons", pool.id)));
            }
            if pool.enable_internal_stratum && pool.stratums.is_empty() {
                return Err(ConfigError::Invalid(format!("pool {} has no stratum endpoints", pool.id)));
            }
            for stratum in &pool.stratums {
                if !ports.insert((stratum.address, stratum.port)) {
                    return Err(ConfigError::Invalid(format!("duplicate stratum port: {}", stratum.port)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_pool(id: &str, port: u16) -> String {
        format!(
            r#"{{
                "id": "{id}",
                "coin": {{"type": "memoryHard"}},
                "daemons": [{{"url": "http://127.0.0.1:8545"}}],
                "stratums": [{{"port": {port}, "difficulty": 16.0}}]
            }}"#
        )
    }

    #[test]
    fn parses_minimal_cluster() {
        let json = format!(
            r#"{{"clusterName": "eu1", "pools": [{}]}}"#,
            minimal_pool("eth1", 4444)
        );
        let config = ClusterConfig::from_json(&json).unwrap();
        assert_eq!(config.cluster_name, "eu1");
        assert_eq!(config.pools.len(), 1);
        assert!(config.pools[0].enabled);
        assert!(config.banning.ban_on_junk_receive);
        assert_eq!(config.pools[0].block_refresh_interval(), Duration::from_millis(500));
        assert!(matches!(config.pools[0].coin, CoinConfig::MemoryHard { .. }));
    }

    #[test]
    fn coin_type_discriminates_family_extensions() {
        let json = r#"{
            "clusterName": "eu1",
            "pools": [{
                "id": "btc1",
                "coin": {"type": "sha2Chain", "coinbaseSignature": "/orepool/"},
                "daemons": [{"url": "http://127.0.0.1:8332", "username": "u", "password": "p"}],
                "stratums": [{"port": 3333, "difficulty": 1024.0}]
            }]
        }"#;
        let config = ClusterConfig::from_json(json).unwrap();
        match &config.pools[0].coin {
            CoinConfig::Sha2Chain { coinbase_signature } => {
                assert_eq!(coinbase_signature.as_deref(), Some("/orepool/"));
            }
            other => panic!("wrong family: {:?}", other),
        }
    }

    #[test]
    fn vardiff_and_tls_sections_parse() {
        let json = r#"{
            "clusterName": "eu1",
            "banning": {"banOnJunkReceive": false, "banDurationSecs": 600},
            "shareRelay": {"publishUrl": "tcp://0.0.0.0:6000", "binaryFormat": true},
            "pools": [{
                "id": "eth1",
                "coin": {"type": "memoryHard"},
                "daemons": [{"url": "http://127.0.0.1:8545", "wsUrl": "ws://127.0.0.1:8546"}],
                "stratums": [{
                    "address": "127.0.0.1",
                    "port": 4444,
                    "difficulty": 16.0,
                    "tls": {"certPath": "/etc/orepool/cert.pem", "keyPath": "/etc/orepool/key.pem"},
                    "varDiff": {"minDiff": 1.0, "maxDiff": 4096.0, "targetTimeSecs": 15.0, "retargetTimeSecs": 90.0, "variancePercent": 30.0}
                }],
                "externalStratums": [{"url": "tcp://relay.remote:6000", "topics": ["eth1"], "clusterName": "us1"}]
            }]
        }"#;
        let config = ClusterConfig::from_json(json).unwrap();
        assert!(!config.banning.ban_on_junk_receive);
        assert_eq!(config.banning.ban_duration_secs, 600);
        assert!(config.share_relay.as_ref().unwrap().binary_format);

        let pool = &config.pools[0];
        assert_eq!(pool.daemons[0].ws_url.as_deref(), Some("ws://127.0.0.1:8546"));
        let listener = pool.stratums[0].listener_descriptor();
        assert_eq!(listener.bind, "127.0.0.1:4444".parse().unwrap());
        assert!(listener.tls.is_some());
        assert_eq!(listener.vardiff.as_ref().unwrap().max_diff, Some(4096.0));
        assert_eq!(pool.external_stratums[0].cluster_name, "us1");
    }

    #[test]
    fn duplicate_pool_ids_are_rejected() {
        let json = format!(
            r#"{{"clusterName": "eu1", "pools": [{}, {}]}}"#,
            minimal_pool("eth1", 4444),
            minimal_pool("eth1", 4445)
        );
        assert!(matches!(ClusterConfig::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn duplicate_stratum_ports_are_rejected() {
        let json = format!(
            r#"{{"clusterName": "eu1", "pools": [{}, {}]}}"#,
            minimal_pool("eth1", 4444),
            minimal_pool("eth2", 4444)
        );
        assert!(matches!(ClusterConfig::from_json(&json), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn pool_without_daemons_is_rejected() {
        let json = r#"{
            "clusterName": "eu1",
            "pools": [{
                "id": "eth1",
                "coin": {"type": "memoryHard"},
                "daemons": [],
                "stratums": [{"port": 4444, "difficulty": 16.0}]
            }]
        }"#;
        assert!(matches!(ClusterConfig::from_json(json), Err(ConfigError::Invalid(_))));
    }
}
