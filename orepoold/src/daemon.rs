use std::sync::Arc;

use async_trait::async_trait;
use orepool_core::Share;
use orepool_mining::{BlockTemplate, SyncState, WorkProvider, WorkProviderError};
use orepool_rpc::{DaemonClient, RpcError};
use serde_json::{Value, json};

use crate::config::CoinConfig;

/// Per-family daemon RPC method names.
#[derive(Debug, Clone, Copy)]
pub struct RpcMethods {
    pub get_template: &'static str,
    pub submit: &'static str,
    pub peer_count: &'static str,
    pub sync_state: &'static str,
}

impl CoinConfig {
    pub fn rpc_methods(&self) -> RpcMethods {
        match self {
            CoinConfig::MemoryHard { .. } => RpcMethods {
                get_template: "get-work",
                submit: "submit-work",
                peer_count: "get-peer-count",
                sync_state: "get-sync-state",
            },
            CoinConfig::Sha2Chain { .. } => RpcMethods {
                get_template: "get-block-template",
                submit: "submit-block",
                peer_count: "get-peer-count",
                sync_state: "get-sync-state",
            },
        }
    }

    /// Memory-hard daemons report sync progress; chain daemons answer the
    /// call but are never treated as blocking startup.
    pub fn reports_sync_progress(&self) -> bool {
        matches!(self, CoinConfig::MemoryHard { .. })
    }
}

/// `WorkProvider` over the JSON-RPC client: the one place daemon payloads
/// are interpreted.
pub struct DaemonWorkProvider {
    client: Arc<DaemonClient>,
    methods: RpcMethods,
    reports_sync: bool,
}

impl DaemonWorkProvider {
    pub fn new(client: Arc<DaemonClient>, coin: &CoinConfig) -> Self {
        Self { client, methods: coin.rpc_methods(), reports_sync: coin.reports_sync_progress() }
    }
}

fn map_rpc_error(e: RpcError) -> WorkProviderError {
    match e {
        RpcError::Unauthorized => WorkProviderError::Unauthorized,
        RpcError::Transport(msg) => WorkProviderError::Transient(msg),
        RpcError::AllEndpointsFailed => WorkProviderError::Transient("no endpoint answered".into()),
        RpcError::Daemon { code, message } => WorkProviderError::Protocol(format!("daemon error {}: {}", code, message)),
        RpcError::Protocol(msg) => WorkProviderError::Protocol(msg),
    }
}

pub(crate) fn parse_template(value: &Value) -> Result<BlockTemplate, WorkProviderError> {
    let field = |name: &str| value.get(name).ok_or_else(|| WorkProviderError::Protocol(format!("template missing {}", name)));

    let height = field("height")?.as_u64().ok_or_else(|| WorkProviderError::Protocol("height must be a number".into()))?;
    let prev_hash = field("prevHash")?
        .as_str()
        .ok_or_else(|| WorkProviderError::Protocol("prevHash must be a string".into()))?
        .to_string();
    let header_hex = field("header")?.as_str().ok_or_else(|| WorkProviderError::Protocol("header must be a string".into()))?;
    let header = hex::decode(header_hex.strip_prefix("0x").unwrap_or(header_hex))
        .map_err(|e| WorkProviderError::Protocol(format!("header is not hex: {}", e)))?;
    let network_difficulty = field("networkDifficulty")?
        .as_f64()
        .ok_or_else(|| WorkProviderError::Protocol("networkDifficulty must be a number".into()))?;
    let seed_hash = value.get("seedHash").and_then(Value::as_str).map(str::to_string);
    let coinbase = match value.get("coinbase").and_then(Value::as_str) {
        Some(coinbase_hex) => Some(
            hex::decode(coinbase_hex.strip_prefix("0x").unwrap_or(coinbase_hex))
                .map_err(|e| WorkProviderError::Protocol(format!("coinbase is not hex: {}", e)))?,
        ),
        None => None,
    };

    Ok(BlockTemplate { height, prev_hash, header, network_difficulty, seed_hash, coinbase })
}

#[async_trait]
impl WorkProvider for DaemonWorkProvider {
    async fn check_healthy(&self) -> Result<(), WorkProviderError> {
        // Every endpoint must answer the template call with a well-formed
        // response before the pool goes live.
        let results = self.client.execute_on_all(self.methods.get_template, json!([])).await;
        for result in results {
            let value = result.map_err(map_rpc_error)?;
            parse_template(&value)?;
        }
        Ok(())
    }

    async fn peer_count(&self) -> Result<u32, WorkProviderError> {
        let results = self.client.execute_on_all(self.methods.peer_count, json!([])).await;
        let mut best: Option<u32> = None;
        let mut last_err = None;
        for result in results {
            match result {
                Ok(value) => {
                    let peers = value.as_u64().unwrap_or(0) as u32;
                    best = Some(best.map_or(peers, |b| b.max(peers)));
                }
                Err(e) => last_err = Some(map_rpc_error(e)),
            }
        }
        match (best, last_err) {
            (Some(peers), _) => Ok(peers),
            (None, Some(e)) => Err(e),
            (None, None) => Err(WorkProviderError::Transient("no endpoints".into())),
        }
    }

    async fn sync_state(&self) -> Result<SyncState, WorkProviderError> {
        if !self.reports_sync {
            return Ok(SyncState::NotApplicable);
        }
        let value = self.client.execute_on_any(self.methods.sync_state, json!([])).await.map_err(map_rpc_error)?;
        let syncing = value.get("syncing").and_then(Value::as_bool).unwrap_or(false);
        if !syncing {
            return Ok(SyncState::Synced);
        }
        let progress_percent = value.get("progress").and_then(Value::as_f64);
        Ok(SyncState::Syncing { progress_percent })
    }

    async fn get_block_template(&self) -> Result<BlockTemplate, WorkProviderError> {
        let value = self.client.execute_on_any(self.methods.get_template, json!([])).await.map_err(map_rpc_error)?;
        parse_template(&value)
    }

    async fn submit_block(&self, share: &Share) -> Result<bool, WorkProviderError> {
        let params = json!([share.block_height, share.nonce, share.mix_hash, share.transaction_hash]);
        let value = self.client.execute_on_any(self.methods.submit, params).await.map_err(map_rpc_error)?;
        Ok(value.as_bool().unwrap_or(!value.is_null()))
    }
}
