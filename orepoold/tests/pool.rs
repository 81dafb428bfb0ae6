//! End-to-end pool tests: a real stratum server on a loopback socket, a
//! scripted daemon, and a scripted proof-of-work primitive.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use orepool_core::{AdminNotification, MessageBus, Share, SystemClock};
use orepool_mining::{
    BlockTemplate, ChainShareValidator, PowContext, PowError, SyncState, WorkProvider, WorkProviderError, target,
};
use orepool_stratum::{BanManager, BanningPolicy, TlsConfigCache};
use orepoold::config::PoolConfig;
use orepoold::pool::Pool;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

struct ScriptedProvider {
    submit_results: Mutex<Vec<bool>>,
    submitted: Mutex<Vec<Share>>,
}

impl ScriptedProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self { submit_results: Mutex::new(Vec::new()), submitted: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl WorkProvider for ScriptedProvider {
    async fn check_healthy(&self) -> Result<(), WorkProviderError> {
        Ok(())
    }

    async fn peer_count(&self) -> Result<u32, WorkProviderError> {
        Ok(1)
    }

    async fn sync_state(&self) -> Result<SyncState, WorkProviderError> {
        Ok(SyncState::Synced)
    }

    async fn get_block_template(&self) -> Result<BlockTemplate, WorkProviderError> {
        // Templates are injected by the tests; polling stays quiet.
        Err(WorkProviderError::Transient("no template scripted".into()))
    }

    async fn submit_block(&self, share: &Share) -> Result<bool, WorkProviderError> {
        self.submitted.lock().push(share.clone());
        Ok(self.submit_results.lock().pop().unwrap_or(true))
    }
}

/// Proof-of-work double: nonce -> preset hash value. Unknown nonces miss
/// every target.
struct ScriptedPow {
    hashes: Mutex<HashMap<u64, [u8; 32]>>,
}

impl ScriptedPow {
    fn new() -> Arc<Self> {
        Arc::new(Self { hashes: Mutex::new(HashMap::new()) })
    }

    fn script(&self, nonce: u64, difficulty: f64) {
        self.hashes.lock().insert(nonce, hash_at_difficulty(difficulty));
    }
}

impl PowContext for ScriptedPow {
    fn pow_hash(&self, _header: &[u8], nonce: u64) -> Result<[u8; 32], PowError> {
        Ok(self.hashes.lock().get(&nonce).copied().unwrap_or([0xff; 32]))
    }
}

fn hash_at_difficulty(difficulty: f64) -> [u8; 32] {
    let bytes = target::difficulty_to_target(difficulty).to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn template_at(height: u64, network_difficulty: f64) -> BlockTemplate {
    BlockTemplate {
        height,
        prev_hash: format!("{:064x}", height),
        header: vec![3u8; 16],
        network_difficulty,
        seed_hash: None,
        coinbase: None,
    }
}

struct Harness {
    pool: Arc<Pool>,
    bus: MessageBus,
    provider: Arc<ScriptedProvider>,
    pow: Arc<ScriptedPow>,
}

async fn start_pool(base_difficulty: f64) -> Harness {
    let config_json = json!({
        "id": "pool1",
        "coin": {"type": "sha2Chain"},
        "daemons": [{"url": "http://127.0.0.1:1"}],
        "stratums": [{"address": "127.0.0.1", "port": 0, "difficulty": base_difficulty}],
        "blockRefreshInterval": 10_000
    });
    let config: PoolConfig = serde_json::from_value(config_json).unwrap();

    let clock = Arc::new(SystemClock);
    let bus = MessageBus::new();
    let ban_manager = Arc::new(BanManager::new(clock.clone(), BanningPolicy::default()));
    let provider = ScriptedProvider::new();
    let pow = ScriptedPow::new();
    let validator = Arc::new(ChainShareValidator::new(pow.clone() as Arc<dyn PowContext>));

    let pool = Pool::assemble(
        config,
        "local".into(),
        bus.clone(),
        clock,
        ban_manager,
        Arc::new(TlsConfigCache::new()),
        provider.clone(),
        validator,
        None,
    );
    pool.start().await.unwrap();

    Harness { pool, bus, provider, pow }
}

struct Client {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Client {
    async fn connect(harness: &Harness) -> Client {
        let addr = harness.pool.stratum_server().local_addrs()[0];
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Client { lines: BufReader::new(read).lines(), write }
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.write.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = self.lines.next_line().await.unwrap().expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Subscribe + authorize; returns (extra_nonce1, current job id).
    async fn handshake(&mut self, worker: &str) -> (String, String) {
        self.send(json!({"id": 1, "method": "mining.subscribe", "params": ["test-miner/1.0"]})).await;
        let subscribed = self.recv().await;
        let extra_nonce1 = subscribed["result"][1].as_str().unwrap().to_string();

        let set_difficulty = self.recv().await;
        assert_eq!(set_difficulty["method"], "mining.set_difficulty");
        let notify = self.recv().await;
        assert_eq!(notify["method"], "mining.notify");
        let job_id = notify["params"][0].as_str().unwrap().to_string();

        self.send(json!({"id": 2, "method": "mining.authorize", "params": [worker, "x"]})).await;
        let authorized = self.recv().await;
        assert_eq!(authorized["result"], json!(true));

        (extra_nonce1, job_id)
    }
}

#[tokio::test]
async fn stale_share_is_rejected_without_a_record() {
    let harness = start_pool(1000.0).await;
    let manager = harness.pool.job_manager();
    manager.offer_template(template_at(100, 1e9)).unwrap();
    let stale_job = manager.job_store().current().unwrap().id.clone();
    manager.offer_template(template_at(101, 1e9)).unwrap();

    let mut shares = harness.bus.shares.subscribe();
    let mut client = Client::connect(&harness).await;
    let (_en1, current_job) = client.handshake("wallet0000000000000000000000000000.rig").await;
    assert_ne!(stale_job, current_job);

    harness.pow.script(0x1234, 2000.0);
    client.send(json!({"id": 3, "method": "mining.submit", "params": ["w", stale_job, "01", "0x1234"]})).await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(-1));
    assert_eq!(reply["error"]["message"], json!("stale share"));
    assert!(shares.try_recv().is_err());

    harness.pool.stop();
}

#[tokio::test]
async fn duplicate_submission_is_rejected_on_replay() {
    let harness = start_pool(1000.0).await;
    harness.pool.job_manager().offer_template(template_at(100, 1e9)).unwrap();

    let mut client = Client::connect(&harness).await;
    let (_en1, job_id) = client.handshake("wallet0000000000000000000000000000.rig").await;

    harness.pow.script(0x1234, 2000.0);
    let submit = json!({"id": 3, "method": "mining.submit", "params": ["w", job_id, "01", "0x1234"]});
    client.send(submit.clone()).await;
    assert_eq!(client.recv().await["result"], json!(true));

    client.send(submit).await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(-1));
    assert_eq!(reply["error"]["message"], json!("duplicate share"));

    harness.pool.stop();
}

#[tokio::test]
async fn low_difficulty_share_reports_actual_ratio() {
    let harness = start_pool(1000.0).await;
    harness.pool.job_manager().offer_template(template_at(100, 1e9)).unwrap();

    let mut shares = harness.bus.shares.subscribe();
    let mut client = Client::connect(&harness).await;
    let (_en1, job_id) = client.handshake("wallet0000000000000000000000000000.rig").await;

    harness.pow.script(0x1234, 500.0);
    client.send(json!({"id": 3, "method": "mining.submit", "params": ["w", job_id, "01", "0x1234"]})).await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(23));
    assert_eq!(reply["error"]["message"], json!("low difficulty share (500)"));
    assert!(shares.try_recv().is_err());

    harness.pool.stop();
}

#[tokio::test]
async fn block_candidate_accept_and_reject_paths() {
    let harness = start_pool(10.0).await;
    harness.pool.job_manager().offer_template(template_at(42, 100.0)).unwrap();

    let mut shares = harness.bus.shares.subscribe();
    let mut admin = harness.bus.admin.subscribe();
    let mut client = Client::connect(&harness).await;
    let (_en1, job_id) = client.handshake("wallet0000000000000000000000000000.rig").await;

    // Daemon accepts the first block, rejects the second.
    *harness.provider.submit_results.lock() = vec![false, true];

    harness.pow.script(0xa1, 200.0);
    client.send(json!({"id": 3, "method": "mining.submit", "params": ["w", job_id, "01", "0xa1"]})).await;
    assert_eq!(client.recv().await["result"], json!(true));

    let share = shares.recv().await.unwrap();
    assert!(share.is_block_candidate);
    assert!(share.actual_difficulty >= 200.0 * 0.99);
    assert_eq!(harness.provider.submitted.lock().len(), 1);
    match admin.recv().await.unwrap() {
        AdminNotification::BlockAccepted { pool_id, block_height, .. } => {
            assert_eq!(pool_id, "pool1");
            assert_eq!(block_height, 42);
        }
        other => panic!("expected block accepted, got {:?}", other),
    }

    harness.pow.script(0xa2, 300.0);
    client.send(json!({"id": 4, "method": "mining.submit", "params": ["w", job_id, "02", "0xa2"]})).await;
    assert_eq!(client.recv().await["result"], json!(true));

    let share = shares.recv().await.unwrap();
    // The share stays recorded and valid, but it is no block.
    assert!(!share.is_block_candidate);
    match admin.recv().await.unwrap() {
        AdminNotification::BlockSubmissionFailed { block_height, .. } => assert_eq!(block_height, 42),
        other => panic!("expected block submission failure, got {:?}", other),
    }

    harness.pool.stop();
}

#[tokio::test]
async fn submit_before_subscribe_and_authorize_is_refused() {
    let harness = start_pool(1000.0).await;
    harness.pool.job_manager().offer_template(template_at(100, 1e9)).unwrap();

    let mut client = Client::connect(&harness).await;
    client.send(json!({"id": 1, "method": "mining.submit", "params": ["w", "1", "01", "0x1"]})).await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(25));

    // Subscribed but not authorized.
    client.send(json!({"id": 2, "method": "mining.subscribe", "params": []})).await;
    let _subscribed = client.recv().await;
    let _difficulty = client.recv().await;
    let _notify = client.recv().await;
    client.send(json!({"id": 3, "method": "mining.submit", "params": ["w", "1", "01", "0x1"]})).await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(24));

    harness.pool.stop();
}

#[tokio::test]
async fn live_sessions_get_distinct_extra_nonces() {
    let harness = start_pool(1000.0).await;
    harness.pool.job_manager().offer_template(template_at(100, 1e9)).unwrap();

    let mut first = Client::connect(&harness).await;
    let mut second = Client::connect(&harness).await;
    let (en1_a, _) = first.handshake("wallet0000000000000000000000000000.rig1").await;
    let (en1_b, _) = second.handshake("wallet0000000000000000000000000000.rig2").await;

    assert_ne!(en1_a, en1_b);
    assert_eq!(en1_a.len(), 4);
    assert_eq!(en1_b.len(), 4);

    harness.pool.stop();
}

#[tokio::test]
async fn new_job_is_broadcast_to_subscribed_sessions() {
    let harness = start_pool(1000.0).await;
    harness.pool.job_manager().offer_template(template_at(100, 1e9)).unwrap();

    let mut client = Client::connect(&harness).await;
    let (_en1, first_job) = client.handshake("wallet0000000000000000000000000000.rig").await;

    harness.pool.job_manager().offer_template(template_at(101, 1e9)).unwrap();
    let notify = client.recv().await;
    assert_eq!(notify["method"], "mining.notify");
    let new_job = notify["params"][0].as_str().unwrap();
    assert_ne!(new_job, first_job);
    // Height advanced: workers must drop outstanding work.
    assert_eq!(notify["params"][5], json!(true));

    harness.pool.stop();
}

#[tokio::test]
async fn junk_line_is_answered_banned_and_refused() {
    let harness = start_pool(1000.0).await;
    harness.pool.job_manager().offer_template(template_at(100, 1e9)).unwrap();

    let mut client = Client::connect(&harness).await;
    client.write.write_all(b"not-json\n").await.unwrap();
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(-32700));
    assert_eq!(client.lines.next_line().await.unwrap(), None);

    // Banned: the next connection is closed before any byte is served.
    let addr = harness.pool.stratum_server().local_addrs()[0];
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, _write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    assert_eq!(lines.next_line().await.unwrap(), None);

    harness.pool.stop();
}
