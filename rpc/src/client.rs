use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One daemon endpoint from a pool's `daemons[]` list, in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonEndpoint {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Websocket URL for daemons that push template updates.
    #[serde(default)]
    pub ws_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonClientOptions {
    pub request_timeout: Duration,
}

impl Default for DaemonClientOptions {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("daemon rejected credentials")]
    Unauthorized,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("daemon error {code}: {message}")]
    Daemon { code: i64, message: String },
    #[error("malformed daemon response: {0}")]
    Protocol(String),
    #[error("no endpoint answered")]
    AllEndpointsFailed,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    #[allow(dead_code)]
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorEnvelope>,
}

/// JSON-RPC 2.0 client over HTTP(S) across an ordered endpoint set. Every
/// call carries a typed result; transport failures feed per-endpoint health
/// accounting so "execute on any" prefers endpoints that have been answering.
pub struct DaemonClient {
    http: reqwest::Client,
    endpoints: Vec<DaemonEndpoint>,
    consecutive_failures: Vec<AtomicU32>,
    id_counter: AtomicU64,
}

impl DaemonClient {
    pub fn new(endpoints: Vec<DaemonEndpoint>, options: DaemonClientOptions) -> Result<Self, RpcError> {
        if endpoints.is_empty() {
            return Err(RpcError::Protocol("no daemon endpoints configured".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let consecutive_failures = endpoints.iter().map(|_| AtomicU32::new(0)).collect();
        Ok(Self { http, endpoints, consecutive_failures, id_counter: AtomicU64::new(0) })
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn endpoints(&self) -> &[DaemonEndpoint] {
        &self.endpoints
    }

    fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Endpoint indices ordered by health: fewest consecutive failures
    /// first, configuration order as the tie-breaker.
    fn healthy_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.endpoints.len()).collect();
        order.sort_by_key(|&i| self.consecutive_failures[i].load(Ordering::Relaxed));
        order
    }

    /// Execute one call against a specific endpoint.
    pub async fn execute_on(&self, index: usize, method: &str, params: Value) -> Result<Value, RpcError> {
        let envelope = RequestEnvelope { jsonrpc: "2.0", id: self.next_id(), method, params: &params };
        let envelope = serde_json::to_value(&envelope).map_err(|e| RpcError::Protocol(e.to_string()))?;
        let body = self.post(index, &envelope).await?;
        let response: ResponseEnvelope =
            serde_json::from_value(body).map_err(|e| RpcError::Protocol(e.to_string()))?;
        unwrap_response(response)
    }

    /// Execute against the healthiest endpoint, falling through the rest on
    /// transport failure. Daemon-level errors are not retried: the daemon
    /// answered, the answer just was an error.
    pub async fn execute_on_any(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut last_err = RpcError::AllEndpointsFailed;
        for index in self.healthy_order() {
            match self.execute_on(index, method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(RpcError::Transport(e)) => {
                    tracing::debug!("endpoint {} failed: {}", self.endpoints[index].url, e);
                    last_err = RpcError::Transport(e);
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err)
    }

    /// Execute against every endpoint, returning each endpoint's result.
    pub async fn execute_on_all(&self, method: &str, params: Value) -> Vec<Result<Value, RpcError>> {
        let calls = (0..self.endpoints.len()).map(|index| self.execute_on(index, method, params.clone()));
        futures_util::future::join_all(calls).await
    }

    /// JSON-RPC batch against one endpoint; results come back in call order.
    pub async fn execute_batch(&self, index: usize, calls: &[(&str, Value)]) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let envelopes: Vec<Value> = calls
            .iter()
            .map(|(method, params)| {
                serde_json::to_value(RequestEnvelope { jsonrpc: "2.0", id: self.next_id(), method, params })
                    .map_err(|e| RpcError::Protocol(e.to_string()))
            })
            .collect::<Result<_, _>>()?;
        let body = self.post(index, &Value::Array(envelopes)).await?;
        let responses: Vec<ResponseEnvelope> =
            serde_json::from_value(body).map_err(|e| RpcError::Protocol(e.to_string()))?;
        if responses.len() != calls.len() {
            return Err(RpcError::Protocol(format!("batch answered {} of {} calls", responses.len(), calls.len())));
        }
        Ok(responses.into_iter().map(unwrap_response).collect())
    }

    async fn post(&self, index: usize, body: &Value) -> Result<Value, RpcError> {
        let endpoint = &self.endpoints[index];
        let mut request = self.http.post(&endpoint.url).json(body);
        if let Some(username) = &endpoint.username {
            request = request.basic_auth(username, endpoint.password.as_deref());
        }

        let result = async {
            let response = request.send().await.map_err(|e| RpcError::Transport(e.to_string()))?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED || response.status() == reqwest::StatusCode::FORBIDDEN {
                return Err(RpcError::Unauthorized);
            }
            if !response.status().is_success() {
                return Err(RpcError::Transport(format!("http status {}", response.status())));
            }
            response.json::<Value>().await.map_err(|e| RpcError::Protocol(e.to_string()))
        }
        .await;

        match &result {
            Ok(_) => self.consecutive_failures[index].store(0, Ordering::Relaxed),
            Err(RpcError::Transport(_)) => {
                self.consecutive_failures[index].fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        result
    }
}

fn unwrap_response(response: ResponseEnvelope) -> Result<Value, RpcError> {
    match (response.result, response.error) {
        (_, Some(error)) => Err(RpcError::Daemon { code: error.code, message: error.message }),
        (Some(result), None) => Ok(result),
        (None, None) => Err(RpcError::Protocol("response carries neither result nor error".into())),
    }
}
