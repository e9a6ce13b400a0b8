use async_trait::async_trait;
use bounty_core::{BountyError, Commitment, InclusionProof, LedgerClient, SubmitStatus, Token};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    status: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResult {
    valid: bool,
}

/// Ledger gateway client speaking JSON-RPC 2.0 over HTTP.
#[derive(Debug)]
pub struct JsonRpcLedgerClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcLedgerClient {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, BountyError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BountyError::Ledger(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, BountyError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BountyError::Ledger(format!("{method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BountyError::Ledger(format!("{method}: http {status}: {body}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| BountyError::Ledger(format!("{method}: malformed response: {e}")))?;
        if let Some(error) = body.error {
            return Err(BountyError::Ledger(format!(
                "{method}: rpc error {}: {}",
                error.code, error.message
            )));
        }
        match body.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| BountyError::Ledger(format!("{method}: unexpected result: {e}"))),
        }
    }

    async fn submit(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError> {
        let result: Option<SubmitResult> = self
            .call("submit_commitment", json!({ "commitment": commitment }))
            .await?;
        let status = result
            .map(|r| SubmitStatus::from_code(&r.status))
            .ok_or_else(|| BountyError::Ledger("submit_commitment: empty result".to_string()))?;
        debug!(request_id = %commitment.request_id, ?status, "commitment submitted");
        Ok(status)
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn submit_transfer(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError> {
        self.submit(commitment).await
    }

    async fn submit_mint(&self, commitment: &Commitment) -> Result<SubmitStatus, BountyError> {
        self.submit(commitment).await
    }

    async fn wait_inclusion_proof(
        &self,
        commitment: &Commitment,
        timeout: Duration,
    ) -> Result<InclusionProof, BountyError> {
        let deadline = Instant::now() + timeout;
        loop {
            let proof: Option<InclusionProof> = self
                .call(
                    "get_inclusion_proof",
                    json!({ "request_id": commitment.request_id }),
                )
                .await?;
            if let Some(proof) = proof {
                return Ok(proof);
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(BountyError::LedgerTimeout(format!(
                    "request '{}' not included within {}s",
                    commitment.request_id,
                    timeout.as_secs()
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn verify(&self, token: &Token) -> Result<bool, BountyError> {
        let result: Option<VerifyResult> = self.call("verify_token", json!({ "token": token })).await?;
        Ok(result.map(|r| r.valid).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_as_jsonrpc_two() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "verify_token",
            params: json!({ "token": "t" }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "verify_token");
    }

    #[test]
    fn endpoint_drops_trailing_slash() {
        let client = JsonRpcLedgerClient::new("http://127.0.0.1:9/rpc/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:9/rpc");
    }

    #[tokio::test]
    async fn unreachable_gateway_is_a_ledger_error() {
        let client = JsonRpcLedgerClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let token = Token::new("tok", "DIRECT://a", "x", 1u64.into());
        let err = client.verify(&token).await.unwrap_err();
        assert_eq!(err.kind(), "ledger");
    }
}
