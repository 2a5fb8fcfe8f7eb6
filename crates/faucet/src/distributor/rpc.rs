//! JSON-RPC client for the ledger node

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    /// The request never reached the node.
    #[error("Could not reach node: {0}")]
    Connect(String),

    /// The request may have reached the node but no answer came back.
    #[error("No response from node: {0}")]
    NoResponse(String),

    #[error("Node returned error: {0}")]
    Node(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// RPC client for interacting with the ledger
pub struct BlockchainRpcClient {
    rpc_url: String,
    client: reqwest::Client,
}

impl BlockchainRpcClient {
    pub fn new(rpc_url: String, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Connect(format!("Client setup failed: {}", e)))?;

        Ok(Self { rpc_url, client })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_builder() {
                    RpcError::Connect(e.to_string())
                } else {
                    RpcError::NoResponse(e.to_string())
                }
            })?;

        let json: Value = response
            .json()
            .await
            .map_err(|e| RpcError::InvalidResponse(e.to_string()))?;

        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(RpcError::Node(message));
        }

        json.get("result")
            .cloned()
            .ok_or_else(|| RpcError::InvalidResponse(format!("{} returned no result", method)))
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_chainId", serde_json::json!([])).await?;
        parse_quantity(&result).map(|v| v as u64)
    }

    pub async fn gas_price(&self) -> Result<u128, RpcError> {
        let result = self.call("eth_gasPrice", serde_json::json!([])).await?;
        parse_quantity(&result)
    }

    /// Next nonce including transactions still in the pool.
    pub async fn pending_nonce(&self, address: &[u8; 20]) -> Result<u64, RpcError> {
        let result = self
            .call(
                "eth_getTransactionCount",
                serde_json::json!([format!("0x{}", hex::encode(address)), "pending"]),
            )
            .await?;
        parse_quantity(&result).map(|v| v as u64)
    }

    /// Read-only contract call against the latest block.
    pub async fn eth_call(&self, to: &[u8; 20], data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let result = self
            .call(
                "eth_call",
                serde_json::json!([
                    {
                        "to": format!("0x{}", hex::encode(to)),
                        "data": format!("0x{}", hex::encode(data)),
                    },
                    "latest"
                ]),
            )
            .await?;

        let hex_str = result
            .as_str()
            .ok_or_else(|| RpcError::InvalidResponse(format!("eth_call returned {}", result)))?;
        hex::decode(hex_str.trim_start_matches("0x"))
            .map_err(|e| RpcError::InvalidResponse(format!("eth_call returned bad hex: {}", e)))
    }

    pub async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, RpcError> {
        let result = self
            .call(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;

        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::InvalidResponse(format!("eth_sendRawTransaction returned {}", result)))
    }
}

/// Parse a hex quantity such as `"0x1a"`.
pub fn parse_quantity(value: &Value) -> Result<u128, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse(format!("Expected hex quantity, got {}", value)))?;
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| RpcError::InvalidResponse(format!("Bad quantity {}: {}", s, e)))
}
