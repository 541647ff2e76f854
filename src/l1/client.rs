//! JSON-RPC client for the L1 chain: raw and conditional submission,
//! receipt polling, and block reads.

use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{EngineError, RpcCallError, TransportError};

/// Default per-request deadline for L1 calls.
pub const L1_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A plain JSON-RPC 2.0 client over HTTP. Unauthenticated; the engine
/// client layers bearer tokens on top of the same wire shape.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    url: String,
    client: reqwest::Client,
}

impl JsonRpcClient {
    /// Creates a client with the given per-request deadline.
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .build()
            .expect("http client construction cannot fail");
        Self {
            url: url.to_string(),
            client,
        }
    }

    /// Sends one request and returns the `result` value. A JSON-RPC error
    /// object becomes [`EngineError`]; connection problems become
    /// [`TransportError`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcCallError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        tracing::trace!(method, url = %self.url, "sending rpc request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()).into());
        }

        let mut payload: Value = response
            .json()
            .await
            .map_err(|_| TransportError::EmptyResponse)?;

        if let Some(error) = payload.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            tracing::warn!(method, code, %message, "rpc peer returned an error object");
            return Err(EngineError { code, message }.into());
        }

        match payload.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(TransportError::EmptyResponse.into()),
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> RpcCallError {
    if err.is_timeout() {
        TransportError::Timeout.into()
    } else {
        TransportError::ConnectionRefused.into()
    }
}

/// An L1 transaction as read back from `eth_getBlockByNumber`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1Transaction {
    /// The transaction hash
    pub hash: B256,
    /// The recipient, if any
    pub to: Option<Address>,
    /// The calldata
    pub input: Bytes,
}

/// An L1 block, optionally with full transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1Block {
    /// The block hash
    pub hash: B256,
    /// Hash of the parent block
    pub parent_hash: B256,
    /// The block number
    #[serde(with = "crate::codec::hexnum")]
    pub number: u64,
    /// The block timestamp
    #[serde(with = "crate::codec::hexnum")]
    pub timestamp: u64,
    /// Full transactions when requested, empty otherwise
    #[serde(default)]
    pub transactions: Vec<L1Transaction>,
}

/// The inclusion receipt of a submitted L1 transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1Receipt {
    /// The transaction hash
    pub transaction_hash: B256,
    /// Hash of the including block
    pub block_hash: B256,
    /// Number of the including block
    #[serde(with = "crate::codec::hexnum")]
    pub block_number: u64,
    /// Execution status
    #[serde(with = "crate::codec::hexnum")]
    pub status: u64,
}

/// The L1 operations the sequencer core needs. Implemented over HTTP by
/// [`L1Client`] and in-memory by the mock used in tests.
#[async_trait]
pub trait L1Api: Send + Sync + 'static {
    /// `eth_sendRawTransaction`
    async fn submit_raw(&self, raw: &[u8]) -> Result<B256, RpcCallError>;

    /// `eth_sendRawTransactionConditional` with an inclusive ceiling on the
    /// inclusion block number.
    async fn submit_conditional(
        &self,
        raw: &[u8],
        block_number_max: u64,
    ) -> Result<B256, RpcCallError>;

    /// `eth_getTransactionReceipt`; `None` until the transaction is mined.
    async fn tx_receipt(&self, hash: B256) -> Result<Option<L1Receipt>, RpcCallError>;

    /// `eth_blockNumber`
    async fn latest_block(&self) -> Result<u64, RpcCallError>;

    /// `eth_getBlockByNumber`
    async fn get_block(&self, number: u64, with_txs: bool)
        -> Result<Option<L1Block>, RpcCallError>;

    /// `eth_getTransactionCount` at latest
    async fn transaction_count(&self, address: Address) -> Result<u64, RpcCallError>;
}

/// The HTTP L1 client.
#[derive(Debug, Clone)]
pub struct L1Client {
    rpc: JsonRpcClient,
}

impl L1Client {
    /// Creates a client for the given endpoint.
    pub fn new(url: &str) -> Self {
        Self {
            rpc: JsonRpcClient::new(url, L1_REQUEST_TIMEOUT),
        }
    }
}

#[async_trait]
impl L1Api for L1Client {
    async fn submit_raw(&self, raw: &[u8]) -> Result<B256, RpcCallError> {
        let result = self
            .rpc
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        parse_b256(&result)
    }

    async fn submit_conditional(
        &self,
        raw: &[u8],
        block_number_max: u64,
    ) -> Result<B256, RpcCallError> {
        let result = self
            .rpc
            .call(
                "eth_sendRawTransactionConditional",
                json!([
                    format!("0x{}", hex::encode(raw)),
                    { "blockNumberMax": format!("{block_number_max:#x}") }
                ]),
            )
            .await?;
        parse_b256(&result)
    }

    async fn tx_receipt(&self, hash: B256) -> Result<Option<L1Receipt>, RpcCallError> {
        let result = self
            .rpc
            .call("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|_| TransportError::EmptyResponse.into())
    }

    async fn latest_block(&self) -> Result<u64, RpcCallError> {
        let result = self.rpc.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    async fn get_block(
        &self,
        number: u64,
        with_txs: bool,
    ) -> Result<Option<L1Block>, RpcCallError> {
        let result = self
            .rpc
            .call(
                "eth_getBlockByNumber",
                json!([format!("{number:#x}"), with_txs]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|_| TransportError::EmptyResponse.into())
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcCallError> {
        let result = self
            .rpc
            .call("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        parse_quantity(&result)
    }
}

fn parse_b256(value: &Value) -> Result<B256, RpcCallError> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::EmptyResponse.into())
}

fn parse_quantity(value: &Value) -> Result<u64, RpcCallError> {
    value
        .as_str()
        .and_then(|s| {
            let digits = s.strip_prefix("0x").unwrap_or(s);
            u64::from_str_radix(digits, 16).ok()
        })
        .ok_or_else(|| TransportError::EmptyResponse.into())
}

/// Polls until the transaction has the requested confirmation count or the
/// timeout elapses. A missing receipt means not-yet-included, never failure.
pub async fn wait_for_inclusion<L: L1Api>(
    l1: &L,
    hash: B256,
    confirmations: u64,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<L1Receipt, RpcCallError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(receipt) = l1.tx_receipt(hash).await? {
            let latest = l1.latest_block().await?;
            if latest.saturating_sub(receipt.block_number) + 1 >= confirmations {
                return Ok(receipt);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TransportError::Timeout.into());
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l1::mock::MockL1;

    #[tokio::test]
    async fn wait_for_inclusion_sees_confirmations() {
        let l1 = MockL1::new();
        let hash = l1.submit_raw(&[0xaa]).await.unwrap();
        // the mock mines the submission into the next block immediately
        let receipt = wait_for_inclusion(
            &l1,
            hash,
            1,
            Duration::from_millis(1),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(receipt.transaction_hash, hash);
    }

    #[tokio::test]
    async fn wait_for_inclusion_times_out_without_receipt() {
        let l1 = MockL1::new();
        let err = wait_for_inclusion(
            &l1,
            B256::repeat_byte(0x01),
            1,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err, RpcCallError::Transport(TransportError::Timeout));
    }

    #[test]
    fn l1_block_deserializes_hex_quantities() {
        let json = serde_json::json!({
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "number": "0x1b4",
            "timestamp": "0x64",
            "transactions": [],
        });
        let block: L1Block = serde_json::from_value(json).unwrap();
        assert_eq!(block.number, 436);
        assert_eq!(block.timestamp, 100);
    }
}
