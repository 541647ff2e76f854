//! Transaction ingress: the RPC front end consumed by users.
//!
//! Thin by design; everything of substance happens in the admission
//! handle. Error kinds map onto well-known JSON-RPC error codes.

use std::{net::SocketAddr, sync::Arc};

use alloy_primitives::B256;
use jsonrpsee::{
    core::{async_trait, Error},
    proc_macros::rpc,
    server::ServerBuilder,
    types::error::{CallError, ErrorObject},
};
use serde::{Deserialize, Serialize};

use crate::{
    common::Receipt,
    errors::{AdmissionError, ValidationError},
    forkchoice::SharedBlockState,
    mempool::InclusionPredicate,
    node::{Admission, ReceiptStore},
    oracle::StateSource,
};

/// Conditional-inclusion bounds as they appear on the wire. All four are
/// plain decimal integers; hex strings are rejected.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredicateParams {
    /// Inclusive lower bound on the inclusion block number
    #[serde(default)]
    pub block_number_min: Option<u64>,
    /// Inclusive upper bound on the inclusion block number
    #[serde(default)]
    pub block_number_max: Option<u64>,
    /// Inclusive lower bound on the inclusion block timestamp
    #[serde(default)]
    pub timestamp_min: Option<u64>,
    /// Inclusive upper bound on the inclusion block timestamp
    #[serde(default)]
    pub timestamp_max: Option<u64>,
}

impl From<PredicateParams> for InclusionPredicate {
    fn from(params: PredicateParams) -> Self {
        InclusionPredicate {
            block_number_min: params.block_number_min,
            block_number_max: params.block_number_max,
            timestamp_min: params.timestamp_min,
            timestamp_max: params.timestamp_max,
        }
    }
}

/// The methods exposed under the `tempo` namespace.
#[rpc(server, namespace = "tempo")]
pub trait Rpc {
    /// Decodes and admits a raw transaction, returning its identity hash.
    #[method(name = "sendRawTransaction")]
    async fn send_raw_transaction(&self, raw: String) -> Result<B256, Error>;

    /// Same as `sendRawTransaction` with an attached conditional predicate.
    #[method(name = "sendRawTransactionConditional")]
    async fn send_raw_transaction_conditional(
        &self,
        raw: String,
        predicate: PredicateParams,
    ) -> Result<B256, Error>;

    /// Structural receipt lookup for an included transaction.
    #[method(name = "getTransactionReceipt")]
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, Error>;

    /// The current unsafe head height.
    #[method(name = "blockNumber")]
    async fn block_number(&self) -> Result<u64, Error>;
}

/// The server implementation backed by the admission handle.
pub struct RpcServerImpl<S> {
    admission: Arc<Admission<S>>,
    receipts: Arc<ReceiptStore>,
    state: SharedBlockState,
}

impl<S> std::fmt::Debug for RpcServerImpl<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServerImpl").finish()
    }
}

#[async_trait]
impl<S: StateSource> RpcServer for RpcServerImpl<S> {
    async fn send_raw_transaction(&self, raw: String) -> Result<B256, Error> {
        let bytes = decode_hex_param(&raw)?;
        self.admission
            .submit(bytes, None)
            .await
            .map_err(to_rpc_error)
    }

    async fn send_raw_transaction_conditional(
        &self,
        raw: String,
        predicate: PredicateParams,
    ) -> Result<B256, Error> {
        let bytes = decode_hex_param(&raw)?;
        let predicate = InclusionPredicate::from(predicate);
        let predicate = (!predicate.is_empty()).then_some(predicate);
        self.admission
            .submit(bytes, predicate)
            .await
            .map_err(to_rpc_error)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, Error> {
        Ok(self.receipts.get(&hash))
    }

    async fn block_number(&self) -> Result<u64, Error> {
        Ok(self.state.snapshot().unsafe_head.number)
    }
}

fn decode_hex_param(raw: &str) -> Result<Vec<u8>, Error> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits)
        .map_err(|e| call_error(-32602, format!("invalid transaction bytes: {e}")))
}

fn call_error(code: i32, message: String) -> Error {
    Error::Call(CallError::Custom(ErrorObject::owned(
        code,
        message,
        None::<()>,
    )))
}

fn to_rpc_error(err: AdmissionError) -> Error {
    let code = match &err {
        AdmissionError::Validation(ValidationError::InvalidRlp(_)) => -32602,
        AdmissionError::Validation(ValidationError::DuplicateHash) => -32000,
        AdmissionError::Validation(ValidationError::StateUnavailable) => -32603,
        AdmissionError::Validation(_) => -32003,
        AdmissionError::Mempool(_) => -32005,
        AdmissionError::RateLimited => -32005,
        AdmissionError::Halted => -32000,
    };
    call_error(code, err.to_string())
}

/// Starts the ingress server and leaves it running in the background.
pub async fn run_server<S: StateSource>(
    addr: &str,
    port: u16,
    admission: Arc<Admission<S>>,
    receipts: Arc<ReceiptStore>,
    state: SharedBlockState,
) -> eyre::Result<SocketAddr> {
    let server = ServerBuilder::default()
        .build(format!("{addr}:{port}"))
        .await?;
    let local_addr = server.local_addr()?;
    let rpc_impl = RpcServerImpl {
        admission,
        receipts,
        state,
    };
    let handle = server.start(rpc_impl.into_rpc())?;
    tokio::spawn(handle.stopped());

    Ok(local_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mempool::Mempool,
        oracle::AccountState,
        transaction::test_utils::signed_legacy,
        validator::Validator,
    };
    use alloy_primitives::{Address, U256};
    use secp256k1::SecretKey;
    use serde_json::{json, Value};

    struct OpenSource;

    #[async_trait]
    impl StateSource for OpenSource {
        async fn account(&self, _address: Address) -> Result<AccountState, ValidationError> {
            Ok(AccountState {
                nonce: 0,
                balance: U256::MAX,
            })
        }
    }

    async fn start() -> (SocketAddr, Arc<ReceiptStore>) {
        let mempool = Arc::new(Mempool::new(16));
        let admission = Arc::new(Admission::new(
            mempool,
            Validator::new(Arc::new(OpenSource)),
            1000,
            false,
        ));
        let receipts = Arc::new(ReceiptStore::new(16));
        let state = SharedBlockState::default();
        let addr = run_server("127.0.0.1", 0, admission, receipts.clone(), state)
            .await
            .unwrap();
        (addr, receipts)
    }

    async fn call(addr: SocketAddr, method: &str, params: Value) -> Value {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        reqwest::Client::new()
            .post(format!("http://{addr}"))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submits_raw_transaction() {
        let (addr, _) = start().await;
        let tx = signed_legacy(&SecretKey::from_slice(&[7; 32]).unwrap(), 0, 10);
        let raw = format!("0x{}", hex::encode(&tx.raw.0));

        let response = call(addr, "tempo_sendRawTransaction", json!([raw])).await;
        let returned: B256 = response["result"].as_str().unwrap().parse().unwrap();
        assert_eq!(returned, tx.hash);

        // second submission is a duplicate
        let response = call(addr, "tempo_sendRawTransaction", json!([raw])).await;
        assert_eq!(response["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn rejects_hex_timestamps_in_predicate() {
        let (addr, _) = start().await;
        let tx = signed_legacy(&SecretKey::from_slice(&[8; 32]).unwrap(), 0, 10);
        let raw = format!("0x{}", hex::encode(&tx.raw.0));

        let response = call(
            addr,
            "tempo_sendRawTransactionConditional",
            json!([raw, { "timestamp_max": "0x64" }]),
        )
        .await;
        assert!(response.get("error").is_some());
    }

    #[tokio::test]
    async fn accepts_integer_predicate_bounds() {
        let (addr, _) = start().await;
        let tx = signed_legacy(&SecretKey::from_slice(&[9; 32]).unwrap(), 0, 10);
        let raw = format!("0x{}", hex::encode(&tx.raw.0));

        let response = call(
            addr,
            "tempo_sendRawTransactionConditional",
            json!([raw, { "block_number_max": 100 }]),
        )
        .await;
        assert!(response.get("result").is_some());
    }

    #[tokio::test]
    async fn receipt_lookup_and_block_number() {
        let (addr, receipts) = start().await;
        let hash = B256::repeat_byte(0x5a);
        receipts.insert(Receipt {
            transaction_hash: hash,
            block_hash: B256::repeat_byte(0x01),
            block_number: 7,
            transaction_index: 0,
            status: 1,
        });

        let response = call(addr, "tempo_getTransactionReceipt", json!([hash])).await;
        assert_eq!(response["result"]["blockNumber"], 7);

        let response = call(addr, "tempo_blockNumber", json!([])).await;
        assert_eq!(response["result"], 0);

        let missing = call(
            addr,
            "tempo_getTransactionReceipt",
            json!([B256::repeat_byte(0x77)]),
        )
        .await;
        assert!(missing["result"].is_null());
    }
}
