//! The authenticated engine client.
//!
//! JSON-RPC 2.0 over HTTP with a bearer token on every request; token
//! issuance and reuse live in [`EngineAuth`].

use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::{EngineError, RpcCallError, TransportError};

use super::{
    auth::EngineAuth, Engine, ExecutionPayload, ForkChoiceUpdate, ForkchoiceState,
    PayloadAttributes, PayloadId, PayloadStatus,
};

/// `engine_forkchoiceUpdatedV3`
pub const ENGINE_FORKCHOICE_UPDATED: &str = "engine_forkchoiceUpdatedV3";
/// `engine_getPayloadV3`
pub const ENGINE_GET_PAYLOAD: &str = "engine_getPayloadV3";
/// `engine_newPayloadV3`
pub const ENGINE_NEW_PAYLOAD: &str = "engine_newPayloadV3";

/// Engine requests time out faster than ordinary reads; a slow engine is
/// handled by skipping the tick.
const ENGINE_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// The authenticated execution-client protocol client.
#[derive(Debug)]
pub struct EngineApi {
    /// Base request url
    base_url: String,
    /// HTTP client
    client: reqwest::Client,
    /// Bearer-token issuer over the shared HMAC secret
    auth: EngineAuth,
}

impl EngineApi {
    /// Creates a client for the given engine endpoint and token issuer.
    pub fn new(base_url: &str, auth: EngineAuth) -> Self {
        let client = reqwest::ClientBuilder::new()
            .timeout(ENGINE_REQUEST_TIMEOUT)
            .build()
            .expect("http client construction cannot fail");
        Self {
            base_url: base_url.to_string(),
            client,
            auth,
        }
    }

    async fn post(&self, method: &str, params: Value) -> Result<Value, RpcCallError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let token = self.auth.token().map_err(|_| EngineError {
            code: -32000,
            message: "could not sign bearer token".to_string(),
        })?;
        tracing::trace!(method, url = %self.base_url, "sending engine request");

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcCallError::from(TransportError::Timeout)
                } else {
                    RpcCallError::from(TransportError::ConnectionRefused)
                }
            })?;

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
            tracing::warn!(method, payload = %error, "engine returned an error object");
            return Err(EngineError { code, message }.into());
        }

        match payload.get_mut("result") {
            Some(result) if !result.is_null() => Ok(result.take()),
            _ => Err(TransportError::EmptyResponse.into()),
        }
    }
}

#[async_trait]
impl Engine for EngineApi {
    async fn forkchoice_updated(
        &self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> Result<ForkChoiceUpdate, RpcCallError> {
        let result = self
            .post(
                ENGINE_FORKCHOICE_UPDATED,
                json!([forkchoice_state, payload_attributes]),
            )
            .await?;
        serde_json::from_value(result).map_err(|_| TransportError::EmptyResponse.into())
    }

    async fn get_payload(&self, payload_id: PayloadId) -> Result<ExecutionPayload, RpcCallError> {
        let result = self.post(ENGINE_GET_PAYLOAD, json!([payload_id])).await?;
        // V3 wraps the payload in an envelope object
        let payload = result
            .get("executionPayload")
            .cloned()
            .unwrap_or(result);
        serde_json::from_value(payload).map_err(|_| TransportError::EmptyResponse.into())
    }

    async fn new_payload(&self, payload: ExecutionPayload) -> Result<PayloadStatus, RpcCallError> {
        let versioned_hashes: Vec<B256> = vec![];
        let result = self
            .post(
                ENGINE_NEW_PAYLOAD,
                json!([payload, versioned_hashes, B256::ZERO]),
            )
            .await?;
        serde_json::from_value(result).map_err(|_| TransportError::EmptyResponse.into())
    }
}
