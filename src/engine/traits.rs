//! The engine abstraction the sequencing loop drives.

use async_trait::async_trait;

use crate::errors::RpcCallError;

use super::{ExecutionPayload, ForkChoiceUpdate, ForkchoiceState, PayloadAttributes, PayloadId, PayloadStatus};

/// The three operations of the execution client's payload-building
/// protocol. Implemented over authenticated JSON-RPC by
/// [`EngineApi`](super::EngineApi) and in-memory by the mock.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Updates which blocks the engine considers canonical and, when
    /// `payload_attributes` is given, starts a payload build.
    async fn forkchoice_updated(
        &self,
        forkchoice_state: ForkchoiceState,
        payload_attributes: Option<PayloadAttributes>,
    ) -> Result<ForkChoiceUpdate, RpcCallError>;

    /// Retrieves a payload prepared by a prior fork-choice update.
    async fn get_payload(&self, payload_id: PayloadId) -> Result<ExecutionPayload, RpcCallError>;

    /// Submits a payload for validation and import.
    async fn new_payload(&self, payload: ExecutionPayload) -> Result<PayloadStatus, RpcCallError>;
}
