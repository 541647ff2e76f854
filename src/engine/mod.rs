//! The authenticated engine protocol: the trait the sequencing loop
//! drives, the HTTP client, and the wire types.

/// The HTTP client
pub mod api;
/// Bearer-token authentication
pub mod auth;
/// In-process mock engine
pub mod mock_engine;
/// The engine abstraction
pub mod traits;
/// Wire types
pub mod types;

pub use api::EngineApi;
pub use auth::EngineAuth;
pub use mock_engine::MockEngine;
pub use traits::Engine;
pub use types::{
    payload_block_info, ExecutionPayload, ForkChoiceUpdate, ForkchoiceState, PayloadAttributes,
    PayloadId, PayloadStatus, Status,
};
