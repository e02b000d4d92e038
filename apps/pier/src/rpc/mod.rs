//! Typed capability facade over the media service's control interface.
//!
//! The streaming engine runs out of process; everything the host needs
//! from it goes through this trait so the protocol engine and poller can
//! be exercised against an in-process fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod pipe;

pub use pipe::PipeRpcClient;

/// Version string handed to `start_service` unless overridden by config.
pub const DEFAULT_SERVICE_VERSION: &str = "6.0.0";

/// Snapshot of the media service's observable state. Equality is
/// field-wise; the poller publishes a new snapshot only when one field
/// changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaServiceState {
    pub open_xr_runtime_running: bool,
    pub client_connected: bool,
    pub game_connected: bool,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("media service unavailable: {0}")]
    Unavailable(String),
    #[error("media service call failed: {0}")]
    CallFailed(String),
}

#[async_trait]
pub trait MediaServiceRpc: Send + Sync {
    /// Idempotent; the other operations invoke it lazily.
    async fn connect(&self) -> Result<(), RpcError>;

    async fn start_service(&self, version: &str) -> Result<(), RpcError>;

    async fn stop_service(&self) -> Result<(), RpcError>;

    /// `None` while the service is not running; a complete snapshot
    /// otherwise.
    async fn query_status(&self) -> Result<Option<MediaServiceState>, RpcError>;

    /// Derive the pairing token for a client. Requires the service to be
    /// running.
    async fn issue_client_token(&self, client_id: &str) -> Result<String, RpcError>;

    /// Hex SHA-256 of the streaming certificate. Requires the service to
    /// be running.
    async fn certificate_fingerprint(&self) -> Result<String, RpcError>;

    async fn close(&self);
}
