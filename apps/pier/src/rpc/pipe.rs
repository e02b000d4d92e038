//! Pipe-backed client for the media service control endpoint.
//!
//! The service exposes a local stream socket speaking the same
//! length-prefixed JSON framing as the session protocol: one request
//! frame per call, one response frame back, correlated by `id`. Calls
//! are serialized on a single connection; the connection is established
//! lazily and dropped on any transport error so the next call retries.

use super::{MediaServiceRpc, MediaServiceState, RpcError};
use async_trait::async_trait;
use pier_proto::framing::{read_frame, write_frame, FrameError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
type ControlStream = tokio::net::UnixStream;
#[cfg(not(unix))]
type ControlStream = tokio::net::TcpStream;

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

pub struct PipeRpcClient {
    socket_path: PathBuf,
    conn: tokio::sync::Mutex<Option<ControlStream>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl PipeRpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            conn: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    async fn ensure_connected(
        &self,
        guard: &mut Option<ControlStream>,
    ) -> Result<(), RpcError> {
        if guard.is_some() {
            return Ok(());
        }
        let stream = self.connect_stream().await?;
        *guard = Some(stream);
        Ok(())
    }

    #[cfg(unix)]
    async fn connect_stream(&self) -> Result<ControlStream, RpcError> {
        tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|err| {
                RpcError::Unavailable(format!(
                    "connect {}: {err}",
                    self.socket_path.display()
                ))
            })
    }

    #[cfg(not(unix))]
    async fn connect_stream(&self) -> Result<ControlStream, RpcError> {
        // On platforms without unix sockets the control endpoint is a
        // loopback TCP port written next to the executable.
        let addr = std::fs::read_to_string(&self.socket_path)
            .map_err(|err| RpcError::Unavailable(err.to_string()))?;
        tokio::net::TcpStream::connect(addr.trim())
            .await
            .map_err(|err| RpcError::Unavailable(err.to_string()))
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Option<Value>, RpcError> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard).await?;
        let Some(stream) = guard.as_mut() else {
            return Err(RpcError::Unavailable("control socket not connected".into()));
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request { id, method, params };
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| RpcError::CallFailed(err.to_string()))?;

        let io_result: Result<String, FrameError> = async {
            write_frame(stream, &bytes, &self.cancel).await?;
            read_frame(stream, &self.cancel).await
        }
        .await;

        let payload = match io_result {
            Ok(payload) => payload,
            Err(err) => {
                // Drop the connection so the next call reconnects.
                *guard = None;
                return Err(RpcError::Unavailable(err.to_string()));
            }
        };
        let response: Response = serde_json::from_str(&payload)
            .map_err(|err| RpcError::CallFailed(format!("malformed response: {err}")))?;

        if response.id != id {
            *guard = None;
            return Err(RpcError::Unavailable(format!(
                "response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(message) = response.error {
            return Err(RpcError::CallFailed(message));
        }
        Ok(response.result)
    }
}

#[async_trait]
impl MediaServiceRpc for PipeRpcClient {
    async fn connect(&self) -> Result<(), RpcError> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard).await
    }

    async fn start_service(&self, version: &str) -> Result<(), RpcError> {
        self.call(
            "startService",
            Some(serde_json::json!({ "version": version })),
        )
        .await?;
        Ok(())
    }

    async fn stop_service(&self) -> Result<(), RpcError> {
        self.call("stopService", None).await?;
        Ok(())
    }

    async fn query_status(&self) -> Result<Option<MediaServiceState>, RpcError> {
        let result = self.call("queryStatus", None).await?;
        match result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                let state: MediaServiceState = serde_json::from_value(value)
                    .map_err(|err| RpcError::Unavailable(format!("bad status payload: {err}")))?;
                Ok(Some(state))
            }
        }
    }

    async fn issue_client_token(&self, client_id: &str) -> Result<String, RpcError> {
        let result = self
            .call(
                "issueClientToken",
                Some(serde_json::json!({ "clientId": client_id })),
            )
            .await?;
        string_result(result, "issueClientToken")
    }

    async fn certificate_fingerprint(&self) -> Result<String, RpcError> {
        let result = self
            .call(
                "certificateFingerprint",
                Some(serde_json::json!({ "algorithm": "SHA256" })),
            )
            .await?;
        string_result(result, "certificateFingerprint")
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut guard = self.conn.lock().await;
        *guard = None;
    }
}

fn string_result(result: Option<Value>, method: &str) -> Result<String, RpcError> {
    match result {
        Some(Value::String(value)) => Ok(value),
        other => Err(RpcError::CallFailed(format!(
            "{method} returned {other:?} instead of a string"
        ))),
    }
}
