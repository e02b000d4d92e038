//! Session protocol engine.
//!
//! Owns the TCP listener and the per-connection state machine. One
//! client at a time; when a connection ends the engine loops back to
//! accept. Inbound frames are processed strictly in arrival order and
//! outbound frames are serialized through a single writer, so there is
//! no pipelining inside a connection.

use crate::rpc::{MediaServiceRpc, RpcError};
use pier_proto::framing::{read_frame, write_frame, FrameError};
use pier_proto::messages::{
    Envelope, RequestConnection, ServerMessage, SessionStatus, SessionStatusDidChange,
    PROTOCOL_VERSION,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard upper bound on engine teardown.
const DISPOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Credentials a client scans when it cannot (or will not) use the
/// cached pairing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodePayload {
    pub client_token: String,
    pub certificate_fingerprint: String,
}

/// The single live session. Owned by the engine; everyone else sees
/// clones handed out through events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInformation {
    pub session_id: String,
    pub client_id: String,
    pub barcode: BarcodePayload,
}

/// Milestones the engine reports upward.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A session was accepted and its pairing payload exists.
    BarcodeGenerated(SessionInformation),
    /// The client asked to be shown the QR code.
    BarcodeRequested(SessionInformation),
    /// The client announced a session status.
    StatusChanged(SessionStatus),
    /// A connection attempt was rejected (currently: version mismatch).
    ConnectionError(String),
    /// The session ended; the coordinator should tear down and relisten.
    DisconnectRequested,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("canceled while waiting for the media stream")]
    Canceled,
}

/// Bridge to the media stack: block until the stream backend is
/// actually up. Implemented by the coordinator over the RPC client and
/// the state poller.
#[async_trait]
pub trait MediaLauncher: Send + Sync {
    async fn ensure_stream_ready(&self, cancel: &CancellationToken) -> Result<(), LaunchError>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub endpoint: SocketAddr,
    pub server_id: String,
    pub force_barcode: bool,
}

enum Flow {
    Continue,
    Close,
}

pub struct SessionEngine {
    shared: Arc<EngineShared>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct EngineShared {
    config: EngineConfig,
    rpc: Arc<dyn MediaServiceRpc>,
    launcher: Arc<dyn MediaLauncher>,
    events: mpsc::UnboundedSender<EngineEvent>,
    active: Mutex<Option<SessionInformation>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

impl SessionEngine {
    pub async fn start(
        config: EngineConfig,
        rpc: Arc<dyn MediaServiceRpc>,
        launcher: Arc<dyn MediaLauncher>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> std::io::Result<Self> {
        let socket = match config.endpoint {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.endpoint)?;
        let listener = socket.listen(64)?;
        let local_addr = listener.local_addr()?;
        info!(endpoint = %local_addr, "listening for session clients");

        let cancel = CancellationToken::new();
        let shared = Arc::new(EngineShared {
            config,
            rpc,
            launcher,
            events,
            active: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            cancel: cancel.clone(),
        });

        let accept_task = tokio::spawn(accept_loop(Arc::clone(&shared), listener));

        Ok(Self {
            shared,
            accept_task,
            local_addr,
        })
    }

    /// Bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Tear the engine down. A 3-second deadline is armed first so a
    /// wedged peer cannot stall the best-effort disconnect.
    pub async fn dispose(self) {
        let deadline = {
            let cancel = self.shared.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DISPOSE_TIMEOUT).await;
                if !cancel.is_cancelled() {
                    cancel.cancel();
                }
            })
        };

        if let Some(session_id) = self.shared.active_session_id() {
            self.shared.send_disconnect(&session_id).await;
        }

        self.shared.cancel.cancel();
        if let Err(err) = self.accept_task.await {
            warn!(error = %err, "accept task did not end cleanly");
        }
        deadline.abort();
        *self.shared.writer.lock().await = None;
    }
}

async fn accept_loop(shared: Arc<EngineShared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "set_nodelay failed");
        }
        if let Err(err) = stream.set_linger(None) {
            debug!(error = %err, "set_linger failed");
        }

        info!(%peer, "client connected");
        let (mut reader, writer) = stream.into_split();
        *shared.writer.lock().await = Some(writer);

        connection_loop(&shared, &mut reader).await;

        *shared.writer.lock().await = None;
        debug!(%peer, "client connection ended");

        if shared.cancel.is_cancelled() {
            return;
        }
    }
}

async fn connection_loop(shared: &EngineShared, reader: &mut OwnedReadHalf) {
    loop {
        match read_frame(reader, &shared.cancel).await {
            Ok(payload) => match shared.handle_frame(&payload).await {
                Flow::Continue => {}
                Flow::Close => return,
            },
            Err(FrameError::PeerClosed) => {
                debug!("peer closed the connection");
                return;
            }
            Err(FrameError::Canceled) => return,
            Err(err @ (FrameError::TooLarge(_) | FrameError::Utf8)) => {
                warn!(error = %err, "bad frame; closing connection");
                return;
            }
            Err(FrameError::Io(err)) => {
                warn!(error = %err, "stream error; closing connection");
                return;
            }
        }
    }
}

impl EngineShared {
    fn active(&self) -> Option<SessionInformation> {
        self.active.lock().expect("session lock poisoned").clone()
    }

    fn active_session_id(&self) -> Option<String> {
        self.active
            .lock()
            .expect("session lock poisoned")
            .as_ref()
            .map(|info| info.session_id.clone())
    }

    async fn handle_frame(&self, payload: &str) -> Flow {
        let Some(envelope) = Envelope::peek(payload) else {
            debug!("ignoring frame that is not a JSON object");
            return Flow::Continue;
        };
        let (Some(event), Some(session_id)) = (envelope.event, envelope.session_id) else {
            debug!("ignoring frame without Event/SessionID");
            return Flow::Continue;
        };

        let active_id = self.active_session_id();
        if event == "RequestConnection" {
            if active_id.is_some() {
                debug!(%session_id, "connection request while a session is active");
                self.send(&ServerMessage::RequestSessionDisconnect { session_id })
                    .await;
                return Flow::Continue;
            }
        } else if active_id.as_deref() != Some(session_id.as_str()) {
            debug!(%session_id, ?active_id, "message for a foreign session");
            self.send(&ServerMessage::RequestSessionDisconnect { session_id })
                .await;
            return Flow::Continue;
        }

        match event.as_str() {
            "RequestConnection" => self.handle_request_connection(payload, session_id).await,
            "RequestBarcodePresentation" => self.handle_barcode_request(session_id).await,
            "SessionStatusDidChange" => self.handle_status_change(payload).await,
            "RequestSessionDisconnect" => {
                info!(%session_id, "client requested session disconnect");
                let _ = self.events.send(EngineEvent::DisconnectRequested);
                Flow::Continue
            }
            other => {
                debug!(event = other, "ignoring unknown event");
                Flow::Continue
            }
        }
    }

    async fn handle_request_connection(&self, payload: &str, session_id: String) -> Flow {
        let request: RequestConnection = match serde_json::from_str(payload) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "malformed RequestConnection; ignoring");
                return Flow::Continue;
            }
        };

        if request.protocol_version != PROTOCOL_VERSION {
            warn!(
                version = %request.protocol_version,
                "client speaks an unsupported protocol version"
            );
            self.send(&ServerMessage::RequestSessionDisconnect { session_id })
                .await;
            let _ = self.events.send(EngineEvent::ConnectionError(format!(
                "client protocol version {:?} is not supported (expected {PROTOCOL_VERSION:?})",
                request.protocol_version
            )));
            return Flow::Close;
        }

        let client_token = match self.rpc.issue_client_token(&request.client_id).await {
            Ok(token) => token,
            Err(err) => {
                warn!(error = %err, "issuing client token failed");
                self.send(&ServerMessage::RequestSessionDisconnect { session_id })
                    .await;
                return Flow::Continue;
            }
        };
        let fingerprint = match self.rpc.certificate_fingerprint().await {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                warn!(error = %err, "fetching certificate fingerprint failed");
                self.send(&ServerMessage::RequestSessionDisconnect { session_id })
                    .await;
                return Flow::Continue;
            }
        };

        let info = SessionInformation {
            session_id: request.session_id.clone(),
            client_id: request.client_id.clone(),
            barcode: BarcodePayload {
                client_token,
                certificate_fingerprint: fingerprint.clone(),
            },
        };
        {
            let mut active = self.active.lock().expect("session lock poisoned");
            *active = Some(info.clone());
        }
        info!(session_id = %info.session_id, client_id = %info.client_id, "session accepted");
        let _ = self.events.send(EngineEvent::BarcodeGenerated(info));

        // Omitting the fingerprint forces the client onto the QR path.
        let certificate_fingerprint = if self.config.force_barcode {
            None
        } else {
            Some(fingerprint)
        };
        self.send(&ServerMessage::AcknowledgeConnection {
            session_id: request.session_id,
            server_id: self.config.server_id.clone(),
            certificate_fingerprint,
        })
        .await;
        Flow::Continue
    }

    async fn handle_barcode_request(&self, session_id: String) -> Flow {
        if let Some(info) = self.active() {
            let _ = self.events.send(EngineEvent::BarcodeRequested(info));
        }
        self.send(&ServerMessage::AcknowledgeBarcodePresentation { session_id })
            .await;
        Flow::Continue
    }

    async fn handle_status_change(&self, payload: &str) -> Flow {
        let message: SessionStatusDidChange = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "malformed SessionStatusDidChange; ignoring");
                return Flow::Continue;
            }
        };

        info!(session_id = %message.session_id, status = message.status.as_str(), "session status");
        let _ = self
            .events
            .send(EngineEvent::StatusChanged(message.status));

        match message.status {
            SessionStatus::Waiting => {
                match self.launcher.ensure_stream_ready(&self.cancel).await {
                    Ok(()) => {
                        self.send(&ServerMessage::MediaStreamIsReady {
                            session_id: message.session_id,
                        })
                        .await;
                    }
                    Err(LaunchError::Canceled) => {}
                    Err(err) => {
                        warn!(error = %err, "media stream preparation failed");
                        self.send(&ServerMessage::RequestSessionDisconnect {
                            session_id: message.session_id,
                        })
                        .await;
                    }
                }
            }
            SessionStatus::Disconnected => {
                let _ = self.events.send(EngineEvent::DisconnectRequested);
            }
            _ => {}
        }
        Flow::Continue
    }

    /// Clear the active session if it matches, then best-effort write a
    /// disconnect if a stream is open.
    async fn send_disconnect(&self, session_id: &str) {
        {
            let mut active = self.active.lock().expect("session lock poisoned");
            if active
                .as_ref()
                .is_some_and(|info| info.session_id == session_id)
            {
                *active = None;
            }
        }
        self.send(&ServerMessage::RequestSessionDisconnect {
            session_id: session_id.to_string(),
        })
        .await;
    }

    async fn send(&self, message: &ServerMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound message");
                return;
            }
        };
        let mut writer = self.writer.lock().await;
        if let Some(stream) = writer.as_mut() {
            if let Err(err) = write_frame(stream, &bytes, &self.cancel).await {
                debug!(error = %err, "outbound write failed");
            }
        }
    }
}
