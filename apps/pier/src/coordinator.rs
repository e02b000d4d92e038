//! Top-level composition.
//!
//! The coordinator wires the advertiser, the media stack (supervisor +
//! RPC client), the state poller, and the session engine together,
//! translates their events for the presenter, and restarts the whole
//! session stack when a client disconnects.

use crate::advertise::{local_instance_name, ServiceAdvertiser, ServiceRegistration};
use crate::config::Config;
use crate::identity::ServerId;
use crate::logsink::{LogSink, MemoryLogSink};
use crate::poller::{await_runtime_matches, MediaStatePoller};
use crate::presenter::Presenter;
use crate::rpc::{MediaServiceRpc, MediaServiceState};
use crate::session::{
    EngineConfig, EngineEvent, LaunchError, MediaLauncher, SessionEngine,
};
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Coarse host state for status indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub bonjour: String,
    pub media: String,
    pub session: String,
}

impl Default for HostStatus {
    fn default() -> Self {
        Self {
            bonjour: "Stopped".to_string(),
            media: "Stopped".to_string(),
            session: "Stopped".to_string(),
        }
    }
}

/// One cycle's worth of media stack. Rebuilt after every session
/// disconnect so restart really is a restart.
pub struct MediaStack {
    pub supervisor: Option<ProcessSupervisor>,
    pub rpc: Arc<dyn MediaServiceRpc>,
}

#[async_trait]
pub trait MediaStackFactory: Send + Sync {
    async fn build(&self, sink: Arc<dyn LogSink>) -> anyhow::Result<MediaStack>;
}

/// Blocks the WAITING handshake step until the runtime is visibly up.
struct StreamLauncher {
    rpc: Arc<dyn MediaServiceRpc>,
    states: watch::Receiver<MediaServiceState>,
    version: String,
}

#[async_trait]
impl MediaLauncher for StreamLauncher {
    async fn ensure_stream_ready(&self, cancel: &CancellationToken) -> Result<(), LaunchError> {
        self.rpc.start_service(&self.version).await?;
        await_runtime_matches(self.states.clone(), true, cancel)
            .await
            .map_err(|_| LaunchError::Canceled)
    }
}

enum CycleOutcome {
    Restart,
    Shutdown,
}

pub struct Coordinator {
    config: Config,
    server_id: ServerId,
    presenter: Arc<dyn Presenter>,
    sink: Arc<MemoryLogSink>,
    advertiser: Arc<dyn ServiceAdvertiser>,
    stack_factory: Arc<dyn MediaStackFactory>,
    status_tx: watch::Sender<HostStatus>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        server_id: ServerId,
        presenter: Arc<dyn Presenter>,
        sink: Arc<MemoryLogSink>,
        advertiser: Arc<dyn ServiceAdvertiser>,
        stack_factory: Arc<dyn MediaStackFactory>,
    ) -> Self {
        let (status_tx, _) = watch::channel(HostStatus::default());
        Self {
            config,
            server_id,
            presenter,
            sink,
            advertiser,
            stack_factory,
            status_tx,
        }
    }

    pub fn status(&self) -> watch::Receiver<HostStatus> {
        self.status_tx.subscribe()
    }

    /// Serve until `shutdown` fires. Each client disconnect tears the
    /// session stack down and rebuilds it; the advertisement outlives
    /// those restarts.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let registration = ServiceRegistration::new(
            local_instance_name(),
            self.config.port,
            vec![self.config.address],
            &self.config.bundle_id,
        );
        match self.advertiser.advertise(&registration) {
            Ok(()) => self.set_bonjour("Running".to_string()),
            Err(err) => {
                // Not fatal: a client that already knows the endpoint can
                // still connect.
                warn!(error = %err, "service advertisement failed");
                self.sink.append(&format!("advertisement failed: {err}"));
                self.set_bonjour(format!("Error ({err})"));
            }
        }

        let result = loop {
            match self.run_cycle(&shutdown).await {
                Ok(CycleOutcome::Restart) => {
                    info!("session ended; restarting listener");
                    continue;
                }
                Ok(CycleOutcome::Shutdown) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.advertiser.close();
        self.set_bonjour("Stopped".to_string());
        result
    }

    async fn run_cycle(&self, shutdown: &CancellationToken) -> anyhow::Result<CycleOutcome> {
        let stack = self
            .stack_factory
            .build(Arc::clone(&self.sink) as Arc<dyn LogSink>)
            .await?;
        let rpc = Arc::clone(&stack.rpc);

        if let Err(err) = rpc.connect().await {
            warn!(error = %err, "media service control endpoint unreachable");
            self.sink.append(&format!("media service unreachable: {err}"));
            self.presenter
                .connection_error_occurred(&format!("media service unreachable: {err}"));
        }

        let poller = MediaStatePoller::spawn(Arc::clone(&rpc));
        let mut media_states = poller.subscribe();
        let launcher = Arc::new(StreamLauncher {
            rpc: Arc::clone(&rpc),
            states: poller.subscribe(),
            version: self.config.media_service_version.clone(),
        });

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let engine = SessionEngine::start(
            EngineConfig {
                endpoint: self.config.endpoint(),
                server_id: self.server_id.clone(),
                force_barcode: self.config.force_barcode,
            },
            Arc::clone(&rpc),
            launcher,
            events_tx,
        )
        .await?;

        self.set_media(summarize_media_state(poller.current()));
        self.set_session(format!("Stopped (Listening on {}…)", engine.local_addr()));

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break CycleOutcome::Shutdown,
                changed = media_states.changed() => {
                    if changed.is_ok() {
                        let state = *media_states.borrow();
                        self.set_media(summarize_media_state(state));
                    }
                }
                event = events.recv() => match event {
                    Some(EngineEvent::BarcodeGenerated(info)) => {
                        self.presenter.generate_barcode(&info.barcode);
                    }
                    Some(EngineEvent::BarcodeRequested(info)) => {
                        self.presenter.barcode_presentation_requested(&info);
                    }
                    Some(EngineEvent::StatusChanged(status)) => {
                        self.presenter.session_status_did_change(status);
                        self.set_session(status.as_str().to_string());
                    }
                    Some(EngineEvent::ConnectionError(message)) => {
                        self.presenter.connection_error_occurred(&message);
                    }
                    Some(EngineEvent::DisconnectRequested) => break CycleOutcome::Restart,
                    None => break CycleOutcome::Shutdown,
                }
            }
        };

        // Reverse of construction: engine, poller, rpc, supervisor.
        engine.dispose().await;
        poller.shutdown().await;
        if let Err(err) = rpc.stop_service().await {
            debug!(error = %err, "stop_service during teardown failed");
        }
        rpc.close().await;
        if let Some(supervisor) = stack.supervisor {
            supervisor.shutdown().await;
        }

        Ok(outcome)
    }

    fn set_bonjour(&self, value: String) {
        self.sink.append(&format!("bonjour: {value}"));
        self.status_tx.send_modify(|status| status.bonjour = value);
    }

    fn set_media(&self, value: String) {
        self.sink.append(&format!("media service: {value}"));
        self.status_tx.send_modify(|status| status.media = value);
    }

    fn set_session(&self, value: String) {
        self.sink.append(&format!("session: {value}"));
        self.status_tx.send_modify(|status| status.session = value);
    }
}

/// All three parts up reads as running; a partial stack names what is
/// still missing.
fn summarize_media_state(state: MediaServiceState) -> String {
    let up = [
        state.open_xr_runtime_running,
        state.client_connected,
        state.game_connected,
    ];
    if up.iter().all(|&flag| flag) {
        return "Running".to_string();
    }
    if up.iter().all(|&flag| !flag) {
        return "Stopped".to_string();
    }
    let mut missing = Vec::new();
    if !state.open_xr_runtime_running {
        missing.push("runtime");
    }
    if !state.client_connected {
        missing.push("client");
    }
    if !state.game_connected {
        missing.push("game");
    }
    format!("Paused (waiting for {})", missing.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(runtime: bool, client: bool, game: bool) -> MediaServiceState {
        MediaServiceState {
            open_xr_runtime_running: runtime,
            client_connected: client,
            game_connected: game,
        }
    }

    #[test]
    fn all_flags_up_reads_running() {
        assert_eq!(summarize_media_state(state(true, true, true)), "Running");
    }

    #[test]
    fn no_flags_reads_stopped() {
        assert_eq!(summarize_media_state(state(false, false, false)), "Stopped");
    }

    #[test]
    fn partial_stack_names_whats_missing() {
        assert_eq!(
            summarize_media_state(state(true, false, false)),
            "Paused (waiting for client, game)"
        );
        assert_eq!(
            summarize_media_state(state(true, true, false)),
            "Paused (waiting for game)"
        );
    }
}
