//! Periodic observation of the media service state.
//!
//! One task polls the RPC status endpoint and publishes field-wise
//! changes on a watch channel. The handshake path uses
//! [`await_runtime_matches`] to block until a start/stop request has
//! visibly taken effect.

use crate::rpc::{MediaServiceRpc, MediaServiceState};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const STATE_CHANGE_POLL_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
#[error("canceled while waiting for the runtime state")]
pub struct WaitCanceled;

pub struct MediaStatePoller {
    states: watch::Receiver<MediaServiceState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MediaStatePoller {
    pub fn spawn(rpc: Arc<dyn MediaServiceRpc>) -> Self {
        let (tx, states) = watch::channel(MediaServiceState::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(rpc, tx, cancel.clone()));
        Self {
            states,
            cancel,
            task,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MediaServiceState> {
        self.states.clone()
    }

    pub fn current(&self) -> MediaServiceState {
        *self.states.borrow()
    }

    pub async fn await_runtime_matches(
        &self,
        expected: bool,
        cancel: &CancellationToken,
    ) -> Result<(), WaitCanceled> {
        await_runtime_matches(self.states.clone(), expected, cancel).await
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn poll_loop(
    rpc: Arc<dyn MediaServiceRpc>,
    tx: watch::Sender<MediaServiceState>,
    cancel: CancellationToken,
) {
    let mut last = MediaServiceState::default();
    loop {
        let observed = match rpc.query_status().await {
            Ok(Some(state)) => state,
            // Absent and unavailable both read as "nothing running".
            Ok(None) => MediaServiceState::default(),
            Err(err) => {
                trace!(error = %err, "status query failed");
                MediaServiceState::default()
            }
        };

        if observed != last {
            debug!(
                runtime = observed.open_xr_runtime_running,
                client = observed.client_connected,
                game = observed.game_connected,
                "media service state changed"
            );
            last = observed;
            let _ = tx.send(observed);
        }

        tokio::task::yield_now().await;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
        }
    }
}

/// Re-check the last-observed state on a short delay until the runtime
/// flag matches `expected`.
pub async fn await_runtime_matches(
    states: watch::Receiver<MediaServiceState>,
    expected: bool,
    cancel: &CancellationToken,
) -> Result<(), WaitCanceled> {
    loop {
        if states.borrow().open_xr_runtime_running == expected {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(WaitCanceled),
            _ = tokio::time::sleep(STATE_CHANGE_POLL_DELAY) => {}
        }
    }
}
