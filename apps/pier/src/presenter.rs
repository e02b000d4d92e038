//! Outbound surface toward whatever UI or log view observes the host.
//!
//! The coordinator calls these without holding any internal lock, so an
//! implementation is free to marshal onto its own thread.

use crate::session::{BarcodePayload, SessionInformation};
use pier_proto::messages::SessionStatus;
use tracing::{info, warn};

pub trait Presenter: Send + Sync {
    /// A new pairing payload exists; the UI may pre-render the QR code.
    fn generate_barcode(&self, payload: &BarcodePayload);

    /// The client announced a session status.
    fn session_status_did_change(&self, status: SessionStatus);

    /// The client asked to be shown the QR code for this session.
    fn barcode_presentation_requested(&self, session: &SessionInformation);

    /// A connection attempt was rejected.
    fn connection_error_occurred(&self, message: &str);
}

/// Default presenter for headless runs: everything goes to the log.
pub struct TracingPresenter;

impl Presenter for TracingPresenter {
    fn generate_barcode(&self, payload: &BarcodePayload) {
        info!(
            fingerprint = %payload.certificate_fingerprint,
            "pairing barcode generated"
        );
    }

    fn session_status_did_change(&self, status: SessionStatus) {
        info!(status = status.as_str(), "session status changed");
    }

    fn barcode_presentation_requested(&self, session: &SessionInformation) {
        info!(session_id = %session.session_id, "barcode presentation requested");
    }

    fn connection_error_occurred(&self, message: &str) {
        warn!(message, "connection error");
    }
}
