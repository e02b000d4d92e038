//! Wire protocol shared by the pier host and its headset clients.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for other client targets without pulling in the host runtime.

pub mod framing;
pub mod messages;

pub use framing::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use messages::{
    ClientId, Envelope, RequestBarcodePresentation, RequestConnection, RequestSessionDisconnect,
    ServerMessage, SessionId, SessionStatus, SessionStatusDidChange, PROTOCOL_VERSION,
};
