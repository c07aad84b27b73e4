//! # Simulation Stream
//!
//! Everything between the simulation server and the local view state.
//!
//! ## Key Components:
//! - **event**: Wire format of inbound frames and the closed [`StreamEvent`] enum
//! - **transport**: The [`Transport`] seam and its tokio-tungstenite implementation
//! - **controller**: Connection lifecycle, the start handshake and event dispatch
//!
//! ## Message flow:
//! ```text
//! WsTransport reader ──► SessionController::handle_message ──┬─► PlaybackQueue::enqueue
//!                                                            └─► ViewStore (transcript, rankings, status)
//! ```

pub mod controller;
pub mod event;
pub mod transport;

pub use controller::{
    ConnectOutcome, ConnectionState, SessionController, StartOutcome, StartReport, StreamSettings,
    StreamStats,
};
pub use event::{parse_event, EventError, EventKind, StreamEvent};
pub use transport::{Transport, TransportError, WsTransport};
