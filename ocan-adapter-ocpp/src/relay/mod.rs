//! OCPP interception relay
//!
//! Sits between a charge point and its CSMS, forwarding both directions and
//! optionally tampering with messages on the way through.
//!
//! - `transform`: attack modes (rewrite, inject, drop)
//! - `session`: bridging of one connection pair
//! - `registry`: live session bookkeeping
//! - `server`: websocket listener and upstream dialing

pub mod transform;
pub mod session;
pub mod registry;
pub mod server;

use thiserror::Error;

use crate::direction::Direction;

pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use server::InterceptionRelay;
pub use session::{bridge, SessionContext};
pub use transform::{AttackMode, Effect, Transformed, Transformer};

/// Errors ending a relay session
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connection closed ({0})")]
    ConnectionClosed(Direction),

    #[error("destination unavailable ({0})")]
    DestinationUnavailable(Direction),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
