//! OCPP protocol layer
//!
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)

pub mod messages;

pub use messages::*;
