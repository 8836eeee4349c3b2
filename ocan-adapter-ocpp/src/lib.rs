//! # OCAN OCPP Adapter
//!
//! OCPP side of the charge point gateway: translates OCPP-J calls into CAN
//! frames for the charging-relay module and back, and provides an
//! interception relay for tampering experiments on the OCPP link.
//!
//! ## Architecture
//!
//! ```text
//! CSMS (Backend)
//!       │ WebSocket OCPP-J
//!       ▼
//! ┌─────────────────────────────────┐
//! │  InterceptionRelay (optional)   │  rewrite / inject / drop
//! └─────────────┬───────────────────┘
//!               │ WebSocket OCPP-J
//!               ▼
//! ┌─────────────────────────────────┐
//! │  ProtocolGateway                │
//! │  FrameCodec ─► AdmissionFilter  │
//! └─────────────┬───────────────────┘
//!               │ 8-byte CAN frames
//!               ▼
//! ┌─────────────────────────────────┐
//! │  ocan-core FrameBus             │──► IntrusionDetector
//! └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocan_adapter_ocpp::{Direction, GatewayConfig, ProtocolGateway};
//! use serde_json::json;
//!
//! let gateway = ProtocolGateway::new(GatewayConfig::secure());
//! let frame = gateway
//!     .forward_action(
//!         Direction::CsmsToChargePoint,
//!         "SetChargingProfile",
//!         json!({"chargingProfileId": 1, "maxCurrent": 32.0}),
//!     )
//!     .unwrap();
//! println!("{}", frame);
//! ```

pub mod ocpp;
pub mod can;
pub mod config;
pub mod direction;
pub mod gateway;
pub mod relay;

pub use config::{BusConfig, GatewayConfig, RelayConfig};
pub use direction::Direction;
pub use gateway::{GatewayError, GatewayStats, ProtocolGateway};

// Re-export key types
pub use can::{AdmissionFilter, AdmissionPolicy, CodecError, FrameCodec};
pub use ocpp::{Call, CallError, CallResult, OcppError, OcppMessage};
pub use relay::{AttackMode, ConnectionRegistry, InterceptionRelay, RelayError};
