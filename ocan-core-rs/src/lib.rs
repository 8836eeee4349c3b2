//! OCAN Core Library
//!
//! CAN side of the OCPP charge point gateway: frame types, the in-process
//! and UDP bus transports, and a streaming intrusion detector.

pub mod types;
pub mod bus;
pub mod detector;

pub use types::*;
pub use bus::{BusError, BusReader, BusSocket, FrameBus};
pub use detector::{Alarm, AlarmKind, DetectorConfig, DetectorHandle, IntrusionDetector, TrafficSummary};
