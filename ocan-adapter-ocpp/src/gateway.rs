//! OCPP <-> CAN protocol gateway
//!
//! Composes the [`FrameCodec`] and the [`AdmissionFilter`]:
//!
//! ```text
//! OCPP CALL ──forward──► rule lookup ──► encode ──► admission ──► Frame ──► bus
//! OCPP CALL ◄──ingest─── decode ◄────────────────────────────────── Frame
//! ```
//!
//! Admission only guards what the gateway commands onto the bus; frames
//! coming back from the bus are never filtered.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use ocan_core::{format_id, CanId, Frame, FrameBus};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::can::{AdmissionFilter, CodecError, FrameCodec};
use crate::config::GatewayConfig;
use crate::direction::Direction;
use crate::ocpp::{Call, OcppMessage};

#[derive(Debug, Error, PartialEq)]
pub enum GatewayError {
    #[error("no CAN translation for {0}")]
    UntranslatableAction(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(CodecError),

    #[error("CAN ID {0:#05X} rejected by admission filter")]
    Rejected(CanId),

    #[error("unrecognized CAN ID {0:#05X}")]
    Unrecognized(CanId),
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub processed: u64,
    pub blocked: u64,
    pub forwarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    blocked: AtomicU64,
    forwarded: AtomicU64,
}

/// Translates OCPP calls into CAN frames and back
pub struct ProtocolGateway {
    codec: FrameCodec,
    filter: AdmissionFilter,
    counters: Counters,
    bus: Option<FrameBus>,
}

impl ProtocolGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            codec: FrameCodec,
            filter: AdmissionFilter::new(config.admission),
            counters: Counters::default(),
            bus: None,
        }
    }

    /// Publish every forwarded frame onto `bus`
    pub fn with_bus(mut self, bus: FrameBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn filter(&self) -> &AdmissionFilter {
        &self.filter
    }

    pub fn enable_filter(&self, ids: Option<HashSet<CanId>>) {
        self.filter.enable(ids);
    }

    pub fn disable_filter(&self) {
        self.filter.disable();
    }

    /// Translate an OCPP call into a frame bound for the bus
    pub fn forward(&self, direction: Direction, message: &OcppMessage) -> Result<Frame, GatewayError> {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let call = match message {
            OcppMessage::Call(call) => call,
            other => {
                debug!("{} {:?} has no CAN form", direction, other.message_type());
                return Err(GatewayError::UntranslatableAction(format!(
                    "{:?}",
                    other.message_type()
                )));
            }
        };

        let rule = FrameCodec::rule_for_action(&call.action).ok_or_else(|| {
            warn!("Unknown OCPP action: {}", call.action);
            GatewayError::UntranslatableAction(call.action.clone())
        })?;

        let data = rule.encode(&call.payload).map_err(|e| {
            warn!("Payload encoding failed for {}: {}", call.action, e);
            GatewayError::InvalidPayload(e)
        })?;

        self.admit(direction, &call.action, Frame::new(rule.id, data))
    }

    /// Offer an already-built frame to the bus, bypassing the codec
    pub fn forward_raw(&self, direction: Direction, frame: Frame) -> Result<Frame, GatewayError> {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        self.admit(direction, "raw", frame)
    }

    fn admit(&self, direction: Direction, label: &str, frame: Frame) -> Result<Frame, GatewayError> {
        if !self.filter.allows(frame.id) {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            warn!(
                "CAN ID {} not in allow-list, blocked ({})",
                format_id(frame.id),
                label
            );
            return Err(GatewayError::Rejected(frame.id));
        }

        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        info!("OCPP -> CAN [{}]: {} -> {}", direction, label, frame);

        if let Some(bus) = &self.bus {
            bus.publish(frame.clone());
        }

        Ok(frame)
    }

    /// Forward an action/payload pair as a fresh CALL
    pub fn forward_action(
        &self,
        direction: Direction,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<Frame, GatewayError> {
        let call = Call {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload,
        };
        self.forward(direction, &call.into())
    }

    /// Decode a bus frame into an OCPP call for the CSMS side
    pub fn ingest(&self, frame: &Frame) -> Result<OcppMessage, GatewayError> {
        let (action, payload) = self.codec.decode(frame.id, &frame.data).map_err(|_| {
            warn!("Unknown CAN ID: {}", format_id(frame.id));
            GatewayError::Unrecognized(frame.id)
        })?;

        debug!("CAN -> OCPP: {} -> {}", frame, action);

        Ok(Call {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload,
        }
        .into())
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for ProtocolGateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}
