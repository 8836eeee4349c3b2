//! Core types for the CAN side of the gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// CAN arbitration identifier
pub type CanId = u32;

/// Every frame on the bus carries exactly this many data bytes
pub const FRAME_LEN: usize = 8;

/// Size of a frame on the UDP virtual bus: identifier (4) + data (8)
pub const WIRE_LEN: usize = 4 + FRAME_LEN;

/// Identifiers used by the charge point and its charging-relay module
pub mod ids {
    use super::CanId;

    pub const BOOT_NOTIFICATION: CanId = 0x100;
    pub const REMOTE_START_TRANSACTION: CanId = 0x200;
    pub const REMOTE_STOP_TRANSACTION: CanId = 0x201;
    pub const SET_CHARGING_PROFILE: CanId = 0x210;
    pub const METER_VALUES: CanId = 0x300;
    pub const STATUS_NOTIFICATION: CanId = 0x301;

    /// Only ever emitted by compromised charge point firmware
    pub const MALICIOUS: CanId = 0x9FF;

    /// The declared normal traffic profile
    pub const KNOWN: [CanId; 6] = [
        BOOT_NOTIFICATION,
        REMOTE_START_TRANSACTION,
        REMOTE_STOP_TRANSACTION,
        SET_CHARGING_PROFILE,
        METER_VALUES,
        STATUS_NOTIFICATION,
    ];
}

/// Conventional partition of the identifier space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameClass {
    /// Sent toward the charging-relay module (0x2xx)
    Command,
    /// Reported by the charging-relay module (0x3xx)
    Telemetry,
    /// Charge point lifecycle (0x1xx)
    Lifecycle,
    Unassigned,
}

impl FrameClass {
    pub fn of(id: CanId) -> Self {
        match id {
            0x100..=0x1FF => FrameClass::Lifecycle,
            0x200..=0x2FF => FrameClass::Command,
            0x300..=0x3FF => FrameClass::Telemetry,
            _ => FrameClass::Unassigned,
        }
    }
}

impl fmt::Display for FrameClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameClass::Command => write!(f, "command"),
            FrameClass::Telemetry => write!(f, "telemetry"),
            FrameClass::Lifecycle => write!(f, "lifecycle"),
            FrameClass::Unassigned => write!(f, "unassigned"),
        }
    }
}

/// A single frame observed on (or destined for) the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub id: CanId,
    pub data: [u8; FRAME_LEN],
    pub observed_at: DateTime<Utc>,
}

impl Frame {
    /// Create a frame stamped with the current time
    pub fn new(id: CanId, data: [u8; FRAME_LEN]) -> Self {
        Self::at(id, data, Utc::now())
    }

    /// Create a frame with an explicit observation time
    pub fn at(id: CanId, data: [u8; FRAME_LEN], observed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            data,
            observed_at,
        }
    }

    pub fn class(&self) -> FrameClass {
        FrameClass::of(self.id)
    }

    /// Data bytes as lowercase hex
    pub fn hex(&self) -> String {
        self.data.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Encode for the UDP virtual bus: identifier (big-endian) followed by data
    pub fn to_wire(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[..4].copy_from_slice(&self.id.to_be_bytes());
        out[4..].copy_from_slice(&self.data);
        out
    }

    /// Decode a UDP virtual bus datagram, stamping it with the arrival time
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != WIRE_LEN {
            return None;
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[..4]);
        let mut data = [0u8; FRAME_LEN];
        data.copy_from_slice(&bytes[4..]);
        Some(Self::new(CanId::from_be_bytes(id), data))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", format_id(self.id), self.hex())
    }
}

/// Render an identifier the way candump does, e.g. `0x2A0`
pub fn format_id(id: CanId) -> String {
    format!("0x{:03X}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_encoding() {
        let frame = Frame::new(ids::SET_CHARGING_PROFILE, [1, 0, 0xA0, 0, 0, 0, 0, 0]);
        let wire = frame.to_wire();
        assert_eq!(&wire[..4], &[0x00, 0x00, 0x02, 0x10]);

        let parsed = Frame::from_wire(&wire).unwrap();
        assert_eq!(parsed.id, ids::SET_CHARGING_PROFILE);
        assert_eq!(parsed.data, frame.data);
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(Frame::from_wire(&[0, 0, 2]).is_none());
        assert!(Frame::from_wire(&[0u8; 13]).is_none());
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::new(ids::MALICIOUS, [0xFF; FRAME_LEN]);
        assert_eq!(frame.to_string(), "0x9FF#ffffffffffffffff");
        assert_eq!(format_id(0x42), "0x042");
    }

    #[test]
    fn test_frame_class() {
        assert_eq!(FrameClass::of(ids::REMOTE_START_TRANSACTION), FrameClass::Command);
        assert_eq!(FrameClass::of(ids::METER_VALUES), FrameClass::Telemetry);
        assert_eq!(FrameClass::of(ids::BOOT_NOTIFICATION), FrameClass::Lifecycle);
        assert_eq!(FrameClass::of(ids::MALICIOUS), FrameClass::Unassigned);
    }
}
