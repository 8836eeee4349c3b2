//! OCPP <-> CAN frame codec
//!
//! One [`TranslationRule`] per OCPP action that has a CAN representation.
//! All multi-byte fields are little-endian and unused trailing bytes are zero.
//!
//! | Action                 | CAN ID | Layout                                                  |
//! |------------------------|--------|---------------------------------------------------------|
//! | BootNotification       | 0x100  | chargePointId u8, modelLen u8, model ASCII (max 6)      |
//! | RemoteStartTransaction | 0x200  | chargePointId u8, connectorId u8, 0x01                  |
//! | RemoteStopTransaction  | 0x201  | transactionId u32, 0x00                                 |
//! | SetChargingProfile     | 0x210  | chargingProfileId u16, maxCurrent u16 (0.1 A)           |
//! | MeterValues            | 0x300  | connectorId u8, energy u32 (Wh), reserved u8, timestamp u16 |
//! | StatusNotification     | 0x301  | connectorId u8, status code u8                          |
//!
//! Values wider than their field are masked to the field width. This is
//! lossy on purpose: 7000.0 A encodes as 70000 & 0xFFFF and decodes as 446.4.

use ocan_core::{ids, CanId, FRAME_LEN};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Fixed-point scale of current values (0.1 A resolution)
const CURRENT_SCALE: f64 = 10.0;

/// Longest model name that fits in a BootNotification frame
const MODEL_MAX: usize = 6;

const START_CMD: u8 = 0x01;
const STOP_CMD: u8 = 0x00;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("no CAN translation for action {0}")]
    UnknownAction(String),

    #[error("no OCPP translation for CAN ID {0:#05X}")]
    UnknownIdentifier(CanId),

    #[error("{action}: field {field} has the wrong type")]
    InvalidField {
        action: &'static str,
        field: &'static str,
    },
}

type Fields = Map<String, Value>;
type EncodeFn = fn(&FieldReader<'_>) -> Result<[u8; FRAME_LEN], CodecError>;
type DecodeFn = fn(&[u8; FRAME_LEN]) -> Value;

/// Binds one OCPP action to one CAN identifier
pub struct TranslationRule {
    pub action: &'static str,
    pub id: CanId,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl TranslationRule {
    pub fn encode(&self, payload: &Value) -> Result<[u8; FRAME_LEN], CodecError> {
        let empty = Fields::new();
        let fields = match payload {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return Err(CodecError::InvalidField {
                    action: self.action,
                    field: "payload",
                })
            }
        };
        (self.encode)(&FieldReader {
            action: self.action,
            fields,
        })
    }

    pub fn decode(&self, data: &[u8; FRAME_LEN]) -> Value {
        (self.decode)(data)
    }
}

/// The authoritative translation table
pub static RULES: [TranslationRule; 6] = [
    TranslationRule {
        action: "BootNotification",
        id: ids::BOOT_NOTIFICATION,
        encode: encode_boot_notification,
        decode: decode_boot_notification,
    },
    TranslationRule {
        action: "RemoteStartTransaction",
        id: ids::REMOTE_START_TRANSACTION,
        encode: encode_remote_start,
        decode: decode_remote_start,
    },
    TranslationRule {
        action: "RemoteStopTransaction",
        id: ids::REMOTE_STOP_TRANSACTION,
        encode: encode_remote_stop,
        decode: decode_remote_stop,
    },
    TranslationRule {
        action: "SetChargingProfile",
        id: ids::SET_CHARGING_PROFILE,
        encode: encode_charging_profile,
        decode: decode_charging_profile,
    },
    TranslationRule {
        action: "MeterValues",
        id: ids::METER_VALUES,
        encode: encode_meter_values,
        decode: decode_meter_values,
    },
    TranslationRule {
        action: "StatusNotification",
        id: ids::STATUS_NOTIFICATION,
        encode: encode_status_notification,
        decode: decode_status_notification,
    },
];

/// Stateless encoder/decoder over [`RULES`]
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn rule_for_action(action: &str) -> Option<&'static TranslationRule> {
        RULES.iter().find(|rule| rule.action == action)
    }

    pub fn rule_for_id(id: CanId) -> Option<&'static TranslationRule> {
        RULES.iter().find(|rule| rule.id == id)
    }

    /// Every identifier the codec can produce
    pub fn known_ids() -> impl Iterator<Item = CanId> {
        RULES.iter().map(|rule| rule.id)
    }

    pub fn encode(&self, action: &str, payload: &Value) -> Result<(CanId, [u8; FRAME_LEN]), CodecError> {
        let rule = Self::rule_for_action(action)
            .ok_or_else(|| CodecError::UnknownAction(action.to_string()))?;
        Ok((rule.id, rule.encode(payload)?))
    }

    /// Decode a frame into its action name and payload
    pub fn decode(&self, id: CanId, data: &[u8; FRAME_LEN]) -> Result<(&'static str, Value), CodecError> {
        let rule = Self::rule_for_id(id).ok_or(CodecError::UnknownIdentifier(id))?;
        Ok((rule.action, rule.decode(data)))
    }
}

/// Connector status names and their wire codes
const STATUS_CODES: [(&str, u8); 9] = [
    ("Available", 0x01),
    ("Preparing", 0x02),
    ("Charging", 0x03),
    ("SuspendedEVSE", 0x04),
    ("SuspendedEV", 0x05),
    ("Finishing", 0x06),
    ("Reserved", 0x07),
    ("Unavailable", 0x08),
    ("Faulted", 0x09),
];

pub fn status_code(name: &str) -> u8 {
    STATUS_CODES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, code)| *code)
        .unwrap_or(0x00)
}

pub fn status_name(code: u8) -> &'static str {
    STATUS_CODES
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(name, _)| *name)
        .unwrap_or("Unknown")
}

/// Typed access to payload fields; absent or null fields take the default
struct FieldReader<'a> {
    action: &'static str,
    fields: &'a Fields,
}

impl<'a> FieldReader<'a> {
    fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }

    fn invalid(&self, field: &'static str) -> CodecError {
        CodecError::InvalidField {
            action: self.action,
            field,
        }
    }

    /// Integer field, two's complement bits kept so masking matches the wire width
    fn uint(&self, field: &'static str, default: u64) -> Result<u64, CodecError> {
        match self.get(field) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .or_else(|| v.as_i64().map(|i| i as u64))
                .or_else(|| v.as_f64().map(|f| f.trunc() as i64 as u64))
                .ok_or_else(|| self.invalid(field)),
        }
    }

    fn float(&self, field: &'static str, default: f64) -> Result<f64, CodecError> {
        match self.get(field) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| self.invalid(field)),
        }
    }

    fn text(&self, field: &'static str, default: &'a str) -> Result<&'a str, CodecError> {
        match self.fields.get(field).filter(|v| !v.is_null()) {
            None => Ok(default),
            Some(v) => v.as_str().ok_or_else(|| self.invalid(field)),
        }
    }

    fn u8(&self, field: &'static str, default: u64) -> Result<u8, CodecError> {
        Ok((self.uint(field, default)? & 0xFF) as u8)
    }

    fn u16(&self, field: &'static str, default: u64) -> Result<u16, CodecError> {
        Ok((self.uint(field, default)? & 0xFFFF) as u16)
    }

    fn u32(&self, field: &'static str, default: u64) -> Result<u32, CodecError> {
        Ok((self.uint(field, default)? & 0xFFFF_FFFF) as u32)
    }
}

fn encode_boot_notification(p: &FieldReader<'_>) -> Result<[u8; FRAME_LEN], CodecError> {
    let mut out = [0u8; FRAME_LEN];
    out[0] = p.u8("chargePointId", 1)?;

    let model: Vec<u8> = p
        .text("model", "TEST")?
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .take(MODEL_MAX)
        .collect();
    out[1] = model.len() as u8;
    out[2..2 + model.len()].copy_from_slice(&model);
    Ok(out)
}

fn decode_boot_notification(data: &[u8; FRAME_LEN]) -> Value {
    let len = (data[1] as usize).min(MODEL_MAX);
    let model = String::from_utf8_lossy(&data[2..2 + len]).into_owned();
    json!({
        "chargePointId": data[0],
        "model": model,
    })
}

fn encode_remote_start(p: &FieldReader<'_>) -> Result<[u8; FRAME_LEN], CodecError> {
    let mut out = [0u8; FRAME_LEN];
    out[0] = p.u8("chargePointId", 1)?;
    out[1] = p.u8("connectorId", 1)?;
    out[2] = START_CMD;
    Ok(out)
}

fn decode_remote_start(data: &[u8; FRAME_LEN]) -> Value {
    json!({
        "chargePointId": data[0],
        "connectorId": data[1],
    })
}

fn encode_remote_stop(p: &FieldReader<'_>) -> Result<[u8; FRAME_LEN], CodecError> {
    let mut out = [0u8; FRAME_LEN];
    out[..4].copy_from_slice(&p.u32("transactionId", 0)?.to_le_bytes());
    out[4] = STOP_CMD;
    Ok(out)
}

fn decode_remote_stop(data: &[u8; FRAME_LEN]) -> Value {
    json!({
        "transactionId": u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
    })
}

fn encode_charging_profile(p: &FieldReader<'_>) -> Result<[u8; FRAME_LEN], CodecError> {
    let mut out = [0u8; FRAME_LEN];
    let profile_id = p.u16("chargingProfileId", 1)?;
    let current = p.float("maxCurrent", 16.0)?;
    let raw = ((current * CURRENT_SCALE).round() as i64 & 0xFFFF) as u16;

    out[..2].copy_from_slice(&profile_id.to_le_bytes());
    out[2..4].copy_from_slice(&raw.to_le_bytes());
    Ok(out)
}

fn decode_charging_profile(data: &[u8; FRAME_LEN]) -> Value {
    let raw = u16::from_le_bytes([data[2], data[3]]);
    json!({
        "chargingProfileId": u16::from_le_bytes([data[0], data[1]]),
        "maxCurrent": raw as f64 / CURRENT_SCALE,
    })
}

fn encode_meter_values(p: &FieldReader<'_>) -> Result<[u8; FRAME_LEN], CodecError> {
    let mut out = [0u8; FRAME_LEN];
    out[0] = p.u8("connectorId", 1)?;
    out[1..5].copy_from_slice(&p.u32("energy", 0)?.to_le_bytes());
    // out[5] reserved
    out[6..8].copy_from_slice(&p.u16("timestamp", 0)?.to_le_bytes());
    Ok(out)
}

fn decode_meter_values(data: &[u8; FRAME_LEN]) -> Value {
    json!({
        "connectorId": data[0],
        "energy": u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
        "timestamp": u16::from_le_bytes([data[6], data[7]]),
    })
}

fn encode_status_notification(p: &FieldReader<'_>) -> Result<[u8; FRAME_LEN], CodecError> {
    let mut out = [0u8; FRAME_LEN];
    out[0] = p.u8("connectorId", 1)?;
    out[1] = status_code(p.text("status", "Available")?);
    Ok(out)
}

fn decode_status_notification(data: &[u8; FRAME_LEN]) -> Value {
    json!({
        "connectorId": data[0],
        "status": status_name(data[1]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(action: &str, payload: Value) -> Value {
        let codec = FrameCodec;
        let (id, data) = codec.encode(action, &payload).unwrap();
        let (decoded_action, decoded) = codec.decode(id, &data).unwrap();
        assert_eq!(decoded_action, action);
        decoded
    }

    #[test]
    fn test_round_trip_every_rule() {
        let cases = [
            ("BootNotification", json!({"chargePointId": 7, "model": "EK3"})),
            ("RemoteStartTransaction", json!({"chargePointId": 2, "connectorId": 3})),
            ("RemoteStopTransaction", json!({"transactionId": 123456})),
            ("SetChargingProfile", json!({"chargingProfileId": 513, "maxCurrent": 32.5})),
            ("MeterValues", json!({"connectorId": 1, "energy": 4_000_000, "timestamp": 65000})),
            ("StatusNotification", json!({"connectorId": 2, "status": "Charging"})),
        ];

        for (action, payload) in cases {
            assert_eq!(round_trip(action, payload.clone()), payload, "{}", action);
        }
    }

    #[test]
    fn test_remote_start_layout() {
        let (id, data) = FrameCodec
            .encode("RemoteStartTransaction", &json!({"chargePointId": 1, "connectorId": 2}))
            .unwrap();
        assert_eq!(id, 0x200);
        assert_eq!(data, [1, 2, 0x01, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_remote_stop_layout() {
        let (_, data) = FrameCodec
            .encode("RemoteStopTransaction", &json!({"transactionId": 0x0102_0304}))
            .unwrap();
        assert_eq!(data, [0x04, 0x03, 0x02, 0x01, 0x00, 0, 0, 0]);
    }

    #[test]
    fn test_current_fixed_point() {
        let decoded = round_trip("SetChargingProfile", json!({"maxCurrent": 1665.0}));
        assert_eq!(decoded["maxCurrent"], json!(1665.0));

        let (_, data) = FrameCodec
            .encode("SetChargingProfile", &json!({"maxCurrent": 1665.0}))
            .unwrap();
        assert_eq!(u16::from_le_bytes([data[2], data[3]]), 16650);
    }

    #[test]
    fn test_current_overflow_is_masked() {
        let decoded = round_trip("SetChargingProfile", json!({"maxCurrent": 7000.0}));
        // 70000 & 0xFFFF = 4464
        assert_eq!(decoded["maxCurrent"], json!(446.4));
    }

    #[test]
    fn test_current_rounds_to_tenth() {
        let decoded = round_trip("SetChargingProfile", json!({"maxCurrent": 2.3}));
        assert_eq!(decoded["maxCurrent"], json!(2.3));
    }

    #[test]
    fn test_defaults_for_absent_fields() {
        let decoded = round_trip("SetChargingProfile", json!({}));
        assert_eq!(decoded, json!({"chargingProfileId": 1, "maxCurrent": 16.0}));

        let decoded = round_trip("StatusNotification", Value::Null);
        assert_eq!(decoded, json!({"connectorId": 1, "status": "Available"}));

        let decoded = round_trip("BootNotification", json!({}));
        assert_eq!(decoded, json!({"chargePointId": 1, "model": "TEST"}));
    }

    #[test]
    fn test_integer_fields_are_masked() {
        let decoded = round_trip("MeterValues", json!({"connectorId": 257, "timestamp": 70000}));
        assert_eq!(decoded["connectorId"], json!(1));
        assert_eq!(decoded["timestamp"], json!(70000 & 0xFFFF));
    }

    #[test]
    fn test_model_truncated_and_ascii() {
        let decoded = round_trip("BootNotification", json!({"model": "EK3-OCPP-LONG"}));
        assert_eq!(decoded["model"], "EK3-OC");

        let decoded = round_trip("BootNotification", json!({"model": "Şarj"}));
        assert_eq!(decoded["model"], "?arj");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code("Faulted"), 9);
        assert_eq!(status_code("Exploded"), 0);
        assert_eq!(status_name(0x03), "Charging");
        assert_eq!(status_name(0x42), "Unknown");

        let decoded = round_trip("StatusNotification", json!({"status": "Exploded"}));
        assert_eq!(decoded["status"], "Unknown");
    }

    #[test]
    fn test_unknown_action_and_identifier() {
        assert_eq!(
            FrameCodec.encode("Heartbeat", &json!({})),
            Err(CodecError::UnknownAction("Heartbeat".into()))
        );
        assert_eq!(
            FrameCodec.decode(ids::MALICIOUS, &[0xFF; 8]),
            Err(CodecError::UnknownIdentifier(ids::MALICIOUS))
        );
    }

    #[test]
    fn test_wrong_field_type() {
        assert_eq!(
            FrameCodec.encode("StatusNotification", &json!({"status": 3})),
            Err(CodecError::InvalidField {
                action: "StatusNotification",
                field: "status",
            })
        );
        assert!(FrameCodec.encode("MeterValues", &json!([1, 2])).is_err());
    }

    #[test]
    fn test_known_ids_match_normal_profile() {
        let mut known: Vec<_> = FrameCodec::known_ids().collect();
        known.sort();
        let mut expected = ids::KNOWN.to_vec();
        expected.sort();
        assert_eq!(known, expected);
    }
}
