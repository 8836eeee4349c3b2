//! OCPP-J message framing
//!
//! OCPP runs JSON arrays over WebSocket:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Actions are carried as plain strings so that any OCPP 1.6 or 2.0.1
//! action can pass through the relay untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Payload as a JSON object, if it is one
    pub fn fields(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(OcppError::InvalidFormat)?;

        let message_id = |array: &[Value]| -> Result<String, OcppError> {
            array[1]
                .as_str()
                .map(str::to_string)
                .ok_or(OcppError::InvalidFormat)
        };

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let action = array[2]
                    .as_str()
                    .ok_or(OcppError::InvalidFormat)?
                    .to_string();

                Ok(OcppMessage::Call(Call {
                    message_id: message_id(&array)?,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id(&array)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id: message_id(&array)?,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Parse from a WebSocket text frame
    pub fn parse_text(text: &str) -> Result<Self, OcppError> {
        Self::parse(text.as_bytes())
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Action name; only CALL messages carry one
    pub fn action(&self) -> Option<&str> {
        match self {
            OcppMessage::Call(c) => Some(&c.action),
            _ => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppMessage::Call(_) => MessageType::Call,
            OcppMessage::CallResult(_) => MessageType::CallResult,
            OcppMessage::CallError(_) => MessageType::CallError,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }

    /// Serialize for a WebSocket text frame
    pub fn to_text(&self) -> Result<String, OcppError> {
        let bytes = self.to_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl From<Call> for OcppMessage {
    fn from(call: Call) -> Self {
        OcppMessage::Call(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_serialization() {
        let call = Call::new("Heartbeat", json!({})).unwrap();
        let text = String::from_utf8(call.to_bytes().unwrap()).unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "RemoteStartTransaction", {"connectorId": 1, "idTag": "TAG"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        assert_eq!(msg.action(), Some("RemoteStartTransaction"));
        assert_eq!(msg.message_id(), "msg-123");
        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.fields().unwrap()["idTag"], "TAG");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_any_action_name_is_carried() {
        let json = r#"[2, "m1", "VendorSpecificThing", {}]"#;
        let msg = OcppMessage::parse_text(json).unwrap();
        assert_eq!(msg.action(), Some("VendorSpecificThing"));
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        assert_eq!(msg.message_type(), MessageType::CallResult);
        assert_eq!(msg.action(), None);
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        match OcppMessage::parse(json.as_bytes()).unwrap() {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_unknown_error_code_is_generic() {
        let json = r#"[4, "m", "SomethingOdd", "", {}]"#;
        match OcppMessage::parse(json.as_bytes()).unwrap() {
            OcppMessage::CallError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            OcppMessage::parse(b"not json"),
            Err(OcppError::JsonError(_))
        ));
        assert!(matches!(OcppMessage::parse(b"[]"), Err(OcppError::InvalidFormat)));
        assert!(matches!(
            OcppMessage::parse(br#"[2, "id", "Heartbeat"]"#),
            Err(OcppError::InvalidFormat)
        ));
        assert!(matches!(
            OcppMessage::parse(br#"[9, "id", {}]"#),
            Err(OcppError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_text_round_trip() {
        let original: OcppMessage = Call {
            message_id: "abc".into(),
            action: "RemoteStopTransaction".into(),
            payload: json!({"transactionId": 42}),
        }
        .into();
        assert_eq!(original.message_type(), MessageType::Call);
        let parsed = OcppMessage::parse_text(&original.to_text().unwrap()).unwrap();
        assert_eq!(parsed, original);
    }
}
