//! CAN side of the gateway
//!
//! - `codec`: OCPP action <-> 8-byte frame translation rules
//! - `filter`: allow-list admission of outbound identifiers

pub mod codec;
pub mod filter;

pub use codec::{CodecError, FrameCodec, TranslationRule, RULES};
pub use filter::{AdmissionFilter, AdmissionPolicy};
