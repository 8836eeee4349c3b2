//! Message flow direction between charge point and CSMS

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Charge point (downstream) to CSMS (upstream)
    #[serde(rename = "CP->CSMS")]
    ChargePointToCsms,
    /// CSMS (upstream) to charge point (downstream)
    #[serde(rename = "CSMS->CP")]
    CsmsToChargePoint,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ChargePointToCsms => Direction::CsmsToChargePoint,
            Direction::CsmsToChargePoint => Direction::ChargePointToCsms,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ChargePointToCsms => write!(f, "CP->CSMS"),
            Direction::CsmsToChargePoint => write!(f, "CSMS->CP"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CP->CSMS" | "cp-to-csms" | "upstream" => Ok(Direction::ChargePointToCsms),
            "CSMS->CP" | "csms-to-cp" | "downstream" => Ok(Direction::CsmsToChargePoint),
            _ => Err(format!("unknown direction: {}", s)),
        }
    }
}
