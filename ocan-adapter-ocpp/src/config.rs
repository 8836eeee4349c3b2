//! Configuration for the gateway, the relay and the virtual bus
//!
//! Plain structs with defaults; the node binary maps CLI flags onto them.

use std::collections::HashSet;
use std::net::SocketAddr;

use ocan_core::{bus, CanId};

use crate::can::AdmissionPolicy;
use crate::relay::AttackMode;

/// Protocol gateway configuration
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Admission policy at startup (disabled by default)
    pub admission: AdmissionPolicy,
}

impl GatewayConfig {
    /// Filtering on, allowing only the known identifiers
    pub fn secure() -> Self {
        Self {
            admission: AdmissionPolicy::known(),
        }
    }

    /// Filtering on with an explicit allow-list
    pub fn with_allowed(mut self, ids: impl IntoIterator<Item = CanId>) -> Self {
        self.admission = AdmissionPolicy::allowing(ids);
        self
    }

    pub fn allowed(&self) -> &HashSet<CanId> {
        &self.admission.allowed
    }
}

/// Interception relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address charge points connect to
    pub listen_addr: SocketAddr,

    /// Real CSMS base URL; the charge point's request path is appended
    pub upstream_url: String,

    pub attack: AttackMode,

    /// Subprotocol requested upstream when the charge point offers none
    pub default_subprotocol: String,

    /// Messages queued per direction before the receiving side is paused
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
            upstream_url: "ws://localhost:9000".to_string(),
            attack: AttackMode::None,
            default_subprotocol: "ocpp1.6".to_string(),
            channel_capacity: 64,
        }
    }
}

impl RelayConfig {
    pub fn new(listen_addr: SocketAddr, upstream_url: impl Into<String>) -> Self {
        Self {
            listen_addr,
            upstream_url: upstream_url.into(),
            ..Default::default()
        }
    }

    pub fn with_attack(mut self, attack: AttackMode) -> Self {
        self.attack = attack;
        self
    }

    pub fn with_subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.default_subprotocol = protocol.into();
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// UDP virtual bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bind_addr: SocketAddr,
    pub peers: Vec<SocketAddr>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], bus::DEFAULT_PORT)),
            peers: Vec::new(),
        }
    }
}

impl BusConfig {
    pub fn with_bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_peer(mut self, addr: SocketAddr) -> Self {
        self.peers.push(addr);
        self
    }
}
