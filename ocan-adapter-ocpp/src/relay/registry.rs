//! Bookkeeping for live relay sessions

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::direction::Direction;

/// One bridged charge point connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    /// Request path, which carries the charge point identity
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub to_csms: u64,
    pub to_charge_point: u64,
}

impl ConnectionInfo {
    pub fn relayed(&self) -> u64 {
        self.to_csms + self.to_charge_point
    }
}

/// Owned map of active sessions plus a relay-wide message counter
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    relayed: AtomicU64,
    connections: RwLock<HashMap<u64, ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, returning its id
    pub fn register(&self, peer: SocketAddr, path: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.write().insert(
            id,
            ConnectionInfo {
                id,
                peer,
                path: path.into(),
                started_at: Utc::now(),
                to_csms: 0,
                to_charge_point: 0,
            },
        );
        id
    }

    /// Count one message received on `direction`, returning the relay-wide sequence number
    pub fn record(&self, id: u64, direction: Direction) -> u64 {
        if let Some(info) = self.connections.write().get_mut(&id) {
            match direction {
                Direction::ChargePointToCsms => info.to_csms += 1,
                Direction::CsmsToChargePoint => info.to_charge_point += 1,
            }
        }
        self.relayed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn remove(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections.write().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<ConnectionInfo> {
        self.connections.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<_> = self.connections.read().values().cloned().collect();
        all.sort_by_key(|info| info.id);
        all
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages relayed over the lifetime of the registry
    pub fn relayed_total(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
}
