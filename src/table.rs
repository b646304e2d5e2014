//! The client-keyed lease table.
//!
//! Records move through Released -> Offered -> Assigned and back; a 1 Hz
//! tick evicts offers the client never followed up on and leases past
//! their end. The table also tracks DECLINEd addresses so the allocator
//! avoids them while the exclusion window lasts.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::message::DhcpMessage;

/// Lease identity: the client identifier option if the client sent one,
/// otherwise the hardware address. Plain byte equality and hashing, so two
/// clients presenting the same identifier bytes are the same client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(Vec<u8>);

impl ClientKey {
    pub fn from_message(message: &DhcpMessage) -> Self {
        match message.client_identifier() {
            Some(id) if !id.is_empty() => Self(id.to_vec()),
            _ => Self(message.hardware_address().to_vec()),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Released,
    Offered,
    Assigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub identifier: Vec<u8>,
    pub hardware_address: Vec<u8>,
    pub hostname: String,
    pub state: ClientState,
    /// 0.0.0.0 means no address is associated.
    pub ip_address: Ipv4Addr,
    pub offered_at: Option<DateTime<Utc>>,
    pub lease_start: Option<DateTime<Utc>>,
    /// Seconds; `u32::MAX` is the RFC 2131 infinite lease.
    pub lease_seconds: u32,
}

impl ClientRecord {
    pub const INFINITE_LEASE: u32 = u32::MAX;

    pub fn key(&self) -> ClientKey {
        ClientKey::from_bytes(&self.identifier)
    }

    /// `None` for infinite leases and records that were never assigned.
    pub fn lease_end(&self) -> Option<DateTime<Utc>> {
        if self.lease_seconds == Self::INFINITE_LEASE {
            return None;
        }
        self.lease_start
            .map(|start| start + TimeDelta::seconds(self.lease_seconds as i64))
    }
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    records: HashMap<ClientKey, ClientRecord>,
    declined: HashMap<Ipv4Addr, DateTime<Utc>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_or_replace(&mut self, record: ClientRecord) {
        self.records.insert(record.key(), record);
    }

    pub fn get(&self, key: &ClientKey) -> Option<&ClientRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &ClientKey) -> Option<&mut ClientRecord> {
        self.records.get_mut(key)
    }

    pub fn remove(&mut self, key: &ClientKey) -> bool {
        self.records.remove(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The persistence writer's view of the table.
    pub fn snapshot(&self) -> Vec<ClientRecord> {
        self.records.values().cloned().collect()
    }

    /// Whether any record currently owns `ip`. Released holders only count
    /// when `reuse_released` is false: the allocator's first pass prefers
    /// addresses no released client remembers.
    pub fn address_in_use(&self, ip: Ipv4Addr, reuse_released: bool) -> bool {
        self.records.values().any(|record| {
            record.ip_address == ip
                && (record.state != ClientState::Released || !reuse_released)
        })
    }

    /// Clears the address from a Released holder so it can be handed to a
    /// new client; the prior owner keeps its record with 0.0.0.0.
    pub fn reclaim_released(&mut self, ip: Ipv4Addr) {
        for record in self.records.values_mut() {
            if record.state == ClientState::Released && record.ip_address == ip {
                record.ip_address = Ipv4Addr::UNSPECIFIED;
            }
        }
    }

    pub fn exclude(&mut self, ip: Ipv4Addr, now: DateTime<Utc>) {
        self.declined.insert(ip, now);
    }

    pub fn is_excluded(&self, ip: Ipv4Addr, now: DateTime<Utc>, hold: TimeDelta) -> bool {
        self.declined
            .get(&ip)
            .is_some_and(|declined_at| now - *declined_at < hold)
    }

    /// Evicts expired offers and leases; returns the eviction count.
    /// Lapsed decline exclusions are purged on the same pass.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        offer_expiration: TimeDelta,
        decline_hold: TimeDelta,
    ) -> usize {
        let before = self.records.len();

        self.records.retain(|_, record| match record.state {
            ClientState::Offered => record
                .offered_at
                .is_none_or(|offered_at| now - offered_at <= offer_expiration),
            ClientState::Assigned => {
                record.lease_end().is_none_or(|end| now <= end)
            }
            ClientState::Released => true,
        });

        self.declined
            .retain(|_, declined_at| now - *declined_at < decline_hold);

        before - self.records.len()
    }
}
