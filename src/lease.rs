//! Client lease records and the per-instance lease table.
//!
//! Every client the server has heard from is tracked as a [`Client`] keyed
//! by its identifier bytes. A client moves through three states:
//!
//! - `Released`: known, but holds no claim on an address (its cached
//!   address may be reclaimed by anyone)
//! - `Offered`: an address was offered and the server awaits a REQUEST
//! - `Assigned`: the client holds a lease
//!
//! # Thread Safety
//!
//! [`LeaseTable`] serializes every read-for-decision and every write behind
//! a single [`Mutex`]. Callers never see the lock; they pass a closure to
//! [`LeaseTable::transact`], which runs it with exclusive access.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::hex::bytes_to_hex_string;
use crate::packet::DhcpPacket;

/// Lease duration meaning "never expires".
///
/// This is also the value carried in Option 51 for an infinite lease.
pub const INFINITE_LEASE: u32 = u32::MAX;

/// Lease state of a single client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Released,
    Offered,
    Assigned,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Released => write!(f, "released"),
            Self::Offered => write!(f, "offered"),
            Self::Assigned => write!(f, "assigned"),
        }
    }
}

/// A lease record.
///
/// Equality and hashing consider only [`identifier`](Self::identifier): two
/// records with the same identifier are the same client.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client identifier option value, or the hardware address.
    pub identifier: Vec<u8>,

    pub hardware_address: Vec<u8>,

    /// Host name from Option 12, empty if the client never sent one.
    pub host_name: String,

    pub state: ClientState,

    /// Held or cached address. `UNSPECIFIED` means none.
    pub ip_address: Ipv4Addr,

    /// When the current offer was made.
    pub offered_time: DateTime<Utc>,

    /// When the current lease started (or was last renewed).
    pub lease_start_time: DateTime<Utc>,

    /// Lease length in seconds, [`INFINITE_LEASE`] for no expiry.
    pub lease_duration: u32,
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for Client {}

impl Hash for Client {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl Client {
    /// Creates a released client with no address from a request.
    pub fn from_packet(packet: &DhcpPacket) -> Self {
        Self {
            identifier: packet.client_id(),
            hardware_address: packet.chaddr.clone(),
            host_name: packet.host_name().unwrap_or_default().to_string(),
            state: ClientState::Released,
            ip_address: Ipv4Addr::UNSPECIFIED,
            offered_time: DateTime::<Utc>::MIN_UTC,
            lease_start_time: DateTime::<Utc>::MIN_UTC,
            lease_duration: 0,
        }
    }

    pub fn has_address(&self) -> bool {
        !self.ip_address.is_unspecified()
    }

    /// Hex form of the identifier, for logs and the lease file.
    pub fn identifier_hex(&self) -> String {
        bytes_to_hex_string(&self.identifier, ":")
    }

    pub fn hardware_address_hex(&self) -> String {
        bytes_to_hex_string(&self.hardware_address, ":")
    }

    /// Returns when the lease ends; the maximum timestamp for infinite leases.
    pub fn lease_end_time(&self) -> DateTime<Utc> {
        if self.lease_duration == INFINITE_LEASE {
            return DateTime::<Utc>::MAX_UTC;
        }
        self.lease_start_time
            .checked_add_signed(TimeDelta::seconds(self.lease_duration as i64))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns true if this record should be removed by the sweep at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, offer_expiration: Duration) -> bool {
        match self.state {
            ClientState::Offered => {
                let age = now.signed_duration_since(self.offered_time);
                age.to_std().is_ok_and(|age| age > offer_expiration)
            }
            ClientState::Assigned => now > self.lease_end_time(),
            ClientState::Released => false,
        }
    }

    /// Moves the client to `Offered` for `ip`.
    pub fn offer(&mut self, ip: Ipv4Addr, now: DateTime<Utc>) {
        self.state = ClientState::Offered;
        self.ip_address = ip;
        self.offered_time = now;
    }

    /// Moves the client to `Assigned` for `ip`, starting a new lease term.
    pub fn assign(&mut self, ip: Ipv4Addr, lease_duration: u32, now: DateTime<Utc>) {
        self.state = ClientState::Assigned;
        self.ip_address = ip;
        self.lease_start_time = now;
        self.lease_duration = lease_duration;
    }

    /// Refreshes identity fields that may change between requests.
    pub fn refresh_from(&mut self, packet: &DhcpPacket) {
        self.hardware_address = packet.chaddr.clone();
        if let Some(host_name) = packet.host_name() {
            self.host_name = host_name.to_string();
        }
    }
}

/// The set of known clients, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct Clients {
    map: HashMap<Vec<u8>, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &[u8]) -> Option<&Client> {
        self.map.get(identifier)
    }

    pub fn get_mut(&mut self, identifier: &[u8]) -> Option<&mut Client> {
        self.map.get_mut(identifier)
    }

    /// Inserts or replaces the record with the same identifier.
    pub fn insert(&mut self, client: Client) -> Option<Client> {
        self.map.insert(client.identifier.clone(), client)
    }

    pub fn remove(&mut self, identifier: &[u8]) -> Option<Client> {
        self.map.remove(identifier)
    }

    /// Returns the client currently holding or caching `ip`.
    pub fn holder_of(&self, ip: Ipv4Addr) -> Option<&Client> {
        self.map
            .values()
            .find(|client| client.has_address() && client.ip_address == ip)
    }

    /// Returns true if `ip` is held by an `Offered` or `Assigned` client, or
    /// by any client at all when `reclaim_released` is false.
    pub fn is_taken(&self, ip: Ipv4Addr, reclaim_released: bool) -> bool {
        self.holder_of(ip).is_some_and(|holder| {
            !reclaim_released || holder.state != ClientState::Released
        })
    }

    /// Clears the cached address of a `Released` client holding `ip`.
    pub fn reclaim(&mut self, ip: Ipv4Addr) {
        for client in self.map.values_mut() {
            if client.state == ClientState::Released && client.ip_address == ip {
                client.ip_address = Ipv4Addr::UNSPECIFIED;
            }
        }
    }

    /// Removes every client for which `expired` returns true.
    ///
    /// Returns the removed records.
    pub fn remove_where(&mut self, mut expired: impl FnMut(&Client) -> bool) -> Vec<Client> {
        let doomed: Vec<Vec<u8>> = self
            .map
            .values()
            .filter(|client| expired(client))
            .map(|client| client.identifier.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|identifier| self.map.remove(identifier))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl FromIterator<Client> for Clients {
    fn from_iter<I: IntoIterator<Item = Client>>(iter: I) -> Self {
        let mut clients = Self::new();
        for client in iter {
            clients.insert(client);
        }
        clients
    }
}

/// Mutation-serialized lease table for one server instance.
#[derive(Debug, Default)]
pub struct LeaseTable {
    clients: Mutex<Clients>,
}

impl LeaseTable {
    pub fn new(clients: Clients) -> Self {
        Self {
            clients: Mutex::new(clients),
        }
    }

    /// Runs `operation` with exclusive access to the table.
    ///
    /// All decisions that read the table and all mutations go through here,
    /// so transitions are linearizable.
    pub async fn transact<R>(&self, operation: impl FnOnce(&mut Clients) -> R) -> R {
        let mut clients = self.clients.lock().await;
        operation(&mut clients)
    }

    /// Returns a copy of every record, sorted by address then identifier.
    pub async fn snapshot(&self) -> Vec<Client> {
        let clients = self.clients.lock().await;
        let mut records: Vec<Client> = clients.iter().cloned().collect();
        records.sort_by(|a, b| {
            u32::from(a.ip_address)
                .cmp(&u32::from(b.ip_address))
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        records
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}
