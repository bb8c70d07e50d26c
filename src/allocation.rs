//! Address allocation for DISCOVER handling.
//!
//! The [`Allocator`] picks an address for a client in this order:
//!
//! 1. A matching [`Reservation`] (by MAC prefix or host-name prefix) hands out
//!    the first free address of its sub-range, or its first address
//!    unconditionally when the reservation is `preempt`
//! 2. The client's requested address (Option 50) if it is free
//! 3. The first pool address held by no client at all
//! 4. The first pool address held by no active client, reclaiming it from a
//!    released one
//!
//! Pool and reservation bounds are re-based onto the server's own subnet
//! before use, so only their host bits matter.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::hex::hex_string_to_bytes;
use crate::lease::Clients;
use crate::packet::DhcpPacket;

/// Replaces the network bits of `configured` with those of `server`.
pub fn sanitize_host(server: Ipv4Addr, subnet_mask: Ipv4Addr, configured: Ipv4Addr) -> Ipv4Addr {
    let mask = u32::from(subnet_mask);
    Ipv4Addr::from((u32::from(server) & mask) | (u32::from(configured) & !mask))
}

/// An inclusive range of IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl AddressRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= u32::from(self.start) && ip <= u32::from(self.end)
    }

    /// Iterates the range in ascending order. Empty if `start > end`.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }

    /// Number of addresses in the range.
    pub fn len(&self) -> usize {
        let start = u32::from(self.start);
        let end = u32::from(self.end);
        if end < start {
            0
        } else {
            (end - start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-bases both bounds onto the server's subnet.
    pub fn sanitize(&self, server: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        Self {
            start: sanitize_host(server, subnet_mask, self.start),
            end: sanitize_host(server, subnet_mask, self.end),
        }
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// How a reservation recognizes its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationMatch {
    /// The first `bits` bits of the hardware address equal those of `prefix`.
    Mac { prefix: Vec<u8>, bits: u32 },
    /// The client host name starts with this prefix, ignoring case.
    HostName(String),
}

impl ReservationMatch {
    /// Parses `"aa:bb:cc"` or `"aa:bb:cc/20"`.
    ///
    /// Without an explicit length the whole prefix must match.
    pub fn parse_mac(text: &str) -> Result<Self> {
        let (digits, bits) = match text.split_once('/') {
            Some((digits, bits)) => {
                let bits = bits.trim().parse::<u32>().map_err(|_| {
                    Error::InvalidConfig(format!("Invalid MAC prefix length in '{}'", text))
                })?;
                (digits, Some(bits))
            }
            None => (text, None),
        };

        let prefix = hex_string_to_bytes(digits);
        if prefix.is_empty() {
            return Err(Error::InvalidConfig(format!("Invalid MAC prefix '{}'", text)));
        }

        let available = prefix.len() as u32 * 8;
        let bits = bits.unwrap_or(available);
        if bits > available {
            return Err(Error::InvalidConfig(format!(
                "MAC prefix '{}' has only {} bits, {} requested",
                text, available, bits
            )));
        }

        Ok(Self::Mac { prefix, bits })
    }

    pub fn matches(&self, packet: &DhcpPacket) -> bool {
        match self {
            Self::Mac { prefix, bits } => mac_prefix_matches(&packet.chaddr, prefix, *bits),
            Self::HostName(prefix) => packet.host_name().is_some_and(|name| {
                name.to_lowercase().starts_with(&prefix.to_lowercase())
            }),
        }
    }
}

fn mac_prefix_matches(address: &[u8], prefix: &[u8], bits: u32) -> bool {
    let full_bytes = (bits / 8) as usize;
    let remaining = bits % 8;
    let needed = full_bytes + usize::from(remaining > 0);

    if address.len() < needed {
        return false;
    }
    if address[..full_bytes] != prefix[..full_bytes] {
        return false;
    }
    if remaining > 0 {
        let mask = 0xffu8 << (8 - remaining);
        return address[full_bytes] & mask == prefix[full_bytes] & mask;
    }
    true
}

/// A rule tying matching clients to a dedicated address sub-range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub matcher: ReservationMatch,
    pub range: AddressRange,
    /// Always hand out `range.start`, even if another client holds it.
    pub preempt: bool,
}

/// Chooses addresses from the pool and reservations of one server instance.
#[derive(Debug, Clone)]
pub struct Allocator {
    server_address: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    pool: AddressRange,
    reservations: Vec<Reservation>,
}

impl Allocator {
    /// Creates an allocator, re-basing the pool and reservation ranges onto
    /// the server's subnet.
    pub fn new(
        server_address: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        pool: AddressRange,
        reservations: Vec<Reservation>,
    ) -> Self {
        let reservations = reservations
            .into_iter()
            .map(|reservation| Reservation {
                range: reservation.range.sanitize(server_address, subnet_mask),
                ..reservation
            })
            .collect();

        Self {
            server_address,
            subnet_mask,
            pool: pool.sanitize(server_address, subnet_mask),
            reservations,
        }
    }

    pub fn pool(&self) -> AddressRange {
        self.pool
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Returns true if `ip` lies in the pool or any reservation range.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.pool.contains(ip) || self.reservations.iter().any(|r| r.range.contains(ip))
    }

    pub fn in_subnet(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(ip) & mask == u32::from(self.server_address) & mask
    }

    /// Returns true if `ip` is a host address of the subnet other than the
    /// server's own.
    ///
    /// The network and broadcast addresses are excluded unless the mask
    /// leaves fewer than two host bits (RFC 3021).
    pub fn is_assignable(&self, ip: Ipv4Addr) -> bool {
        if !self.in_subnet(ip) || ip == self.server_address {
            return false;
        }
        let host_mask = !u32::from(self.subnet_mask);
        let host = u32::from(ip) & host_mask;
        host_mask <= 1 || (host != 0 && host != host_mask)
    }

    /// Picks an address for the client that sent `packet`.
    ///
    /// Returns `None` when nothing is available; the caller must not offer.
    /// Addresses taken from released clients are cleared from their records.
    pub fn allocate(&self, clients: &mut Clients, packet: &DhcpPacket) -> Option<Ipv4Addr> {
        if let Some(reservation) = self.reservations.iter().find(|r| r.matcher.matches(packet)) {
            if reservation.preempt {
                debug!("Preempting reserved address {}", reservation.range.start);
                return Some(reservation.range.start);
            }
            return self.scan(clients, reservation.range, true);
        }

        if let Some(requested) = packet.requested_ip()
            && self.is_assignable(requested)
            && !clients.is_taken(requested, true)
        {
            clients.reclaim(requested);
            return Some(requested);
        }

        self.scan(clients, self.pool, false)
            .or_else(|| self.scan(clients, self.pool, true))
    }

    fn scan(
        &self,
        clients: &mut Clients,
        range: AddressRange,
        reclaim_released: bool,
    ) -> Option<Ipv4Addr> {
        let ip = range
            .iter()
            .filter(|ip| self.is_assignable(*ip))
            .find(|ip| !clients.is_taken(*ip, reclaim_released))?;
        if reclaim_released {
            clients.reclaim(ip);
        }
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::lease::{Client, ClientState};
    use crate::options::{DhcpOption, DhcpString};

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    fn allocator(reservations: Vec<Reservation>) -> Allocator {
        Allocator::new(
            SERVER,
            MASK,
            AddressRange::new(Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(192, 168, 1, 22)),
            reservations,
        )
    }

    fn request(mac: &[u8], options: Vec<DhcpOption>) -> DhcpPacket {
        DhcpPacket {
            chaddr: mac.to_vec(),
            options,
            ..Default::default()
        }
    }

    fn holder(id: u8, ip: Ipv4Addr, state: ClientState) -> Client {
        Client {
            identifier: vec![id],
            hardware_address: vec![id],
            host_name: String::new(),
            state,
            ip_address: ip,
            offered_time: Utc::now(),
            lease_start_time: Utc::now(),
            lease_duration: 60,
        }
    }

    #[test]
    fn test_sanitize_host() {
        assert_eq!(
            sanitize_host(SERVER, MASK, Ipv4Addr::new(10, 0, 0, 50)),
            Ipv4Addr::new(192, 168, 1, 50)
        );
        let range = AddressRange::new(Ipv4Addr::new(172, 16, 9, 1), Ipv4Addr::new(172, 16, 9, 5))
            .sanitize(SERVER, MASK);
        assert_eq!(range.start, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(range.end, Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(range.len(), 5);
    }

    #[test]
    fn test_pool_allocation_order() {
        let allocator = allocator(vec![]);
        let mut clients = Clients::new();

        let ip = allocator.allocate(&mut clients, &request(&[1, 2, 3, 4, 5], vec![]));
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 1, 20)));

        clients.insert(holder(1, Ipv4Addr::new(192, 168, 1, 20), ClientState::Offered));
        let ip = allocator.allocate(&mut clients, &request(&[9], vec![]));
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 1, 21)));
    }

    #[test]
    fn test_strict_scan_before_reclaim() {
        let allocator = allocator(vec![]);
        let mut clients = Clients::new();
        clients.insert(holder(1, Ipv4Addr::new(192, 168, 1, 20), ClientState::Released));

        let ip = allocator.allocate(&mut clients, &request(&[9], vec![]));
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 1, 21)));
        assert!(clients.get(&[1]).unwrap().has_address());
    }

    #[test]
    fn test_reclaims_released_when_pool_full() {
        let allocator = allocator(vec![]);
        let mut clients = Clients::new();
        clients.insert(holder(1, Ipv4Addr::new(192, 168, 1, 20), ClientState::Assigned));
        clients.insert(holder(2, Ipv4Addr::new(192, 168, 1, 21), ClientState::Released));
        clients.insert(holder(3, Ipv4Addr::new(192, 168, 1, 22), ClientState::Offered));

        let ip = allocator.allocate(&mut clients, &request(&[9], vec![]));
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 1, 21)));
        assert!(!clients.get(&[2]).unwrap().has_address());
    }

    #[test]
    fn test_exhausted_pool() {
        let allocator = allocator(vec![]);
        let mut clients = Clients::new();
        for (id, last) in [(1u8, 20u8), (2, 21), (3, 22)] {
            clients.insert(holder(id, Ipv4Addr::new(192, 168, 1, last), ClientState::Assigned));
        }
        assert_eq!(allocator.allocate(&mut clients, &request(&[9], vec![])), None);
    }

    #[test]
    fn test_requested_address() {
        let allocator = allocator(vec![]);
        let mut clients = Clients::new();

        let wanted = Ipv4Addr::new(192, 168, 1, 100);
        let packet = request(&[9], vec![DhcpOption::RequestedIpAddress(wanted)]);
        assert_eq!(allocator.allocate(&mut clients, &packet), Some(wanted));

        let foreign = request(
            &[9],
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 1))],
        );
        assert_eq!(
            allocator.allocate(&mut clients, &foreign),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );

        let own = request(&[9], vec![DhcpOption::RequestedIpAddress(SERVER)]);
        assert_eq!(
            allocator.allocate(&mut clients, &own),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );

        clients.insert(holder(1, wanted, ClientState::Assigned));
        assert_eq!(
            allocator.allocate(&mut clients, &packet),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn test_requested_network_and_broadcast_refused() {
        let allocator = allocator(vec![]);
        let mut clients = Clients::new();

        for wanted in [Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::new(192, 168, 1, 255)] {
            let packet = request(&[9], vec![DhcpOption::RequestedIpAddress(wanted)]);
            assert_eq!(
                allocator.allocate(&mut clients, &packet),
                Some(Ipv4Addr::new(192, 168, 1, 20))
            );
        }
    }

    #[test]
    fn test_point_to_point_subnet_has_no_reserved_hosts() {
        let allocator = Allocator::new(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(255, 255, 255, 254),
            AddressRange::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 1)),
            vec![],
        );
        assert!(allocator.is_assignable(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!allocator.is_assignable(Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!allocator.is_assignable(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_requested_address_reclaimed_from_released() {
        let allocator = allocator(vec![]);
        let mut clients = Clients::new();
        let wanted = Ipv4Addr::new(192, 168, 1, 100);
        clients.insert(holder(1, wanted, ClientState::Released));

        let packet = request(&[9], vec![DhcpOption::RequestedIpAddress(wanted)]);
        assert_eq!(allocator.allocate(&mut clients, &packet), Some(wanted));
        assert!(clients.holder_of(wanted).is_none());
    }

    #[test]
    fn test_mac_reservation() {
        let reservation = Reservation {
            matcher: ReservationMatch::parse_mac("aa:bb:cc/24").unwrap(),
            range: AddressRange::new(Ipv4Addr::new(0, 0, 0, 200), Ipv4Addr::new(0, 0, 0, 201)),
            preempt: false,
        };
        let allocator = allocator(vec![reservation]);
        let mut clients = Clients::new();

        let matching = request(&[0xaa, 0xbb, 0xcc, 1, 2, 3], vec![]);
        assert_eq!(
            allocator.allocate(&mut clients, &matching),
            Some(Ipv4Addr::new(192, 168, 1, 200))
        );

        clients.insert(holder(1, Ipv4Addr::new(192, 168, 1, 200), ClientState::Assigned));
        assert_eq!(
            allocator.allocate(&mut clients, &matching),
            Some(Ipv4Addr::new(192, 168, 1, 201))
        );

        let other = request(&[0xaa, 0xbb, 0xcd, 1, 2, 3], vec![]);
        assert_eq!(
            allocator.allocate(&mut clients, &other),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn test_partial_byte_mac_prefix() {
        let matcher = ReservationMatch::parse_mac("aa:b0/12").unwrap();
        assert!(matcher.matches(&request(&[0xaa, 0xbf, 0], vec![])));
        assert!(!matcher.matches(&request(&[0xaa, 0xcf, 0], vec![])));
        assert!(!matcher.matches(&request(&[0xaa], vec![])));
    }

    #[test]
    fn test_parse_mac_errors() {
        assert!(ReservationMatch::parse_mac("").is_err());
        assert!(ReservationMatch::parse_mac("aa:bb/17").is_err());
        assert!(ReservationMatch::parse_mac("aa:bb/x").is_err());
        assert_eq!(
            ReservationMatch::parse_mac("AA-BB").unwrap(),
            ReservationMatch::Mac {
                prefix: vec![0xaa, 0xbb],
                bits: 16
            }
        );
    }

    #[test]
    fn test_host_name_reservation_is_case_insensitive() {
        let reservation = Reservation {
            matcher: ReservationMatch::HostName("Printer".to_string()),
            range: AddressRange::new(Ipv4Addr::new(0, 0, 0, 240), Ipv4Addr::new(0, 0, 0, 241)),
            preempt: false,
        };
        let allocator = allocator(vec![reservation]);
        let mut clients = Clients::new();

        let packet = request(
            &[1, 2, 3],
            vec![DhcpOption::HostName(DhcpString::new("PRINTER-2nd-floor"))],
        );
        assert_eq!(
            allocator.allocate(&mut clients, &packet),
            Some(Ipv4Addr::new(192, 168, 1, 240))
        );
    }

    #[test]
    fn test_preempt_ignores_occupancy() {
        let reservation = Reservation {
            matcher: ReservationMatch::parse_mac("01:02:03:04:05:06").unwrap(),
            range: AddressRange::new(Ipv4Addr::new(192, 168, 1, 50), Ipv4Addr::new(192, 168, 1, 50)),
            preempt: true,
        };
        let allocator = allocator(vec![reservation]);
        let mut clients = Clients::new();
        clients.insert(holder(7, Ipv4Addr::new(192, 168, 1, 50), ClientState::Assigned));

        let packet = request(&[1, 2, 3, 4, 5, 6], vec![]);
        for _ in 0..3 {
            assert_eq!(
                allocator.allocate(&mut clients, &packet),
                Some(Ipv4Addr::new(192, 168, 1, 50))
            );
        }
    }

    #[test]
    fn test_contains_covers_reservations() {
        let reservation = Reservation {
            matcher: ReservationMatch::HostName("x".to_string()),
            range: AddressRange::new(Ipv4Addr::new(0, 0, 0, 240), Ipv4Addr::new(0, 0, 0, 241)),
            preempt: false,
        };
        let allocator = allocator(vec![reservation]);
        assert!(allocator.contains(Ipv4Addr::new(192, 168, 1, 21)));
        assert!(allocator.contains(Ipv4Addr::new(192, 168, 1, 241)));
        assert!(!allocator.contains(Ipv4Addr::new(192, 168, 1, 100)));
    }
}
