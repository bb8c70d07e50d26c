//! Server configuration.
//!
//! The configuration file is JSON holding one entry per served subnet:
//!
//! ```json
//! {
//!   "servers": [
//!     {
//!       "name": "lan",
//!       "address": "192.168.1.1",
//!       "subnet_mask": "255.255.255.0",
//!       "pool_start": "192.168.1.100",
//!       "pool_end": "192.168.1.200",
//!       "options": [
//!         { "mode": "force", "option": { "type": "router", "value": ["192.168.1.1"] } }
//!       ],
//!       "reservations": [
//!         { "mac": "00:11:22/24", "pool_start": "192.168.1.20", "pool_end": "192.168.1.29" }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Each entry is deserialized and validated on its own; a broken entry is
//! reported in [`LoadedConfig::rejected`] without affecting the others.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocation::{AddressRange, Allocator, Reservation, ReservationMatch};
use crate::error::{Error, Result};
use crate::lease::INFINITE_LEASE;
use crate::options::DhcpOption;
use crate::packet::{DEFAULT_MINIMUM_PACKET_SIZE, MINIMUM_PACKET_SIZE_FLOOR};
use crate::transport::BindOptions;

/// Well-known DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;

fn default_port() -> u16 {
    DHCP_SERVER_PORT
}

fn default_lease_time() -> u32 {
    86400
}

fn default_offer_expiration() -> u32 {
    30
}

fn default_minimum_packet_size() -> usize {
    DEFAULT_MINIMUM_PACKET_SIZE
}

fn default_packet_size() -> usize {
    1500
}

fn default_ttl() -> u32 {
    64
}

/// When a configured option is added to a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only if the client lists the code in its parameter request list.
    Default,
    /// Always.
    Force,
}

/// An option the server adds to OFFER and ACK replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionPolicy {
    pub mode: PolicyMode,
    pub option: DhcpOption,
}

/// A reservation as written in the configuration file.
///
/// Exactly one of `mac` and `host_name` must be given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// MAC prefix such as `"00:11:22"` or `"00:11:22:3/28"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    /// Case-insensitive host name prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,

    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,

    #[serde(default)]
    pub preempt: bool,
}

impl ReservationConfig {
    pub fn to_reservation(&self) -> Result<Reservation> {
        let matcher = match (&self.mac, &self.host_name) {
            (Some(mac), None) => ReservationMatch::parse_mac(mac)?,
            (None, Some(host_name)) if !host_name.is_empty() => {
                ReservationMatch::HostName(host_name.clone())
            }
            _ => {
                return Err(Error::InvalidConfig(
                    "reservation needs exactly one of mac or host_name".to_string(),
                ));
            }
        };

        Ok(Reservation {
            matcher,
            range: AddressRange::new(self.pool_start, self.pool_end),
            preempt: self.preempt,
        })
    }
}

/// Configuration of one server instance (one subnet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Instance name used in logs.
    pub name: String,

    /// Address of this server on the subnet. Also the server identifier.
    pub address: Ipv4Addr,

    /// Address the socket binds to, if different from `address`
    /// (for example `0.0.0.0` to receive broadcasts on Linux).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<Ipv4Addr>,

    #[serde(default = "default_port")]
    pub port: u16,

    pub subnet_mask: Ipv4Addr,

    /// First pool address. Only the host bits are used.
    pub pool_start: Ipv4Addr,

    /// Last pool address. Only the host bits are used.
    pub pool_end: Ipv4Addr,

    /// Lease length in seconds. 0 means infinite.
    #[serde(default = "default_lease_time")]
    pub lease_time_seconds: u32,

    /// How long an unanswered OFFER holds its address.
    #[serde(default = "default_offer_expiration")]
    pub offer_expiration_seconds: u32,

    /// Replies are zero-padded to this length. At least 312.
    #[serde(default = "default_minimum_packet_size")]
    pub minimum_packet_size: usize,

    /// Largest datagram accepted.
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,

    #[serde(default = "default_ttl")]
    pub ttl: u32,

    #[serde(default)]
    pub dont_fragment: bool,

    #[serde(default)]
    pub options: Vec<OptionPolicy>,

    #[serde(default)]
    pub reservations: Vec<ReservationConfig>,

    /// Where the lease table is persisted. No persistence when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leases_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "lan".to_string(),
            address: Ipv4Addr::new(192, 168, 1, 1),
            listen_address: None,
            port: DHCP_SERVER_PORT,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            pool_start: Ipv4Addr::new(192, 168, 1, 100),
            pool_end: Ipv4Addr::new(192, 168, 1, 200),
            lease_time_seconds: default_lease_time(),
            offer_expiration_seconds: default_offer_expiration(),
            minimum_packet_size: DEFAULT_MINIMUM_PACKET_SIZE,
            packet_size: default_packet_size(),
            ttl: default_ttl(),
            dont_fragment: false,
            options: vec![
                OptionPolicy {
                    mode: PolicyMode::Force,
                    option: DhcpOption::Router(vec![Ipv4Addr::new(192, 168, 1, 1)]),
                },
                OptionPolicy {
                    mode: PolicyMode::Force,
                    option: DhcpOption::DomainNameServer(vec![
                        Ipv4Addr::new(8, 8, 8, 8),
                        Ipv4Addr::new(8, 8, 4, 4),
                    ]),
                },
            ],
            reservations: Vec::new(),
            leases_file: Some(PathBuf::from("leases-lan.json")),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("name must not be empty".to_string()));
        }

        let mask = u32::from(self.subnet_mask);
        if mask == 0 || mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(Error::InvalidConfig(format!(
                "subnet_mask {} is not a contiguous netmask",
                self.subnet_mask
            )));
        }

        if self.address.is_unspecified() || self.address.is_broadcast() {
            return Err(Error::InvalidConfig(format!(
                "address {} cannot identify a server",
                self.address
            )));
        }

        let pool = self.pool();
        if pool.is_empty() {
            return Err(Error::InvalidConfig(
                "pool_start must be less than or equal to pool_end".to_string(),
            ));
        }

        if self.minimum_packet_size < MINIMUM_PACKET_SIZE_FLOOR {
            return Err(Error::InvalidConfig(format!(
                "minimum_packet_size must be at least {}",
                MINIMUM_PACKET_SIZE_FLOOR
            )));
        }

        if self.packet_size < MINIMUM_PACKET_SIZE_FLOOR {
            return Err(Error::InvalidConfig(format!(
                "packet_size must be at least {}",
                MINIMUM_PACKET_SIZE_FLOOR
            )));
        }

        for reservation in &self.reservations {
            let parsed = reservation.to_reservation()?;
            if parsed.range.sanitize(self.address, self.subnet_mask).is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "reservation {}-{} is empty",
                    reservation.pool_start, reservation.pool_end
                )));
            }
        }

        Ok(())
    }

    /// Socket address the instance binds to.
    pub fn endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.listen_address.unwrap_or(self.address), self.port)
    }

    /// The pool re-based onto the server's subnet.
    pub fn pool(&self) -> AddressRange {
        AddressRange::new(self.pool_start, self.pool_end).sanitize(self.address, self.subnet_mask)
    }

    pub fn allocator(&self) -> Result<Allocator> {
        let reservations = self
            .reservations
            .iter()
            .map(ReservationConfig::to_reservation)
            .collect::<Result<Vec<_>>>()?;
        Ok(Allocator::new(
            self.address,
            self.subnet_mask,
            AddressRange::new(self.pool_start, self.pool_end),
            reservations,
        ))
    }

    pub fn bind_options(&self) -> BindOptions {
        BindOptions {
            packet_size: self.packet_size,
            dont_fragment: self.dont_fragment,
            ttl: self.ttl,
        }
    }

    /// Lease length in seconds, [`INFINITE_LEASE`] when configured as 0.
    pub fn lease_duration(&self) -> u32 {
        if self.lease_time_seconds == 0 {
            INFINITE_LEASE
        } else {
            self.lease_time_seconds
        }
    }

    pub fn offer_expiration(&self) -> Duration {
        Duration::from_secs(self.offer_expiration_seconds as u64)
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: vec![ServerConfig::default()],
        }
    }
}

/// A server entry that failed to load.
#[derive(Debug)]
pub struct RejectedServer {
    /// Position of the entry in the `servers` array.
    pub index: usize,
    /// The entry's name, if it had a readable one.
    pub name: Option<String>,
    pub error: Error,
}

/// Result of loading a configuration file.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub rejected: Vec<RejectedServer>,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    servers: Vec<serde_json::Value>,
}

impl Config {
    /// Parses configuration text, validating each server entry separately.
    ///
    /// # Errors
    ///
    /// Fails only if the text is not a JSON object with a `servers` array.
    pub fn parse(text: &str) -> Result<LoadedConfig> {
        let raw: RawConfig = serde_json::from_str(text)?;
        let mut servers = Vec::new();
        let mut rejected = Vec::new();

        for (index, value) in raw.servers.into_iter().enumerate() {
            let name = value
                .get("name")
                .and_then(|name| name.as_str())
                .map(str::to_string);
            let parsed = serde_json::from_value::<ServerConfig>(value)
                .map_err(Error::from)
                .and_then(|server| server.validate().map(|()| server));
            match parsed {
                Ok(server) => servers.push(server),
                Err(error) => rejected.push(RejectedServer { index, name, error }),
            }
        }

        Ok(LoadedConfig {
            config: Config { servers },
            rejected,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<LoadedConfig> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads the file, writing [`Config::default`] first if it does not exist.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<LoadedConfig> {
        let path = path.as_ref();

        if path.exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(LoadedConfig {
                config,
                rejected: Vec::new(),
            })
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
