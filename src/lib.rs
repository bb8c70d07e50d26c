//! # dhcpserve
//!
//! A DHCP server engine implementing RFC 2131 (DHCP) and RFC 2132 (DHCP Options).
//!
//! ## Features
//!
//! - DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE, DECLINE, INFORM
//! - One server instance per subnet, each with its own lease table
//! - Reservations by MAC prefix or host-name prefix
//! - Option policies (always sent, or sent when requested)
//! - Option overload decoding (RFC 2131) with long-option concatenation (RFC 3396)
//! - Relay agent information echo (RFC 3046)
//! - Lease persistence across restarts
//! - Pluggable transport with an in-memory implementation for tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpserve::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> dhcpserve::Result<()> {
//!     let loaded = Config::load_or_create("config.json")?;
//!     for server_config in loaded.config.servers {
//!         let server = DhcpServer::bind(server_config).await?;
//!         server.run().await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpPacket`] - Packet parsing and encoding
//! - [`DhcpOption`] - Option types per RFC 2132
//! - [`Allocator`] - Address selection from reservations and the pool
//! - [`LeaseTable`] - Mutation-serialized client records
//! - [`LeaseFile`] - Background lease file writer
//! - [`Transport`] - Datagram endpoint, UDP or in-memory
//! - [`DhcpServer`] - The protocol state machine for one subnet

pub mod allocation;
pub mod config;
pub mod error;
pub mod hex;
pub mod lease;
pub mod options;
pub mod packet;
pub mod persistence;
pub mod server;
pub mod transport;

pub use allocation::{AddressRange, Allocator, Reservation, ReservationMatch};
pub use config::{Config, OptionPolicy, PolicyMode, ServerConfig};
pub use error::{Error, Result};
pub use lease::{Client, ClientState, LeaseTable};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use persistence::LeaseFile;
pub use server::{DhcpServer, MessageInterceptor, ServerEvent};
pub use transport::{MemoryPeer, MemoryTransport, Transport, TransportError, UdpTransport};
