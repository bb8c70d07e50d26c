//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A DHCP packet consists of a fixed 236-byte header followed by a 4-byte
//! magic cookie and variable-length options. This module handles parsing
//! incoming packets, reassembling options split across the overloaded
//! `sname`/`file` fields, and constructing replies.
//!
//! # Packet Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     op (1)    |   htype (1)   |   hlen (1)    |   hops (1)    |
//! +---------------+---------------+---------------+---------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |           secs (2)            |           flags (2)           |
//! +-------------------------------+-------------------------------+
//! |                          ciaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          yiaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          siaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          giaddr (4)                           |
//! +---------------------------------------------------------------+
//! |                          chaddr (16)                          |
//! +---------------------------------------------------------------+
//! |                          sname (64)                           |
//! +---------------------------------------------------------------+
//! |                          file (128)                           |
//! +---------------------------------------------------------------+
//! |                    magic cookie (4) = 99.130.83.99            |
//! +---------------------------------------------------------------+
//! |                          options (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 2131: Dynamic Host Configuration Protocol
//! - RFC 3396: Encoding Long Options in DHCPv4

use std::net::Ipv4Addr;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::hex::bytes_to_hex_string;
use crate::options::{
    DhcpOption, MAX_OPTION_LENGTH, MessageType, OptionCode, OverloadFlag, RelayAgentInformation,
};

/// DHCP magic cookie that identifies DHCP packets (vs BOOTP).
const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const DHCP_OP_HTYPE_HLEN_HOPS_SIZE: usize = 4;
const DHCP_XID_SIZE: usize = 4;
const DHCP_SECS_SIZE: usize = 2;
const DHCP_FLAGS_SIZE: usize = 2;
const DHCP_CIADDR_SIZE: usize = 4;
const DHCP_YIADDR_SIZE: usize = 4;
const DHCP_SIADDR_SIZE: usize = 4;
const DHCP_GIADDR_SIZE: usize = 4;
const DHCP_CHADDR_SIZE: usize = 16;
const DHCP_SNAME_SIZE: usize = 64;
const DHCP_FILE_SIZE: usize = 128;

const DHCP_CHADDR_OFFSET: usize = DHCP_OP_HTYPE_HLEN_HOPS_SIZE
    + DHCP_XID_SIZE
    + DHCP_SECS_SIZE
    + DHCP_FLAGS_SIZE
    + DHCP_CIADDR_SIZE
    + DHCP_YIADDR_SIZE
    + DHCP_SIADDR_SIZE
    + DHCP_GIADDR_SIZE;

const DHCP_SNAME_OFFSET: usize = DHCP_CHADDR_OFFSET + DHCP_CHADDR_SIZE;

const DHCP_FILE_OFFSET: usize = DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE;

const DHCP_MAGIC_COOKIE_OFFSET: usize = DHCP_FILE_OFFSET + DHCP_FILE_SIZE;

/// Size of the fixed header portion including magic cookie.
const DHCP_FIXED_HEADER_SIZE: usize = DHCP_MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Smallest datagram this encoder will ever produce.
///
/// 236-byte header, 4-byte cookie and the 72 bytes of option space
/// RFC 951 reserved for vendor extensions.
pub const MINIMUM_PACKET_SIZE_FLOOR: usize = 312;

/// Default minimum datagram length.
///
/// 576 bytes is the minimum datagram size all hosts must accept per RFC 791.
pub const DEFAULT_MINIMUM_PACKET_SIZE: usize = 576;

/// Maximum hop count before dropping the packet.
///
/// Prevents infinite relay loops. Per RFC 2131 §4.1, relay agents
/// increment hops and should discard packets with excessive counts.
const MAX_HOPS: u8 = 16;

/// Broadcast bit of the flags field.
const BROADCAST_FLAG: u16 = 0x8000;

/// Hardware type for Ethernet (most common).
pub const HTYPE_ETHERNET: u8 = 1;

/// BOOTP operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Client to server.
    BootRequest = 1,
    /// Server to client.
    BootReply = 2,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BootRequest),
            2 => Ok(Self::BootReply),
            other => Err(other),
        }
    }
}

/// A parsed DHCP packet.
///
/// This struct represents both client requests and server replies.
/// Use [`parse`](Self::parse) to parse incoming packets and
/// [`create_reply`](Self::create_reply) to construct responses.
///
/// `hlen` is not stored; it is always `chaddr.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: Opcode,

    /// Hardware address type. [`HTYPE_ETHERNET`] (1) for Ethernet.
    pub htype: u8,

    /// Hop count, incremented by relay agents.
    pub hops: u8,

    /// Transaction ID chosen by client, echoed in replies.
    pub xid: u32,

    /// Seconds elapsed since client began address acquisition.
    pub secs: u16,

    /// Bit 15 of the flags field. When set, replies must be broadcast.
    pub broadcast: bool,

    /// Client IP address (set by client in BOUND/RENEWING/REBINDING states).
    pub ciaddr: Ipv4Addr,

    /// "Your" IP address - the address being assigned to the client.
    pub yiaddr: Ipv4Addr,

    /// Next server IP address.
    pub siaddr: Ipv4Addr,

    /// Gateway IP address - set by relay agents.
    pub giaddr: Ipv4Addr,

    /// Client hardware address, at most 16 bytes.
    pub chaddr: Vec<u8>,

    /// Server host name. Empty when the field carried overloaded options.
    pub sname: String,

    /// Boot file name. Empty when the field carried overloaded options.
    pub file: String,

    /// DHCP options in the order they were read.
    pub options: Vec<DhcpOption>,
}

impl Default for DhcpPacket {
    fn default() -> Self {
        Self {
            op: Opcode::BootRequest,
            htype: HTYPE_ETHERNET,
            hops: 0,
            xid: 0,
            secs: 0,
            broadcast: false,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: Vec::new(),
            sname: String::new(),
            file: String::new(),
            options: Vec::new(),
        }
    }
}

/// Location of one option's payload inside an options buffer.
///
/// A long option split over consecutive instances has one range per instance.
struct RawOption {
    code: u8,
    payload: Vec<Range<usize>>,
}

impl RawOption {
    fn bytes(&self, buffer: &[u8]) -> Vec<u8> {
        self.payload
            .iter()
            .flat_map(|range| &buffer[range.clone()])
            .copied()
            .collect()
    }

    /// True if the next instance of the same code continues this one.
    fn continues_with(&self, code: u8) -> bool {
        self.code == code
            && self
                .payload
                .last()
                .is_some_and(|range| range.len() == MAX_OPTION_LENGTH)
    }
}

/// Splits an options buffer into (code, payload ranges) entries.
///
/// Pad bytes are skipped and scanning stops at End or the end of the buffer.
/// An instance that directly follows a full 255-byte instance of the same
/// code is joined onto it, which undoes the split made by
/// [`DhcpOption::encode`].
fn scan_options(data: &[u8]) -> Result<Vec<RawOption>> {
    let mut entries: Vec<RawOption> = Vec::new();
    let mut index = 0;

    while index < data.len() {
        let code = data[index];

        if code == OptionCode::Pad as u8 {
            index += 1;
            continue;
        }

        if code == OptionCode::End as u8 {
            break;
        }

        if index + 1 >= data.len() {
            return Err(Error::InvalidPacket("Option length missing".to_string()));
        }

        let length = data[index + 1] as usize;
        let start = index + 2;

        if start + length > data.len() {
            return Err(Error::InvalidPacket("Option data truncated".to_string()));
        }

        let payload = start..start + length;
        match entries.last_mut() {
            Some(previous) if previous.continues_with(code) => previous.payload.push(payload),
            _ => entries.push(RawOption {
                code,
                payload: vec![payload],
            }),
        }
        index = start + length;
    }

    Ok(entries)
}

/// Parses options from the primary area followed by any spillover buffers.
///
/// When a code seen in an earlier buffer shows up again in a later buffer,
/// the later payloads are appended to the earlier one in buffer order and
/// the later entries are marked consumed instead of being read again.
fn assemble_options(buffers: &[&[u8]]) -> Result<Vec<DhcpOption>> {
    let scanned = buffers
        .iter()
        .map(|buffer| scan_options(buffer))
        .collect::<Result<Vec<_>>>()?;
    let mut consumed: Vec<Vec<bool>> = scanned
        .iter()
        .map(|entries| vec![false; entries.len()])
        .collect();

    let mut options = Vec::new();
    for (source, entries) in scanned.iter().enumerate() {
        for (position, entry) in entries.iter().enumerate() {
            if consumed[source][position] {
                continue;
            }
            consumed[source][position] = true;

            let mut payload = entry.bytes(buffers[source]);
            for later in source + 1..scanned.len() {
                for (other_position, other) in scanned[later].iter().enumerate() {
                    if other.code == entry.code && !consumed[later][other_position] {
                        payload.extend(other.bytes(buffers[later]));
                        consumed[later][other_position] = true;
                    }
                }
            }

            options.push(DhcpOption::parse(entry.code, &payload)?);
        }
    }

    Ok(options)
}

/// Reads a zero-terminated BOOTP string field.
fn read_bootp_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).to_string()
}

/// Writes a BOOTP string field, truncated to leave room for the terminator.
fn write_bootp_string(packet: &mut Vec<u8>, text: &str, size: usize) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(size - 1);
    packet.extend_from_slice(&bytes[..len]);
    packet.resize(packet.len() + size - len, 0);
}

impl DhcpPacket {
    /// Parses a DHCP packet from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `data` - Raw packet bytes received from the network
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if:
    /// - Packet is shorter than 240 bytes (fixed header + magic cookie)
    /// - Magic cookie is invalid (not 99.130.83.99)
    /// - Opcode is neither BOOTREQUEST nor BOOTREPLY
    /// - Hop count exceeds 16 (relay loop protection)
    /// - Options are malformed (truncated length or data)
    ///
    /// Returns [`Error::LengthMismatch`] if a fixed-size option has the
    /// wrong payload length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        let magic_cookie = &data[DHCP_MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE];
        if magic_cookie != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let op = Opcode::try_from(data[0])
            .map_err(|op| Error::InvalidPacket(format!("Unknown opcode {}", op)))?;
        let htype = data[1];
        let hlen = (data[2] as usize).min(DHCP_CHADDR_SIZE);
        let hops = data[3];

        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let chaddr = data[DHCP_CHADDR_OFFSET..DHCP_CHADDR_OFFSET + hlen].to_vec();
        let sname_field = &data[DHCP_SNAME_OFFSET..DHCP_SNAME_OFFSET + DHCP_SNAME_SIZE];
        let file_field = &data[DHCP_FILE_OFFSET..DHCP_FILE_OFFSET + DHCP_FILE_SIZE];
        let primary = &data[DHCP_FIXED_HEADER_SIZE..];

        let overload = scan_options(primary)?
            .iter()
            .find(|entry| entry.code == OptionCode::OptionOverload as u8)
            .map(|entry| DhcpOption::parse(entry.code, &entry.bytes(primary)))
            .transpose()?
            .and_then(|option| match option {
                DhcpOption::OptionOverload(flag) => Some(flag),
                _ => None,
            })
            .unwrap_or(OverloadFlag::Neither);

        let mut buffers = vec![primary];
        if overload.uses_file() {
            buffers.push(file_field);
        }
        if overload.uses_sname() {
            buffers.push(sname_field);
        }
        let options = assemble_options(&buffers)?;

        let sname = if overload.uses_sname() {
            String::new()
        } else {
            read_bootp_string(sname_field)
        };
        let file = if overload.uses_file() {
            String::new()
        } else {
            read_bootp_string(file_field)
        };

        Ok(Self {
            op,
            htype,
            hops,
            xid,
            secs,
            broadcast: flags & BROADCAST_FLAG != 0,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Encodes the packet, padded to the default minimum of 576 bytes.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_minimum(DEFAULT_MINIMUM_PACKET_SIZE)
    }

    /// Encodes the packet to bytes for transmission.
    ///
    /// The output is zero-padded to `minimum_size`, never below 312 bytes.
    /// Relay agent information is written last, just before End (RFC 3046).
    /// Option overload markers are not written since all options fit in
    /// the primary area.
    pub fn encode_with_minimum(&self, minimum_size: usize) -> Vec<u8> {
        let minimum_size = minimum_size.max(MINIMUM_PACKET_SIZE_FLOOR);
        let mut packet = Vec::with_capacity(minimum_size);
        let hlen = self.chaddr.len().min(DHCP_CHADDR_SIZE);

        packet.push(self.op as u8);
        packet.push(self.htype);
        packet.push(hlen as u8);
        packet.push(self.hops);

        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        let flags = if self.broadcast { BROADCAST_FLAG } else { 0 };
        packet.extend_from_slice(&flags.to_be_bytes());

        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());

        packet.extend_from_slice(&self.chaddr[..hlen]);
        packet.resize(DHCP_SNAME_OFFSET, 0);
        write_bootp_string(&mut packet, &self.sname, DHCP_SNAME_SIZE);
        write_bootp_string(&mut packet, &self.file, DHCP_FILE_SIZE);

        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            if matches!(
                option,
                DhcpOption::RelayAgentInformation(_) | DhcpOption::OptionOverload(_)
            ) {
                continue;
            }
            packet.extend_from_slice(&option.encode());
        }
        for option in &self.options {
            if let DhcpOption::RelayAgentInformation(_) = option {
                packet.extend_from_slice(&option.encode());
            }
        }

        packet.push(OptionCode::End as u8);

        if packet.len() < minimum_size {
            packet.resize(minimum_size, 0);
        }

        packet
    }

    /// Returns the first option with the given wire code.
    pub fn option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|opt| opt.option_code() == code)
    }

    /// Returns true if an option with the given wire code is present.
    pub fn has_option(&self, code: u8) -> bool {
        self.option(code).is_some()
    }

    /// Returns the DHCP message type (Option 53) if present.
    ///
    /// Returns `None` for BOOTP packets which don't have this option.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Returns the requested IP address (Option 50) if present.
    ///
    /// Clients include this in DISCOVER to request a specific IP,
    /// and in REQUEST to confirm the offered IP.
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Returns the server identifier (Option 54) if present.
    ///
    /// Clients include this in REQUEST to indicate which server's
    /// offer they are accepting.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Returns the client identifier (Option 61) if present.
    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    /// Returns the relay agent information (Option 82) if present.
    ///
    /// This is added by DHCP relay agents and must be echoed in replies.
    pub fn relay_agent_info(&self) -> Option<&RelayAgentInformation> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RelayAgentInformation(info) => Some(info),
            _ => None,
        })
    }

    /// Returns the client host name (Option 12) if present.
    pub fn host_name(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::HostName(name) => Some(name.text.as_str()),
            _ => None,
        })
    }

    /// Returns the parameter request list (Option 55) if present.
    ///
    /// This is a list of option codes the client wants in the response.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ParameterRequestList(params) => Some(params.as_slice()),
            _ => None,
        })
    }

    /// Returns true if the client listed `code` in its parameter request list.
    pub fn requests_option(&self, code: u8) -> bool {
        self.parameter_request_list()
            .is_some_and(|params| params.contains(&code))
    }

    /// Formats the client hardware address as a colon-separated string.
    ///
    /// For Ethernet, returns format like "aa:bb:cc:dd:ee:ff".
    pub fn format_mac(&self) -> String {
        bytes_to_hex_string(&self.chaddr, ":")
    }

    /// Returns the identifier used to key the lease table.
    ///
    /// Uses Option 61 (Client Identifier) if present, otherwise the
    /// hardware address.
    pub fn client_id(&self) -> Vec<u8> {
        match self.client_identifier() {
            Some(id) => id.to_vec(),
            None => self.chaddr.clone(),
        }
    }

    /// Creates a DHCP reply packet from a request.
    ///
    /// This handles OFFER, ACK, and NAK responses. The message type is
    /// automatically added as the first option.
    ///
    /// # Arguments
    ///
    /// * `request` - The client's request packet
    /// * `message_type` - Type of reply (Offer, Ack, Nak)
    /// * `your_ip` - IP address being assigned (yiaddr)
    /// * `server_ip` - This server's IP (siaddr)
    /// * `options` - Additional options to include
    ///
    /// # Preserved Fields
    ///
    /// The following fields are copied from the request:
    /// - `xid` (transaction ID)
    /// - `broadcast` flag
    /// - `giaddr` (relay agent address)
    /// - `chaddr` and `htype` (client hardware address and type)
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);

        Self {
            op: Opcode::BootReply,
            htype: request.htype,
            hops: 0,
            xid: request.xid,
            secs: 0,
            broadcast: request.broadcast,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr.clone(),
            sname: String::new(),
            file: String::new(),
            options: all_options,
        }
    }
}
