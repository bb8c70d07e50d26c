//! DHCP options as defined in RFC 2132.
//!
//! DHCP uses options to convey configuration parameters between servers and clients.
//! Each option has a code (1 byte), length (1 byte), and variable-length data.
//!
//! The set of option kinds is closed: every code this server understands has a
//! [`DhcpOption`] variant, and every other code in 1..=254 decodes to
//! [`DhcpOption::Generic`] so it survives a decode/encode cycle untouched.
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions
//! - RFC 3046: DHCP Relay Agent Information Option (Option 82)
//! - RFC 4702: The DHCP Client FQDN Option (Option 81)

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum number of IPv4 addresses in a list-valued option.
///
/// Options have a 1-byte length field, so maximum data is 255 bytes.
/// With 4 bytes per IPv4 address, that's 63 addresses maximum.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Maximum payload length of a single option instance.
pub(crate) const MAX_OPTION_LENGTH: usize = 255;

/// Relay agent sub-option carrying the circuit id (RFC 3046 §3.1).
const RELAY_SUBOPTION_CIRCUIT_ID: u8 = 1;

/// Relay agent sub-option carrying the remote id (RFC 3046 §3.2).
const RELAY_SUBOPTION_REMOTE_ID: u8 = 2;

/// DHCP option codes understood by this server.
///
/// Codes without a variant decode through the generic byte-blob codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OptionCode {
    /// Padding (no operation). Used for alignment.
    Pad = 0,
    /// Subnet mask (RFC 2132 §3.3).
    SubnetMask = 1,
    /// Router/gateway addresses (RFC 2132 §3.5).
    Router = 3,
    /// DNS server addresses (RFC 2132 §3.8).
    DomainNameServer = 6,
    /// Client host name (RFC 2132 §3.14).
    HostName = 12,
    /// Domain name for DNS resolution (RFC 2132 §3.17).
    DomainName = 15,
    /// Interface MTU (RFC 2132 §5.1).
    InterfaceMtu = 26,
    /// Broadcast address (RFC 2132 §5.3).
    BroadcastAddress = 28,
    /// NTP server addresses (RFC 2132 §8.3).
    NtpServers = 42,
    /// Vendor specific information (RFC 2132 §8.4).
    VendorSpecificInformation = 43,
    /// Requested IP address (RFC 2132 §9.1).
    RequestedIpAddress = 50,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
    /// Option overload - indicates sname/file fields contain options (RFC 2132 §9.3).
    OptionOverload = 52,
    /// DHCP message type (RFC 2132 §9.6).
    MessageType = 53,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
    /// Parameter request list (RFC 2132 §9.8).
    ParameterRequestList = 55,
    /// Free-text message, usually explaining a NAK (RFC 2132 §9.9).
    Message = 56,
    /// Maximum DHCP message size the client accepts (RFC 2132 §9.10).
    MaximumMessageSize = 57,
    /// Renewal time T1 (RFC 2132 §9.11).
    RenewalTime = 58,
    /// Rebinding time T2 (RFC 2132 §9.12).
    RebindingTime = 59,
    /// Vendor class identifier (RFC 2132 §9.13).
    VendorClassIdentifier = 60,
    /// Client identifier (RFC 2132 §9.14).
    ClientIdentifier = 61,
    /// TFTP server name (RFC 2132 §9.4).
    TftpServerName = 66,
    /// Boot file name (RFC 2132 §9.5).
    BootFileName = 67,
    /// Client fully qualified domain name (RFC 4702).
    ClientFqdn = 81,
    /// Relay agent information (RFC 3046).
    RelayAgentInformation = 82,
    /// End of options marker.
    End = 255,
}

impl OptionCode {
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pad),
            1 => Some(Self::SubnetMask),
            3 => Some(Self::Router),
            6 => Some(Self::DomainNameServer),
            12 => Some(Self::HostName),
            15 => Some(Self::DomainName),
            26 => Some(Self::InterfaceMtu),
            28 => Some(Self::BroadcastAddress),
            42 => Some(Self::NtpServers),
            43 => Some(Self::VendorSpecificInformation),
            50 => Some(Self::RequestedIpAddress),
            51 => Some(Self::LeaseTime),
            52 => Some(Self::OptionOverload),
            53 => Some(Self::MessageType),
            54 => Some(Self::ServerIdentifier),
            55 => Some(Self::ParameterRequestList),
            56 => Some(Self::Message),
            57 => Some(Self::MaximumMessageSize),
            58 => Some(Self::RenewalTime),
            59 => Some(Self::RebindingTime),
            60 => Some(Self::VendorClassIdentifier),
            61 => Some(Self::ClientIdentifier),
            66 => Some(Self::TftpServerName),
            67 => Some(Self::BootFileName),
            81 => Some(Self::ClientFqdn),
            82 => Some(Self::RelayAgentInformation),
            255 => Some(Self::End),
            _ => None,
        }
    }

    /// Looks up the codec registered for a wire code.
    ///
    /// `None` means the code is handled by the generic byte-blob codec.
    pub fn lookup(code: u8) -> Option<Self> {
        CODECS[code as usize]
    }
}

/// Code → codec dispatch table, built once at compile time and never mutated.
static CODECS: [Option<OptionCode>; 256] = build_codecs();

const fn build_codecs() -> [Option<OptionCode>; 256] {
    let mut table = [None; 256];
    let mut code = 0;
    while code < 256 {
        table[code] = OptionCode::from_u8(code as u8);
        code += 1;
    }
    table
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::lookup(value).ok_or(value)
    }
}

/// DHCP message types (Option 53) as defined in RFC 2132 §9.6.
///
/// These values indicate the purpose of a DHCP message in the protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate servers.
    Discover = 1,
    /// Server response to DISCOVER with IP offer.
    Offer = 2,
    /// Client request for offered parameters.
    Request = 3,
    /// Client indicates address is already in use.
    Decline = 4,
    /// Server acknowledgement with configuration.
    Ack = 5,
    /// Server negative acknowledgement.
    Nak = 6,
    /// Client releases IP address.
    Release = 7,
    /// Client requests config without IP allocation.
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Option overload flags (Option 52) as defined in RFC 2132 §9.3.
///
/// Indicates that the `sname` and/or `file` fields in the DHCP packet
/// header contain DHCP options instead of their normal content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum OverloadFlag {
    /// Neither field is overloaded.
    Neither = 0,
    /// The `file` field contains options.
    File = 1,
    /// The `sname` field contains options.
    Sname = 2,
    /// Both `file` and `sname` fields contain options.
    Both = 3,
}

impl OverloadFlag {
    pub fn uses_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    pub fn uses_sname(self) -> bool {
        matches!(self, Self::Sname | Self::Both)
    }
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Neither),
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// String payload of a text option.
///
/// `zero_terminated` controls whether a trailing NUL is written on encode.
/// On decode it records whether the sender terminated the string, so a
/// decoded option re-encodes to the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DhcpString {
    pub text: String,
    #[serde(default)]
    pub zero_terminated: bool,
}

impl DhcpString {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            zero_terminated: false,
        }
    }

    pub fn zero_terminated(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            zero_terminated: true,
        }
    }

    fn decode(data: &[u8]) -> Self {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Self {
            text: String::from_utf8_lossy(&data[..end]).to_string(),
            zero_terminated: data.last() == Some(&0),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = self.text.as_bytes().to_vec();
        if self.zero_terminated {
            bytes.push(0);
        }
        bytes
    }
}

impl From<&str> for DhcpString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Client FQDN option payload (RFC 4702 §2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFqdn {
    pub flags: u8,
    pub rcode1: u8,
    pub rcode2: u8,
    /// Domain name, either ASCII or DNS wire encoding depending on the E flag.
    pub domain_name: Vec<u8>,
}

/// Relay agent information option payload (RFC 3046).
///
/// Sub-options other than circuit-id and remote-id are kept in `other`
/// so an echoed option is byte-identical to what the relay sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayAgentInformation {
    pub circuit_id: Option<Vec<u8>>,
    pub remote_id: Option<Vec<u8>>,
    #[serde(default)]
    pub other: Vec<(u8, Vec<u8>)>,
}

impl RelayAgentInformation {
    fn decode(data: &[u8]) -> Result<Self> {
        let mut info = Self::default();
        let mut index = 0;

        while index < data.len() {
            if index + 1 >= data.len() {
                return Err(Error::InvalidPacket(
                    "Relay agent sub-option length missing".to_string(),
                ));
            }
            let code = data[index];
            let length = data[index + 1] as usize;
            let start = index + 2;
            if start + length > data.len() {
                return Err(Error::InvalidPacket(
                    "Relay agent sub-option truncated".to_string(),
                ));
            }
            let value = data[start..start + length].to_vec();
            match code {
                RELAY_SUBOPTION_CIRCUIT_ID => info.circuit_id = Some(value),
                RELAY_SUBOPTION_REMOTE_ID => info.remote_id = Some(value),
                other => info.other.push((other, value)),
            }
            index = start + length;
        }

        Ok(info)
    }

    fn encode(&self) -> Vec<u8> {
        let mut result = Vec::new();
        let mut push = |code: u8, value: &[u8]| {
            let len = value.len().min(MAX_OPTION_LENGTH);
            result.push(code);
            result.push(len as u8);
            result.extend_from_slice(&value[..len]);
        };
        if let Some(circuit_id) = &self.circuit_id {
            push(RELAY_SUBOPTION_CIRCUIT_ID, circuit_id);
        }
        if let Some(remote_id) = &self.remote_id {
            push(RELAY_SUBOPTION_REMOTE_ID, remote_id);
        }
        for (code, value) in &self.other {
            push(*code, value);
        }
        result
    }
}

/// A parsed DHCP option.
///
/// Each variant corresponds to a specific option code. Codes without a
/// dedicated variant are preserved as [`Generic`](Self::Generic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DhcpOption {
    /// Subnet mask (Option 1).
    SubnetMask(Ipv4Addr),
    /// Router/gateway addresses (Option 3). First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    /// DNS server addresses (Option 6).
    DomainNameServer(Vec<Ipv4Addr>),
    /// Client host name (Option 12).
    HostName(DhcpString),
    /// Domain name for client DNS resolution (Option 15).
    DomainName(DhcpString),
    /// Interface MTU (Option 26).
    InterfaceMtu(u16),
    /// Broadcast address (Option 28).
    BroadcastAddress(Ipv4Addr),
    /// NTP server addresses (Option 42).
    NtpServers(Vec<Ipv4Addr>),
    /// Opaque vendor specific information (Option 43).
    VendorSpecificInformation(Vec<u8>),
    /// Client's requested IP address (Option 50).
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds (Option 51). `u32::MAX` means infinite.
    LeaseTime(u32),
    /// Indicates sname/file fields contain options (Option 52).
    OptionOverload(OverloadFlag),
    /// DHCP message type (Option 53).
    MessageType(MessageType),
    /// Server identifier - IP of the DHCP server (Option 54).
    ServerIdentifier(Ipv4Addr),
    /// List of option codes the client wants (Option 55).
    ParameterRequestList(Vec<u8>),
    /// Free-text message (Option 56).
    Message(DhcpString),
    /// Maximum DHCP message size (Option 57).
    MaximumMessageSize(u16),
    /// Renewal time T1 in seconds (Option 58).
    RenewalTime(u32),
    /// Rebinding time T2 in seconds (Option 59).
    RebindingTime(u32),
    /// Vendor class identifier (Option 60).
    VendorClassIdentifier(Vec<u8>),
    /// Client identifier for unique identification (Option 61).
    ClientIdentifier(Vec<u8>),
    /// TFTP server name (Option 66).
    TftpServerName(DhcpString),
    /// Boot file name (Option 67).
    BootFileName(DhcpString),
    /// Client fully qualified domain name (Option 81).
    ClientFqdn(ClientFqdn),
    /// Relay agent information (Option 82, RFC 3046).
    RelayAgentInformation(RelayAgentInformation),
    /// Any other option, kept as raw code and data.
    Generic(u8, Vec<u8>),
}

fn fixed<const N: usize>(code: OptionCode, data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| Error::LengthMismatch {
        code: code as u8,
        expected: N,
        actual: data.len(),
    })
}

fn address(code: OptionCode, data: &[u8]) -> Result<Ipv4Addr> {
    fixed::<4>(code, data).map(Ipv4Addr::from)
}

fn address_list(code: OptionCode, data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if !data.len().is_multiple_of(4) {
        return Err(Error::InvalidPacket(format!(
            "Option {} length {} is not a multiple of 4",
            code as u8,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn encode_address_list(addrs: &[Ipv4Addr]) -> Vec<u8> {
    addrs
        .iter()
        .take(MAX_ADDRESSES_PER_OPTION)
        .flat_map(|addr| addr.octets())
        .collect()
}

impl DhcpOption {
    /// Returns the wire code for this option.
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DomainNameServer(_) => OptionCode::DomainNameServer,
            Self::HostName(_) => OptionCode::HostName,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::NtpServers(_) => OptionCode::NtpServers,
            Self::VendorSpecificInformation(_) => OptionCode::VendorSpecificInformation,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::Message(_) => OptionCode::Message,
            Self::MaximumMessageSize(_) => OptionCode::MaximumMessageSize,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::VendorClassIdentifier(_) => OptionCode::VendorClassIdentifier,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::TftpServerName(_) => OptionCode::TftpServerName,
            Self::BootFileName(_) => OptionCode::BootFileName,
            Self::ClientFqdn(_) => OptionCode::ClientFqdn,
            Self::RelayAgentInformation(_) => OptionCode::RelayAgentInformation,
            Self::Generic(code, _) => return *code,
        };
        code as u8
    }

    /// Parses a DHCP option from its code and fully assembled payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LengthMismatch`] if a fixed-size option carries a
    /// payload of the wrong size, and [`Error::InvalidPacket`] for other
    /// malformed payloads (address lists not a multiple of 4, unknown
    /// message types, Pad/End passed as an option).
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let Some(kind) = OptionCode::lookup(code) else {
            return Ok(Self::Generic(code, data.to_vec()));
        };

        let option = match kind {
            OptionCode::SubnetMask => Self::SubnetMask(address(kind, data)?),
            OptionCode::Router => Self::Router(address_list(kind, data)?),
            OptionCode::DomainNameServer => Self::DomainNameServer(address_list(kind, data)?),
            OptionCode::HostName => Self::HostName(DhcpString::decode(data)),
            OptionCode::DomainName => Self::DomainName(DhcpString::decode(data)),
            OptionCode::InterfaceMtu => {
                Self::InterfaceMtu(u16::from_be_bytes(fixed::<2>(kind, data)?))
            }
            OptionCode::BroadcastAddress => Self::BroadcastAddress(address(kind, data)?),
            OptionCode::NtpServers => Self::NtpServers(address_list(kind, data)?),
            OptionCode::VendorSpecificInformation => {
                Self::VendorSpecificInformation(data.to_vec())
            }
            OptionCode::RequestedIpAddress => Self::RequestedIpAddress(address(kind, data)?),
            OptionCode::LeaseTime => Self::LeaseTime(u32::from_be_bytes(fixed::<4>(kind, data)?)),
            OptionCode::OptionOverload => {
                let [value] = fixed::<1>(kind, data)?;
                let flag = OverloadFlag::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Invalid option overload value: {}", value))
                })?;
                Self::OptionOverload(flag)
            }
            OptionCode::MessageType => {
                let [value] = fixed::<1>(kind, data)?;
                let msg_type = MessageType::try_from(value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(msg_type)
            }
            OptionCode::ServerIdentifier => Self::ServerIdentifier(address(kind, data)?),
            OptionCode::ParameterRequestList => Self::ParameterRequestList(data.to_vec()),
            OptionCode::Message => Self::Message(DhcpString::decode(data)),
            OptionCode::MaximumMessageSize => {
                Self::MaximumMessageSize(u16::from_be_bytes(fixed::<2>(kind, data)?))
            }
            OptionCode::RenewalTime => {
                Self::RenewalTime(u32::from_be_bytes(fixed::<4>(kind, data)?))
            }
            OptionCode::RebindingTime => {
                Self::RebindingTime(u32::from_be_bytes(fixed::<4>(kind, data)?))
            }
            OptionCode::VendorClassIdentifier => Self::VendorClassIdentifier(data.to_vec()),
            OptionCode::ClientIdentifier => Self::ClientIdentifier(data.to_vec()),
            OptionCode::TftpServerName => Self::TftpServerName(DhcpString::decode(data)),
            OptionCode::BootFileName => Self::BootFileName(DhcpString::decode(data)),
            OptionCode::ClientFqdn => {
                if data.len() < 3 {
                    return Err(Error::InvalidPacket(format!(
                        "Client FQDN option too short: {} bytes",
                        data.len()
                    )));
                }
                Self::ClientFqdn(ClientFqdn {
                    flags: data[0],
                    rcode1: data[1],
                    rcode2: data[2],
                    domain_name: data[3..].to_vec(),
                })
            }
            OptionCode::RelayAgentInformation => {
                Self::RelayAgentInformation(RelayAgentInformation::decode(data)?)
            }
            OptionCode::Pad | OptionCode::End => {
                return Err(Error::InvalidPacket(
                    "Pad/End should not be parsed as options".to_string(),
                ));
            }
        };

        Ok(option)
    }

    /// Encodes just the option payload (no code or length byte).
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => addr.octets().to_vec(),
            Self::Router(addrs) | Self::DomainNameServer(addrs) | Self::NtpServers(addrs) => {
                encode_address_list(addrs)
            }
            Self::HostName(text)
            | Self::DomainName(text)
            | Self::Message(text)
            | Self::TftpServerName(text)
            | Self::BootFileName(text) => text.encode(),
            Self::InterfaceMtu(value) | Self::MaximumMessageSize(value) => {
                value.to_be_bytes().to_vec()
            }
            Self::LeaseTime(time) | Self::RenewalTime(time) | Self::RebindingTime(time) => {
                time.to_be_bytes().to_vec()
            }
            Self::OptionOverload(flag) => vec![*flag as u8],
            Self::MessageType(msg_type) => vec![*msg_type as u8],
            Self::VendorSpecificInformation(data)
            | Self::ParameterRequestList(data)
            | Self::VendorClassIdentifier(data)
            | Self::ClientIdentifier(data)
            | Self::Generic(_, data) => data.clone(),
            Self::ClientFqdn(fqdn) => {
                let mut result = vec![fqdn.flags, fqdn.rcode1, fqdn.rcode2];
                result.extend_from_slice(&fqdn.domain_name);
                result
            }
            Self::RelayAgentInformation(info) => info.encode(),
        }
    }

    /// Encodes the option to its wire format (code + length + data).
    ///
    /// Payloads longer than 255 bytes are split into consecutive instances
    /// of the same code (RFC 3396).
    pub fn encode(&self) -> Vec<u8> {
        let code = self.option_code();
        let payload = self.payload();
        if payload.is_empty() {
            return vec![code, 0];
        }

        let chunks = payload.len().div_ceil(MAX_OPTION_LENGTH);
        let mut result = Vec::with_capacity(payload.len() + 2 * chunks);
        for chunk in payload.chunks(MAX_OPTION_LENGTH) {
            result.push(code);
            result.push(chunk.len() as u8);
            result.extend_from_slice(chunk);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversions() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_registry_covers_every_code() {
        for code in 0..=255u8 {
            match OptionCode::lookup(code) {
                Some(kind) => assert_eq!(kind as u8, code),
                None => assert!(matches!(
                    DhcpOption::parse(code, &[1, 2]).unwrap(),
                    DhcpOption::Generic(c, _) if c == code
                )),
            }
        }
        assert_eq!(OptionCode::lookup(82), Some(OptionCode::RelayAgentInformation));
        assert_eq!(OptionCode::try_from(200), Err(200));
    }

    #[test]
    fn test_option_encode_decode_roundtrip() {
        let options: Vec<DhcpOption> = vec![
            DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
            DhcpOption::Router(vec![Ipv4Addr::new(192, 168, 1, 1)]),
            DhcpOption::DomainNameServer(vec![Ipv4Addr::new(8, 8, 8, 8)]),
            DhcpOption::NtpServers(vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]),
            DhcpOption::HostName("test-host".into()),
            DhcpOption::DomainName(DhcpString::zero_terminated("example.local")),
            DhcpOption::BroadcastAddress(Ipv4Addr::new(192, 168, 1, 255)),
            DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 100)),
            DhcpOption::LeaseTime(86400),
            DhcpOption::OptionOverload(OverloadFlag::Both),
            DhcpOption::MessageType(MessageType::Discover),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 1)),
            DhcpOption::Message("address in use".into()),
            DhcpOption::MaximumMessageSize(1500),
            DhcpOption::RenewalTime(43200),
            DhcpOption::RebindingTime(75600),
            DhcpOption::InterfaceMtu(1500),
            DhcpOption::VendorClassIdentifier(b"MSFT 5.0".to_vec()),
            DhcpOption::VendorSpecificInformation(vec![1, 2, 3]),
            DhcpOption::ClientIdentifier(vec![1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            DhcpOption::ParameterRequestList(vec![1, 3, 6, 15]),
            DhcpOption::TftpServerName("tftp.local".into()),
            DhcpOption::BootFileName(DhcpString::zero_terminated("pxelinux.0")),
            DhcpOption::ClientFqdn(ClientFqdn {
                flags: 0x01,
                rcode1: 0,
                rcode2: 0,
                domain_name: b"host.example".to_vec(),
            }),
            DhcpOption::RelayAgentInformation(RelayAgentInformation {
                circuit_id: Some(b"eth0".to_vec()),
                remote_id: Some(vec![0xaa, 0xbb]),
                other: vec![(9, vec![7, 7])],
            }),
            DhcpOption::Generic(200, vec![0xde, 0xad]),
        ];

        for original in options {
            let encoded = original.encode();
            let decoded = DhcpOption::parse(encoded[0], &encoded[2..]).unwrap();
            assert_eq!(decoded, original);
            assert_eq!(encoded, decoded.encode());
        }
    }

    #[test]
    fn test_long_payload_split_into_instances() {
        let option = DhcpOption::VendorSpecificInformation(vec![0xab; 300]);
        let encoded = option.encode();

        assert_eq!(encoded.len(), 304);
        assert_eq!(&encoded[..2], &[43, 255]);
        assert_eq!(&encoded[257..259], &[43, 45]);
        assert_eq!(DhcpOption::Generic(60, vec![]).encode(), vec![60, 0]);
    }

    #[test]
    fn test_fixed_length_mismatch() {
        assert!(matches!(
            DhcpOption::parse(1, &[255, 255, 255]),
            Err(Error::LengthMismatch { code: 1, expected: 4, actual: 3 })
        ));
        assert!(matches!(
            DhcpOption::parse(51, &[0, 0, 0]),
            Err(Error::LengthMismatch { code: 51, .. })
        ));
        assert!(matches!(
            DhcpOption::parse(53, &[1, 1]),
            Err(Error::LengthMismatch { code: 53, .. })
        ));
        assert!(matches!(
            DhcpOption::parse(57, &[5]),
            Err(Error::LengthMismatch { code: 57, .. })
        ));
    }

    #[test]
    fn test_address_list_length_not_multiple_of_four() {
        assert!(DhcpOption::parse(OptionCode::Router as u8, &[1, 2, 3, 4, 5]).is_err());
        assert!(DhcpOption::parse(OptionCode::DomainNameServer as u8, &[1, 2]).is_err());
        assert!(DhcpOption::parse(OptionCode::NtpServers as u8, &[1, 2, 3]).is_err());
        assert_eq!(
            DhcpOption::parse(OptionCode::Router as u8, &[]).unwrap(),
            DhcpOption::Router(vec![])
        );
    }

    #[test]
    fn test_unknown_option() {
        let decoded = DhcpOption::parse(100, &[1, 2, 3, 4]).unwrap();
        if let DhcpOption::Generic(code, data) = decoded {
            assert_eq!(code, 100);
            assert_eq!(data, vec![1, 2, 3, 4]);
        } else {
            panic!("Expected Generic");
        }
    }

    #[test]
    fn test_zero_terminated_strings() {
        let plain = DhcpOption::HostName("abc".into()).encode();
        assert_eq!(plain, vec![12, 3, b'a', b'b', b'c']);

        let terminated = DhcpOption::HostName(DhcpString::zero_terminated("abc")).encode();
        assert_eq!(terminated, vec![12, 4, b'a', b'b', b'c', 0]);

        let decoded = DhcpOption::parse(12, &[b'a', b'b', b'c', 0]).unwrap();
        assert_eq!(
            decoded,
            DhcpOption::HostName(DhcpString::zero_terminated("abc"))
        );
    }

    #[test]
    fn test_relay_agent_information_truncated_suboption() {
        assert!(DhcpOption::parse(82, &[1, 5, 0xaa]).is_err());
        assert!(DhcpOption::parse(82, &[1]).is_err());
    }

    #[test]
    fn test_overload_values() {
        assert_eq!(
            DhcpOption::parse(52, &[0]).unwrap(),
            DhcpOption::OptionOverload(OverloadFlag::Neither)
        );
        assert!(DhcpOption::parse(52, &[4]).is_err());
        assert!(OverloadFlag::Both.uses_file() && OverloadFlag::Both.uses_sname());
        assert!(!OverloadFlag::File.uses_sname());
    }

    #[test]
    fn test_option_serde_shape() {
        let option = DhcpOption::Router(vec![Ipv4Addr::new(10, 0, 0, 1)]);
        let json = serde_json::to_string(&option).unwrap();
        assert_eq!(json, r#"{"type":"router","value":["10.0.0.1"]}"#);
        let parsed: DhcpOption = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, option);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::Discover), "DISCOVER");
        assert_eq!(format!("{}", MessageType::Offer), "OFFER");
        assert_eq!(format!("{}", MessageType::Request), "REQUEST");
        assert_eq!(format!("{}", MessageType::Decline), "DECLINE");
        assert_eq!(format!("{}", MessageType::Ack), "ACK");
        assert_eq!(format!("{}", MessageType::Nak), "NAK");
        assert_eq!(format!("{}", MessageType::Release), "RELEASE");
        assert_eq!(format!("{}", MessageType::Inform), "INFORM");
    }
}
