//! Datagram transport used by a server instance.
//!
//! [`UdpTransport`] is the production implementation over a tokio UDP
//! socket. [`MemoryTransport`] is a channel-backed fake whose other end, a
//! [`MemoryPeer`], lets tests inject datagrams and observe replies.

use std::net::{SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Windows `WSAEMSGSIZE`: datagram larger than the receive buffer.
#[cfg(windows)]
const WSAEMSGSIZE: i32 = 10040;

/// Errors reported by a [`Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed. Expected after [`Transport::close`].
    #[error("Transport closed")]
    Closed,

    /// A datagram did not fit the configured packet size.
    #[error("Datagram exceeds packet size")]
    Oversized,

    /// ICMP port unreachable surfaced on an unconnected socket.
    #[error("Connection reset by remote host")]
    ConnectionReset,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true if the receive loop cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Oversized | Self::ConnectionReset)
    }

    fn from_io(error: std::io::Error) -> Self {
        #[cfg(windows)]
        if error.raw_os_error() == Some(WSAEMSGSIZE) {
            return Self::Oversized;
        }
        match error.kind() {
            std::io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            _ => Self::Io(error),
        }
    }
}

/// Socket parameters applied at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOptions {
    /// Largest datagram accepted; anything bigger is reported as oversized.
    pub packet_size: usize,
    pub dont_fragment: bool,
    pub ttl: u32,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            packet_size: 1500,
            dont_fragment: false,
            ttl: 64,
        }
    }
}

/// A bound datagram endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one datagram.
    async fn send(
        &self,
        destination: SocketAddrV4,
        data: &[u8],
    ) -> std::result::Result<(), TransportError>;

    /// Waits for the next datagram and its source.
    ///
    /// Returns [`TransportError::Closed`] once [`close`](Self::close) has
    /// been called, including for receives already in flight.
    async fn receive(&self) -> std::result::Result<(SocketAddrV4, Vec<u8>), TransportError>;

    /// Closes the transport. Idempotent.
    fn close(&self);
}

/// UDP transport over a tokio socket.
pub struct UdpTransport {
    socket: UdpSocket,
    packet_size: usize,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    /// Creates, configures and binds a broadcast-capable UDP socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if any socket call fails, typically when
    /// binding to port 67 without administrator privileges.
    pub fn bind(endpoint: SocketAddrV4, options: BindOptions) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_ttl(options.ttl)
            .map_err(|error| Error::Socket(format!("Failed to set IP_TTL: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        if options.dont_fragment {
            #[cfg(windows)]
            {
                use std::os::windows::io::AsRawSocket;
                if let Err(error) = set_dont_fragment(socket.as_raw_socket()) {
                    warn!("Failed to set don't-fragment on {}: {}", endpoint, error);
                }
            }
            #[cfg(not(windows))]
            {
                warn!(
                    "dont_fragment is only supported on Windows and will be ignored for {}",
                    endpoint
                );
            }
        }

        socket.bind(&endpoint.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", endpoint, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        let (closed, _) = watch::channel(false);

        Ok(Self {
            socket,
            packet_size: options.packet_size,
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(
        &self,
        destination: SocketAddrV4,
        data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.socket
            .send_to(data, destination)
            .await
            .map_err(TransportError::from_io)?;
        Ok(())
    }

    async fn receive(&self) -> std::result::Result<(SocketAddrV4, Vec<u8>), TransportError> {
        let mut closed = self.closed.subscribe();
        let mut buffer = vec![0u8; self.packet_size + 1];

        loop {
            if *closed.borrow_and_update() {
                return Err(TransportError::Closed);
            }

            let received = tokio::select! {
                _ = closed.changed() => continue,
                received = self.socket.recv_from(&mut buffer) => received,
            };

            match received {
                Ok((size, _)) if size > self.packet_size => return Err(TransportError::Oversized),
                Ok((size, SocketAddr::V4(source))) => return Ok((source, buffer[..size].to_vec())),
                Ok((_, SocketAddr::V6(source))) => {
                    debug!("Ignoring datagram from IPv6 source {}", source);
                }
                Err(error) => return Err(TransportError::from_io(error)),
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(windows)]
fn set_dont_fragment(raw_socket: std::os::windows::io::RawSocket) -> Result<()> {
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, SOCKET, setsockopt};

    const IP_DONTFRAGMENT: i32 = 14;

    let enabled: u32 = 1;
    let value = enabled.to_ne_bytes();
    let result = unsafe {
        setsockopt(
            raw_socket as SOCKET,
            IPPROTO_IP,
            IP_DONTFRAGMENT,
            value.as_ptr(),
            std::mem::size_of::<u32>() as i32,
        )
    };

    if result != 0 {
        return Err(Error::Socket(format!(
            "setsockopt IP_DONTFRAGMENT failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

type Inbound = std::result::Result<(SocketAddrV4, Vec<u8>), TransportError>;

/// In-memory transport for tests.
pub struct MemoryTransport {
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    outbound: mpsc::UnboundedSender<(SocketAddrV4, Vec<u8>)>,
    closed: watch::Sender<bool>,
}

/// The test side of a [`MemoryTransport`].
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<(SocketAddrV4, Vec<u8>)>,
}

impl MemoryTransport {
    /// Creates a connected transport and peer.
    pub fn pair() -> (Self, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        (
            Self {
                inbound: Mutex::new(inbound_rx),
                outbound: outbound_tx,
                closed,
            },
            MemoryPeer {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        destination: SocketAddrV4,
        data: &[u8],
    ) -> std::result::Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send((destination, data.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> std::result::Result<(SocketAddrV4, Vec<u8>), TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            next = inbound.recv() => next.unwrap_or(Err(TransportError::Closed)),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

impl MemoryPeer {
    /// Delivers a datagram to the transport as if sent by `source`.
    pub fn inject(&self, source: SocketAddrV4, data: Vec<u8>) {
        let _ = self.inbound.send(Ok((source, data)));
    }

    /// Makes the transport's next receive fail with `error`.
    pub fn inject_error(&self, error: TransportError) {
        let _ = self.inbound.send(Err(error));
    }

    /// Waits for the next datagram the transport sent.
    pub async fn next_sent(&mut self) -> Option<(SocketAddrV4, Vec<u8>)> {
        self.outbound.recv().await
    }

    /// Like [`next_sent`](Self::next_sent) but gives up after `timeout`.
    pub async fn next_sent_within(
        &mut self,
        timeout: std::time::Duration,
    ) -> Option<(SocketAddrV4, Vec<u8>)> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(!TransportError::Oversized.is_fatal());
        assert!(!TransportError::ConnectionReset.is_fatal());
        assert!(TransportError::Closed.is_fatal());

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(matches!(
            TransportError::from_io(reset),
            TransportError::ConnectionReset
        ));
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(TransportError::from_io(denied).is_fatal());
    }

    #[tokio::test]
    async fn test_memory_transport_roundtrip() {
        let (transport, mut peer) = MemoryTransport::pair();
        let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 68);

        peer.inject(source, vec![1, 2, 3]);
        let (from, data) = transport.receive().await.unwrap();
        assert_eq!(from, source);
        assert_eq!(data, vec![1, 2, 3]);

        transport.send(source, &[9]).await.unwrap();
        assert_eq!(peer.next_sent().await, Some((source, vec![9])));
        assert!(peer.next_sent_within(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_close_cancels_receive() {
        let (transport, _peer) = MemoryTransport::pair();
        let transport = Arc::new(transport);

        let receiver = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.close();

        let result = receiver.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(
            transport.send(SocketAddrV4::new(Ipv4Addr::BROADCAST, 68), &[1]).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_memory_transport_injected_error() {
        let (transport, peer) = MemoryTransport::pair();
        peer.inject_error(TransportError::Oversized);
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Oversized)
        ));

        drop(peer);
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_udp_transport_loopback() {
        let options = BindOptions {
            packet_size: 8,
            ..Default::default()
        };
        let transport =
            UdpTransport::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), options).unwrap();
        let local = match transport.socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[1, 2, 3], local).unwrap();
        let (_, data) = transport.receive().await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);

        sender.send_to(&[0u8; 20], local).unwrap();
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Oversized)
        ));

        transport.close();
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Closed)
        ));
    }
}
