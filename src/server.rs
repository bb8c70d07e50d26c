//! The per-subnet DHCP server instance.
//!
//! A [`DhcpServer`] owns one [`Transport`], one [`LeaseTable`] and the
//! [`Allocator`] for its subnet. [`DhcpServer::run`] receives datagrams,
//! decides on a response under the lease table lock, and sends it. A sweep
//! timer removes expired offers and leases once per second while running.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::allocation::Allocator;
use crate::config::{DHCP_SERVER_PORT, PolicyMode, ServerConfig};
use crate::error::Result;
use crate::lease::{Client, ClientState, Clients, INFINITE_LEASE, LeaseTable};
use crate::options::{DhcpOption, MessageType};
use crate::packet::{DhcpPacket, Opcode};
use crate::persistence::{LeaseFile, load_clients};
use crate::transport::{Transport, TransportError, UdpTransport};

pub const DHCP_CLIENT_PORT: u16 = 68;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 64;

/// Status notifications published by a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Started,
    /// The lease table changed.
    ClientsChanged,
    /// The server stopped. `reason` is set when a fatal error caused it.
    Stopped { reason: Option<String> },
}

/// A hook that may rewrite an outgoing OFFER or ACK.
///
/// Interceptors run after option policies, in registration order.
pub trait MessageInterceptor: Send + Sync {
    fn intercept(&self, request: &DhcpPacket, reply: &mut DhcpPacket);
}

impl<F> MessageInterceptor for F
where
    F: Fn(&DhcpPacket, &mut DhcpPacket) + Send + Sync,
{
    fn intercept(&self, request: &DhcpPacket, reply: &mut DhcpPacket) {
        self(request, reply)
    }
}

/// What the state machine decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Response {
    None,
    Offer(Ipv4Addr),
    Ack(Ipv4Addr),
    Nak(&'static str),
    InformAck,
}

#[derive(Debug)]
struct Decision {
    response: Response,
    changed: bool,
}

impl Decision {
    fn silent() -> Self {
        Self {
            response: Response::None,
            changed: false,
        }
    }

    fn new(response: Response, changed: bool) -> Self {
        Self { response, changed }
    }
}

pub struct DhcpServer {
    config: ServerConfig,
    allocator: Allocator,
    leases: Arc<LeaseTable>,
    lease_file: Option<LeaseFile>,
    transport: Arc<dyn Transport>,
    interceptors: Vec<Box<dyn MessageInterceptor>>,
    events: broadcast::Sender<ServerEvent>,
}

impl DhcpServer {
    /// Creates a server on an already bound transport.
    ///
    /// The lease table is loaded from `config.leases_file` when set.
    pub async fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let allocator = config.allocator()?;

        let clients = match &config.leases_file {
            Some(path) => load_clients(path, &allocator).await,
            None => Clients::new(),
        };
        let leases = Arc::new(LeaseTable::new(clients));
        let lease_file = config
            .leases_file
            .as_ref()
            .map(|path| LeaseFile::new(path.clone(), Arc::clone(&leases)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            allocator,
            leases,
            lease_file,
            transport,
            interceptors: Vec::new(),
            events,
        })
    }

    /// Binds a UDP transport to the configured endpoint and creates a server on it.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.endpoint(), config.bind_options())?;
        Self::new(config, Arc::new(transport)).await
    }

    /// Registers an interceptor for outgoing OFFER and ACK messages.
    pub fn with_interceptor(mut self, interceptor: impl MessageInterceptor + 'static) -> Self {
        self.interceptors.push(Box::new(interceptor));
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    pub fn lease_file(&self) -> Option<&LeaseFile> {
        self.lease_file.as_ref()
    }

    /// Returns a copy of every lease record.
    pub async fn clients(&self) -> Vec<Client> {
        self.leases.snapshot().await
    }

    /// Serves until [`stop`](Self::stop) is called or the transport fails.
    ///
    /// # Errors
    ///
    /// Returns the fatal transport error that stopped the server. The same
    /// error is published as [`ServerEvent::Stopped`].
    pub async fn run(&self) -> Result<()> {
        let span = info_span!("server", name = %self.config.name);
        self.serve().instrument(span).await
    }

    async fn serve(&self) -> Result<()> {
        let pool = self.allocator.pool();
        info!(
            "DHCP server listening on {} (pool {}, {} addresses)",
            self.config.endpoint(),
            pool,
            pool.len()
        );
        let _ = self.events.send(ServerEvent::Started);

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = sweep.tick() => {
                    self.sweep_at(Utc::now()).await;
                }
                received = self.transport.receive() => match received {
                    Ok((source, data)) => self.handle_datagram(source, &data).await,
                    Err(TransportError::Closed) => break Ok(()),
                    Err(e) if !e.is_fatal() => warn!("Receive failed: {}", e),
                    Err(e) => {
                        error!("Transport failed, stopping: {}", e);
                        break Err(e);
                    }
                },
            }
        };
        drop(sweep);

        self.transport.close();
        if let Some(lease_file) = &self.lease_file {
            lease_file.request_flush();
            lease_file.wait_idle().await;
        }

        let reason = outcome.as_ref().err().map(ToString::to_string);
        info!("DHCP server stopped");
        let _ = self.events.send(ServerEvent::Stopped { reason });

        outcome.map_err(Into::into)
    }

    /// Stops a running server. The lease table is flushed before
    /// [`run`](Self::run) returns.
    pub fn stop(&self) {
        self.transport.close();
    }

    async fn handle_datagram(&self, source: SocketAddrV4, data: &[u8]) {
        let packet = match DhcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", source, e);
                return;
            }
        };

        if packet.op != Opcode::BootRequest {
            debug!("Ignoring BOOTREPLY from {}", source);
            return;
        }

        match packet.message_type() {
            Some(message_type) => {
                info!("{} from {} ({})", message_type, packet.format_mac(), source);
            }
            None => {
                debug!("Ignoring BOOTP request from {}", source);
                return;
            }
        }

        let Some((reply, destination)) = self.process(&packet).await else {
            return;
        };

        let encoded = reply.encode_with_minimum(self.config.minimum_packet_size);
        if let Err(e) = self.transport.send(destination, &encoded).await {
            warn!("Failed to send reply to {}: {}", destination, e);
        }
    }

    /// Runs one request through the state machine.
    ///
    /// Returns the reply and where to send it, or `None` when the request
    /// gets no response.
    pub async fn process(&self, request: &DhcpPacket) -> Option<(DhcpPacket, SocketAddrV4)> {
        let message_type = request.message_type()?;
        let now = Utc::now();

        let decision = self
            .leases
            .transact(|clients| match message_type {
                MessageType::Discover => self.discover(clients, request, now),
                MessageType::Request => self.request(clients, request, now),
                MessageType::Decline => self.decline(clients, request),
                MessageType::Release => self.release(clients, request),
                MessageType::Inform => Decision::new(Response::InformAck, false),
                other => {
                    debug!("Ignoring {} message", other);
                    Decision::silent()
                }
            })
            .await;

        if decision.changed {
            self.notify_changed();
        }

        self.build_reply(request, decision.response)
    }

    fn discover(&self, clients: &mut Clients, request: &DhcpPacket, now: DateTime<Utc>) -> Decision {
        let mac = request.format_mac();
        let identifier = request.client_id();

        if let Some(client) = clients.get_mut(&identifier) {
            client.refresh_from(request);
            match client.state {
                ClientState::Offered | ClientState::Assigned => {
                    let ip = client.ip_address;
                    client.offer(ip, now);
                    return Decision::new(Response::Offer(ip), true);
                }
                ClientState::Released if client.has_address() => {
                    let ip = client.ip_address;
                    client.offer(ip, now);
                    return Decision::new(Response::Offer(ip), true);
                }
                ClientState::Released => {}
            }
        }

        let Some(ip) = self.allocator.allocate(clients, request) else {
            warn!("No free address for {}, not offering", mac);
            return Decision::silent();
        };

        let mut client = clients
            .remove(&identifier)
            .unwrap_or_else(|| Client::from_packet(request));
        client.offer(ip, now);
        clients.insert(client);
        Decision::new(Response::Offer(ip), true)
    }

    fn request(&self, clients: &mut Clients, request: &DhcpPacket, now: DateTime<Utc>) -> Decision {
        let mac = request.format_mac();
        let identifier = request.client_id();
        let lease_duration = self.config.lease_duration();

        match request.server_identifier() {
            Some(server_id) if server_id == self.config.address => {
                let requested = request.requested_ip();
                match clients.get_mut(&identifier) {
                    Some(client)
                        if client.state == ClientState::Offered
                            && requested == Some(client.ip_address) =>
                    {
                        client.refresh_from(request);
                        let ip = client.ip_address;
                        client.assign(ip, lease_duration, now);
                        Decision::new(Response::Ack(ip), true)
                    }
                    _ => {
                        let removed = clients.remove(&identifier).is_some();
                        Decision::new(Response::Nak("requested address was not offered"), removed)
                    }
                }
            }
            Some(server_id) => {
                let had_offer = clients
                    .get(&identifier)
                    .is_some_and(|client| client.state == ClientState::Offered);
                if had_offer {
                    clients.remove(&identifier);
                    info!("{} chose server {}, withdrawing offer", mac, server_id);
                }
                Decision::new(Response::None, had_offer)
            }
            None if !request.ciaddr.is_unspecified() => {
                self.renew(clients, request, request.ciaddr, lease_duration, now)
            }
            None => {
                let requested = request.requested_ip();
                match clients.get_mut(&identifier) {
                    Some(client)
                        if client.state == ClientState::Assigned
                            && requested == Some(client.ip_address) =>
                    {
                        client.refresh_from(request);
                        let ip = client.ip_address;
                        client.assign(ip, lease_duration, now);
                        Decision::new(Response::Ack(ip), true)
                    }
                    _ => {
                        let removed = clients.remove(&identifier).is_some();
                        Decision::new(Response::Nak("no matching lease"), removed)
                    }
                }
            }
        }
    }

    /// Handles a RENEWING or REBINDING request for `ciaddr`.
    fn renew(
        &self,
        clients: &mut Clients,
        request: &DhcpPacket,
        ciaddr: Ipv4Addr,
        lease_duration: u32,
        now: DateTime<Utc>,
    ) -> Decision {
        let mac = request.format_mac();
        let identifier = request.client_id();

        if let Some(client) = clients.get_mut(&identifier)
            && client.state == ClientState::Assigned
            && client.ip_address == ciaddr
        {
            client.refresh_from(request);
            client.assign(ciaddr, lease_duration, now);
            return Decision::new(Response::Ack(ciaddr), true);
        }

        if !self.allocator.is_assignable(ciaddr) {
            warn!("{} renewing {} which is not ours to lease", mac, ciaddr);
            return Decision::silent();
        }

        if let Some(holder) = clients.holder_of(ciaddr)
            && holder.identifier != identifier
            && holder.state != ClientState::Released
        {
            warn!(
                "{} renewing {} which is held by {}",
                mac,
                ciaddr,
                holder.identifier_hex()
            );
            return Decision::silent();
        }

        clients.remove(&identifier);
        clients.reclaim(ciaddr);
        let mut client = Client::from_packet(request);
        client.assign(ciaddr, lease_duration, now);
        clients.insert(client);
        info!("Adopted lease {} for {}", ciaddr, mac);
        Decision::new(Response::Ack(ciaddr), true)
    }

    /// True if the request names no server or names us.
    fn addressed_to_us(&self, request: &DhcpPacket) -> bool {
        request
            .server_identifier()
            .is_none_or(|server_id| server_id == self.config.address)
    }

    fn decline(&self, clients: &mut Clients, request: &DhcpPacket) -> Decision {
        let mac = request.format_mac();
        if !self.addressed_to_us(request) {
            return Decision::silent();
        }

        match clients.remove(&request.client_id()) {
            Some(client) => {
                warn!("{} declined {}", mac, client.ip_address);
                Decision::new(Response::None, true)
            }
            None => {
                warn!("DECLINE from unknown client {}", mac);
                Decision::silent()
            }
        }
    }

    fn release(&self, clients: &mut Clients, request: &DhcpPacket) -> Decision {
        let mac = request.format_mac();
        if !self.addressed_to_us(request) {
            return Decision::silent();
        }

        let Some(client) = clients.get_mut(&request.client_id()) else {
            warn!("RELEASE from unknown client {}", mac);
            return Decision::silent();
        };

        if client.ip_address == request.ciaddr {
            info!("Released {} from {}", client.ip_address, mac);
        } else {
            warn!(
                "{} released {} but holds {}",
                mac, request.ciaddr, client.ip_address
            );
            client.ip_address = Ipv4Addr::UNSPECIFIED;
        }
        client.state = ClientState::Released;
        Decision::new(Response::None, true)
    }

    /// Removes every offer and lease that has run out at `now`.
    ///
    /// Returns how many records were removed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let offer_expiration = self.config.offer_expiration();
        let removed = self
            .leases
            .transact(|clients| clients.remove_where(|client| client.is_expired(now, offer_expiration)))
            .await;

        for client in &removed {
            info!(
                "Expired {} {} ({})",
                client.state,
                client.ip_address,
                client.identifier_hex()
            );
        }
        if !removed.is_empty() {
            self.notify_changed();
        }
        removed.len()
    }

    fn notify_changed(&self) {
        let _ = self.events.send(ServerEvent::ClientsChanged);
        if let Some(lease_file) = &self.lease_file {
            lease_file.request_flush();
        }
    }

    fn build_reply(
        &self,
        request: &DhcpPacket,
        response: Response,
    ) -> Option<(DhcpPacket, SocketAddrV4)> {
        let mac = request.format_mac();

        let reply = match response {
            Response::None => return None,
            Response::Nak(reason) => {
                let mut options = vec![DhcpOption::ServerIdentifier(self.config.address)];
                self.echo_relay_info(request, &mut options);
                let nak = DhcpPacket::create_reply(
                    request,
                    MessageType::Nak,
                    Ipv4Addr::UNSPECIFIED,
                    Ipv4Addr::UNSPECIFIED,
                    options,
                );
                warn!("NAK to {}: {}", mac, reason);
                let destination = if request.giaddr.is_unspecified() {
                    SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
                } else {
                    SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
                };
                return Some((nak, destination));
            }
            Response::Offer(ip) => {
                info!("OFFER {} to {}", ip, mac);
                self.lease_reply(request, MessageType::Offer, ip)
            }
            Response::Ack(ip) => {
                info!("ACK {} to {}", ip, mac);
                self.lease_reply(request, MessageType::Ack, ip)
            }
            Response::InformAck => {
                let mut options = vec![
                    DhcpOption::ServerIdentifier(self.config.address),
                    DhcpOption::SubnetMask(self.config.subnet_mask),
                ];
                self.apply_policies(request, &mut options);
                self.echo_relay_info(request, &mut options);
                let mut ack = DhcpPacket::create_reply(
                    request,
                    MessageType::Ack,
                    Ipv4Addr::UNSPECIFIED,
                    self.config.address,
                    options,
                );
                self.intercept(request, &mut ack);
                info!("INFORM response to {}", mac);

                if !request.ciaddr.is_unspecified() {
                    return Some((ack, SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)));
                }
                ack
            }
        };

        Some((reply, route(request)))
    }

    fn lease_reply(&self, request: &DhcpPacket, message_type: MessageType, ip: Ipv4Addr) -> DhcpPacket {
        let lease = self.config.lease_duration();
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.config.address),
            DhcpOption::LeaseTime(lease),
        ];
        if lease != INFINITE_LEASE {
            options.push(DhcpOption::RenewalTime(lease / 2));
            options.push(DhcpOption::RebindingTime((lease as u64 * 7 / 8) as u32));
        }
        options.push(DhcpOption::SubnetMask(self.config.subnet_mask));
        self.apply_policies(request, &mut options);
        self.echo_relay_info(request, &mut options);

        let mut reply =
            DhcpPacket::create_reply(request, message_type, ip, self.config.address, options);
        self.intercept(request, &mut reply);
        reply
    }

    /// Adds forced options, and default options the client asked for,
    /// unless the reply already carries that code.
    fn apply_policies(&self, request: &DhcpPacket, options: &mut Vec<DhcpOption>) {
        for policy in &self.config.options {
            let code = policy.option.option_code();
            let wanted = match policy.mode {
                PolicyMode::Force => true,
                PolicyMode::Default => request.requests_option(code),
            };
            if wanted && !options.iter().any(|option| option.option_code() == code) {
                options.push(policy.option.clone());
            }
        }
    }

    fn echo_relay_info(&self, request: &DhcpPacket, options: &mut Vec<DhcpOption>) {
        if let Some(relay_info) = request.relay_agent_info() {
            options.push(DhcpOption::RelayAgentInformation(relay_info.clone()));
        }
    }

    fn intercept(&self, request: &DhcpPacket, reply: &mut DhcpPacket) {
        for interceptor in &self.interceptors {
            interceptor.intercept(request, reply);
        }
    }
}

/// Destination of an OFFER or ACK: the relay agent, else the client's
/// current address, else broadcast.
fn route(request: &DhcpPacket) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
    } else if !request.ciaddr.is_unspecified() {
        SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
    }
}
