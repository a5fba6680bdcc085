use crate::{
    config::RelayConfig,
    datagram::{DatagramSocket, SocketFactory},
    error::{SocketError, TransientError, is_transient},
    events::{
        ClientEvent, ConnectionType, ManagerEvent, PacketDump, PacketInfo, PortRange, RemoteHint, SendMetrics, SocketCommand,
        SocketId, SocketOption,
    },
    socket_counter,
};
use bytes::{Bytes, BytesMut};
use futures_util::future::poll_fn;
use peerly_proto::{
    throttler::MessageThrottler,
    wire::{
        options::{Dscp, PacketOptions, apply_packet_options},
        rtp::rtp_dump_header,
        stun,
    },
};
use std::{
    collections::{HashSet, VecDeque},
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Instant,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninitialized,
    Connecting,
    Open,
    Error,
}

#[derive(Debug)]
struct PendingPacket {
    to: SocketAddr,
    data: BytesMut,
    packet_options: PacketOptions,
    id: u64,
    queued_at: Instant,
}

impl PendingPacket {
    fn new(data: Bytes, info: PacketInfo) -> Self {
        Self {
            to: info.destination,
            data: BytesMut::from(&data[..]),
            packet_options: info.packet_options,
            id: info.packet_id,
            queued_at: Instant::now(),
        }
    }
}

// A write the OS has not taken yet. `send_time` is when it was first attempted.
#[derive(Debug)]
struct InFlight {
    packet: PendingPacket,
    send_time: Instant,
}

#[derive(Debug, Default)]
struct SendStats {
    packets_total: u64,
    packets_delayed: u64,
    bytes_delayed: usize,
    bytes_delayed_max: usize,
}

impl SendStats {
    fn sent(&mut self) {
        self.packets_total = self.packets_total.saturating_add(1);
    }

    fn delay(&mut self, size: usize) {
        self.packets_delayed = self.packets_delayed.saturating_add(1);
        self.bytes_delayed = self.bytes_delayed.saturating_add(size);
        self.bytes_delayed_max = self.bytes_delayed_max.max(self.bytes_delayed);
    }

    fn undelay(&mut self, size: usize) {
        self.bytes_delayed = self.bytes_delayed.saturating_sub(size);
    }
}

enum Wakeup {
    Command(Option<SocketCommand>),
    Readable(io::Result<()>),
    Writable(io::Result<()>),
    ClientGone,
}

/// One UDP endpoint handed to an untrusted client.
///
/// Until a peer has completed a STUN binding exchange with us, only non-indication STUN messages may
/// be sent to it, and only as fast as the throttler allows. Inbound traffic from such a peer is
/// discarded unless it is STUN as well. Outbound packets complete in the order they were handed in,
/// dropped ones included.
pub struct RelaySocket<F: SocketFactory> {
    id: SocketId,
    state: SocketState,
    factory: Arc<F>,
    socket: Option<F::Socket>,
    config: Arc<RelayConfig>,
    client: Option<UnboundedSender<ClientEvent>>,
    manager: UnboundedSender<ManagerEvent>,
    recv_buffer: Vec<u8>,
    send_queue: VecDeque<PendingPacket>,
    send_pending: Option<InFlight>,
    last_dscp: Dscp,
    connected_peers: HashSet<SocketAddr>,
    throttler: MessageThrottler,
    dump_incoming_rtp: bool,
    dump_outgoing_rtp: bool,
    stats: SendStats,
}

impl<F: SocketFactory> RelaySocket<F> {
    pub(crate) fn new(
        id: SocketId,
        factory: Arc<F>,
        config: Arc<RelayConfig>,
        client: UnboundedSender<ClientEvent>,
        manager: UnboundedSender<ManagerEvent>,
    ) -> Self {
        Self {
            id,
            state: SocketState::Uninitialized,
            factory,
            socket: None,
            throttler: config.throttler(),
            recv_buffer: vec![0; config.read_buffer_size],
            config,
            client: Some(client),
            manager,
            send_queue: VecDeque::new(),
            send_pending: None,
            last_dscp: Dscp::CS0,
            connected_peers: HashSet::new(),
            dump_incoming_rtp: false,
            dump_outgoing_rtp: false,
            stats: SendStats::default(),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn is_connected_peer(&self, addr: &SocketAddr) -> bool {
        self.connected_peers.contains(addr)
    }

    pub fn queued_packets(&self) -> usize {
        self.send_queue.len()
    }

    #[instrument("RelaySocket::init", skip_all, fields(id = %self.id, %local_address))]
    pub fn init(&mut self, local_address: SocketAddr, range: PortRange, remote: &RemoteHint) -> Result<SocketAddr, SocketError> {
        self.state = SocketState::Connecting;

        let socket = match self.bind(local_address, range) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!(?range, "bind failed : {e}");
                self.on_error();
                return Err(e);
            }
        };

        if let Err(e) = socket.set_recv_buffer_size(self.config.recv_buffer_size) {
            tracing::warn!(size = self.config.recv_buffer_size, "failed to set receive buffer : {e}");
        }
        if let Err(e) = socket.set_send_buffer_size(self.config.send_buffer_size) {
            tracing::warn!(size = self.config.send_buffer_size, "failed to set send buffer : {e}");
        }

        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                tracing::error!("unable to get local address : {e}");
                self.on_error();
                return Err(e.into());
            }
        };

        self.socket = Some(socket);
        self.state = SocketState::Open;
        socket_counter!(1);
        tracing::info!(%local, remote = ?remote.hostname, "socket opened");

        self.notify(ClientEvent::SocketCreated { local, remote: remote.addr });
        Ok(local)
    }

    fn bind(&self, local: SocketAddr, range: PortRange) -> Result<F::Socket, SocketError> {
        if !range.is_valid() {
            return Err(SocketError::InvalidPortRange(range.min_port, range.max_port));
        }

        let mut socket = self.factory.create()?;
        if range.is_any() || local.port() != 0 {
            if !range.is_any() && !range.contains(local.port()) {
                return Err(SocketError::PortOutOfRange {
                    port: local.port(),
                    min: range.min_port,
                    max: range.max_port,
                });
            }
            socket.bind(local).map_err(|source| SocketError::BindFailed { addr: local, source })?;
            return Ok(socket);
        }

        let mut last_error = None;
        for port in range.min_port..=range.max_port {
            let addr = SocketAddr::new(local.ip(), port);
            match socket.bind(addr) {
                Ok(()) => return Ok(socket),
                Err(source) => {
                    tracing::debug!(%addr, "port unavailable : {source}");
                    last_error = Some(SocketError::BindFailed { addr, source });
                }
            }
            if port != range.max_port {
                socket = self.factory.create()?;
            }
        }

        Err(last_error.unwrap_or(SocketError::InvalidPortRange(range.min_port, range.max_port)))
    }

    fn notify(&mut self, event: ClientEvent) {
        let Some(client) = &self.client else {
            return;
        };

        if client.send(event).is_err() {
            tracing::debug!(id = %self.id, "client went away");
            self.client = None;
        }
    }

    pub fn send(&mut self, data: Bytes, info: PacketInfo) {
        if data.len() > self.config.max_packet_size() {
            tracing::error!(id = %self.id, "{}", SocketError::PacketTooBig(data.len()));
            return self.on_error();
        }

        // Sends racing with teardown are dropped quietly.
        if self.socket.is_none() {
            return;
        }

        self.stats.sent();
        metrics::counter!("p2p.udp.packets_sent").increment(1);

        let packet = PendingPacket::new(data, info);
        if self.send_pending.is_some() {
            self.stats.delay(packet.data.len());
            metrics::counter!("p2p.udp.packets_delayed").increment(1);
            self.send_queue.push_back(packet);
        } else {
            self.do_send(packet);
        }
    }

    fn do_send(&mut self, mut packet: PendingPacket) {
        let send_time = Instant::now();

        if !self.connected_peers.contains(&packet.to) {
            match stun::sniff(&packet.data) {
                Some(msg_type) if !msg_type.is_indication() => {}
                _ => {
                    tracing::error!(id = %self.id, "{}", SocketError::UnverifiedPeer(packet.to));
                    return self.on_error();
                }
            }

            if self.throttler.should_drop(packet.data.len()) {
                tracing::info!(id = %self.id, to = %packet.to, "throttling outgoing STUN message");
                metrics::counter!("p2p.udp.packets_throttled").increment(1);
                return self.send_complete(&packet, send_time);
            }
        }

        self.apply_dscp(packet.packet_options.dscp);

        let time_us = monotonic_us(Instant::now());
        if let Err(e) = apply_packet_options(&mut packet.data, &packet.packet_options.packet_time_params, time_us) {
            tracing::debug!(id = %self.id, "packet options not applied : {e}");
        }

        let result = match self.try_send(&packet) {
            Err(e) if is_transient(&e) => {
                tracing::debug!(id = %self.id, to = %packet.to, "retrying after transient error : {e}");
                self.try_send(&packet)
            }
            result => result,
        };

        if self.dump_outgoing_rtp {
            self.dump_rtp_packet(&packet.data, false);
        }

        match result {
            Err(e) if e.kind() == ErrorKind::WouldBlock => self.send_pending = Some(InFlight { packet, send_time }),
            result => self.handle_send_result(&packet, send_time, result),
        }
    }

    fn try_send(&self, packet: &PendingPacket) -> io::Result<usize> {
        match &self.socket {
            Some(socket) => socket.try_send_to(&packet.data, packet.to),
            None => Err(ErrorKind::NotConnected.into()),
        }
    }

    fn handle_send_result(&mut self, packet: &PendingPacket, send_time: Instant, result: io::Result<usize>) {
        if let Err(e) = result {
            let transient = TransientError::classify(&e);
            let code = transient.map_or("fatal", |t| t.as_str());
            metrics::counter!("p2p.udp.write_errors", "code" => code).increment(1);

            match transient {
                Some(_) => tracing::info!(id = %self.id, to = %packet.to, code, "send failed, dropping the packet : {e}"),
                None => {
                    tracing::error!(id = %self.id, to = %packet.to, "error when sending data : {e}");
                    return self.on_error();
                }
            }
        }

        metrics::histogram!("p2p.udp.send_duration").record(send_time.elapsed().as_secs_f64());
        self.send_complete(packet, send_time);
    }

    fn send_complete(&mut self, packet: &PendingPacket, send_time: Instant) {
        self.notify(ClientEvent::SendComplete(SendMetrics {
            packet_id: packet.id,
            transport_sequence_number: packet.packet_options.transport_sequence_number,
            send_time,
        }));
    }

    /// Resumes the in-flight write once the OS can take it, then drains whatever queued up behind it.
    pub fn on_send_ready(&mut self) {
        let Some(InFlight { packet, send_time }) = self.send_pending.take() else {
            return;
        };

        match self.try_send(&packet) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.send_pending = Some(InFlight { packet, send_time });
                return;
            }
            result => self.handle_send_result(&packet, send_time, result),
        }

        while self.state == SocketState::Open && self.send_pending.is_none() {
            let Some(packet) = self.send_queue.pop_front() else {
                break;
            };
            self.stats.undelay(packet.data.len());
            metrics::histogram!("p2p.udp.queue_delay").record(packet.queued_at.elapsed().as_secs_f64());
            self.do_send(packet);
        }
    }

    /// Drains the OS socket until it would block.
    pub fn on_readable(&mut self) {
        while self.state == SocketState::Open {
            let Some(socket) = &self.socket else {
                return;
            };

            match socket.try_recv_from(&mut self.recv_buffer) {
                Ok((0, _)) => continue,
                Ok((len, from)) => {
                    let data = Bytes::copy_from_slice(&self.recv_buffer[..len]);
                    self.handle_read(from, data);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if is_transient(&e) => tracing::debug!(id = %self.id, "ignoring transient receive error : {e}"),
                Err(e) => {
                    tracing::error!(id = %self.id, "error when reading from socket : {e}");
                    return self.on_error();
                }
            }
        }
    }

    fn handle_read(&mut self, from: SocketAddr, data: Bytes) {
        if !self.connected_peers.contains(&from) {
            match stun::sniff(&data) {
                Some(msg_type) if msg_type.is_request_or_response() => {
                    tracing::debug!(id = %self.id, %from, "peer connected");
                    self.connected_peers.insert(from);
                }
                Some(msg_type) if !msg_type.is_indication() => {}
                _ => {
                    tracing::error!(id = %self.id, %from, "received unexpected data packet before STUN binding is finished");
                    return;
                }
            }
        }

        if self.dump_incoming_rtp {
            self.dump_rtp_packet(&data, true);
        }

        self.notify(ClientEvent::DataReceived {
            from,
            data,
            timestamp: Instant::now(),
        });
    }

    fn apply_dscp(&mut self, dscp: Dscp) {
        if dscp == Dscp::NoChange || dscp == self.last_dscp || self.last_dscp == Dscp::NoChange {
            return;
        }

        let Some(socket) = &self.socket else {
            return;
        };

        match socket.set_dscp(dscp) {
            Ok(()) => self.last_dscp = dscp,
            Err(e) if is_transient(&e) => tracing::debug!(id = %self.id, ?dscp, "transient failure setting dscp : {e}"),
            Err(e) => {
                // Never retried for this socket.
                tracing::warn!(id = %self.id, ?dscp, "failed to set dscp : {e}");
                self.last_dscp = Dscp::NoChange;
            }
        }
    }

    pub fn set_option(&mut self, option: SocketOption, value: i32) -> Result<(), SocketError> {
        if self.state != SocketState::Open {
            return Err(SocketError::NotOpen);
        }

        let socket = self.socket.as_ref().ok_or(SocketError::NotOpen)?;
        match option {
            SocketOption::RecvBuf => socket.set_recv_buffer_size(value.max(0) as usize)?,
            SocketOption::SendBuf => socket.set_send_buffer_size(value.max(0) as usize)?,
            SocketOption::Dscp => self.apply_dscp(Dscp::from(value)),
        }
        Ok(())
    }

    pub fn set_rtp_dump(&mut self, incoming: bool, outgoing: bool, enable: bool) {
        if incoming {
            self.dump_incoming_rtp = enable;
        }
        if outgoing {
            self.dump_outgoing_rtp = enable;
        }
    }

    pub fn set_ice_bandwidth(&mut self, bytes_per_period: usize) {
        self.throttler.set_bandwidth(bytes_per_period);
    }

    fn dump_rtp_packet(&self, data: &[u8], incoming: bool) {
        let Some(dump) = rtp_dump_header(data) else {
            return;
        };

        let _ = self.manager.send(ManagerEvent::DumpPacket(PacketDump {
            header: Bytes::copy_from_slice(&data[dump.header]),
            packet_length: dump.packet_length,
            incoming,
        }));
    }

    // Nothing is rebound here, a binding that no longer resolves ends the socket.
    fn on_network_changed(&mut self, connection_type: ConnectionType) {
        let Some(socket) = &self.socket else {
            return;
        };

        match socket.local_addr() {
            Ok(local) => tracing::info!(id = %self.id, %local, ?connection_type, "network changed, binding still usable"),
            Err(e) => {
                tracing::error!(id = %self.id, ?connection_type, "binding lost after network change : {e}");
                self.on_error();
            }
        }
    }

    /// Tears the socket down. Safe to call any number of times.
    pub fn on_error(&mut self) {
        if self.state == SocketState::Error {
            return;
        }

        if self.state == SocketState::Open {
            socket_counter!(-1);
        }

        self.socket = None;
        self.send_queue.clear();
        self.send_pending = None;
        self.state = SocketState::Error;

        if let Some(client) = self.client.take() {
            let _ = client.send(ClientEvent::ConnectionError);
        }

        tracing::info!(id = %self.id, "socket closed");
        let _ = self.manager.send(ManagerEvent::Destroy(self.id));
    }

    /// Closed by the client, so no `ConnectionError` is reported back.
    pub fn close(&mut self) {
        self.client = None;
        self.on_error();
    }

    pub fn process_command(&mut self, command: SocketCommand) {
        match command {
            SocketCommand::Send(data, info) => self.send(data, info),
            SocketCommand::SetOption(option, value) => {
                if let Err(e) = self.set_option(option, value) {
                    tracing::warn!(id = %self.id, ?option, value, "set_option failed : {e}");
                }
            }
            SocketCommand::StartRtpDump { incoming, outgoing } => self.set_rtp_dump(incoming, outgoing, true),
            SocketCommand::StopRtpDump { incoming, outgoing } => self.set_rtp_dump(incoming, outgoing, false),
            SocketCommand::SetIceBandwidth(bytes) => self.set_ice_bandwidth(bytes),
            SocketCommand::NetworkChanged(connection_type) => self.on_network_changed(connection_type),
            SocketCommand::Close => self.close(),
        }
    }

    pub async fn run(mut self, mut commands: UnboundedReceiver<SocketCommand>) {
        while self.state == SocketState::Open {
            let (Some(socket), Some(client)) = (&self.socket, &self.client) else {
                break;
            };
            let writing = self.send_pending.is_some();

            let wakeup = tokio::select! {
                command = commands.recv() => Wakeup::Command(command),
                ready = poll_fn(|cx| socket.poll_recv_ready(cx)) => Wakeup::Readable(ready),
                ready = poll_fn(|cx| socket.poll_send_ready(cx)), if writing => Wakeup::Writable(ready),
                _ = client.closed() => Wakeup::ClientGone,
            };

            match wakeup {
                Wakeup::Command(Some(command)) => self.process_command(command),
                Wakeup::Command(None) | Wakeup::ClientGone => self.close(),
                Wakeup::Readable(Ok(())) => self.on_readable(),
                Wakeup::Writable(Ok(())) => self.on_send_ready(),
                Wakeup::Readable(Err(e)) | Wakeup::Writable(Err(e)) => {
                    tracing::error!(id = %self.id, "socket readiness error : {e}");
                    self.on_error();
                }
            }
        }

        // No-op unless the loop ended on a detached client.
        self.close();
    }
}

impl<F: SocketFactory> Drop for RelaySocket<F> {
    fn drop(&mut self) {
        if self.state == SocketState::Open {
            socket_counter!(-1);
        }

        metrics::histogram!("p2p.udp.max_consecutive_bytes_delayed").record(self.stats.bytes_delayed_max as f64);
        if self.stats.packets_total > 0 {
            let percent = self.stats.packets_delayed as f64 * 100.0 / self.stats.packets_total as f64;
            metrics::histogram!("p2p.udp.percent_packets_delayed").record(percent);
        }
    }
}

fn send_time_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

// Microseconds on a process wide monotonic clock, immune to wall clock steps.
fn monotonic_us(now: Instant) -> u64 {
    now.saturating_duration_since(send_time_epoch()).as_micros() as u64
}
