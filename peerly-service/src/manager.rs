use crate::{
    config::RelayConfig,
    datagram::{SocketFactory, UdpSocketFactory},
    error::{ManagerError, SocketError},
    events::{
        ClientEvent, ConnectionType, ManagerEvent, PacketDump, PacketInfo, PortRange, RemoteHint, SocketCommand, SocketId,
        SocketOption, SocketType,
    },
    socket::RelaySocket,
};
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::Instrument;

/// Client side of a socket owned by a [`SocketManager`]. Dropping it closes the socket.
#[derive(Debug)]
pub struct SocketHandle {
    id: SocketId,
    local: SocketAddr,
    commands: UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn command(&self, command: SocketCommand) -> Result<(), SocketError> {
        self.commands.send(command).map_err(|_| SocketError::NotOpen)
    }

    pub fn send(&self, data: Bytes, info: PacketInfo) -> Result<(), SocketError> {
        self.command(SocketCommand::Send(data, info))
    }

    pub fn set_option(&self, option: SocketOption, value: i32) -> Result<(), SocketError> {
        self.command(SocketCommand::SetOption(option, value))
    }

    pub fn close(self) {}
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(SocketCommand::Close);
    }
}

/// Owns every relay socket and the state shared between them.
pub struct SocketManager<F: SocketFactory = UdpSocketFactory> {
    config: Arc<RelayConfig>,
    factory: Arc<F>,
    sockets: DashMap<SocketId, UnboundedSender<SocketCommand>>,
    next_id: AtomicU64,
    dump_incoming_rtp: AtomicBool,
    dump_outgoing_rtp: AtomicBool,
    ice_bandwidth: AtomicUsize,
    // Handed to every socket so it can report back by id
    events: UnboundedSender<ManagerEvent>,
    dump_sink: Option<UnboundedSender<PacketDump>>,
}

impl SocketManager<UdpSocketFactory> {
    pub fn udp(config: RelayConfig) -> Arc<Self> {
        Self::new(config, UdpSocketFactory)
    }
}

impl<F: SocketFactory> SocketManager<F> {
    /// Must be called from within the tokio runtime.
    pub fn new(config: RelayConfig, factory: F) -> Arc<Self> {
        Self::build(config, factory, None)
    }

    /// Recorded RTP headers are forwarded to `sink`.
    pub fn with_dump_sink(config: RelayConfig, factory: F, sink: UnboundedSender<PacketDump>) -> Arc<Self> {
        Self::build(config, factory, Some(sink))
    }

    fn build(config: RelayConfig, factory: F, dump_sink: Option<UnboundedSender<PacketDump>>) -> Arc<Self> {
        let (events, recv) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            ice_bandwidth: AtomicUsize::new(config.ice_bandwidth),
            config: Arc::new(config),
            factory: Arc::new(factory),
            sockets: DashMap::new(),
            next_id: AtomicU64::new(1),
            dump_incoming_rtp: AtomicBool::new(false),
            dump_outgoing_rtp: AtomicBool::new(false),
            events,
            dump_sink,
        });

        tokio::spawn(Self::handle_events(Arc::downgrade(&manager), recv));
        manager
    }

    async fn handle_events(manager: Weak<Self>, mut recv: UnboundedReceiver<ManagerEvent>) {
        while let Some(event) = recv.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };

            match event {
                ManagerEvent::Destroy(id) => manager.destroy_socket(id),
                ManagerEvent::DumpPacket(dump) => manager.dump_packet(dump),
            }
        }
    }

    pub fn create_socket(
        &self,
        socket_type: SocketType,
        local: SocketAddr,
        range: PortRange,
        remote: RemoteHint,
        client: UnboundedSender<ClientEvent>,
    ) -> Result<SocketHandle, ManagerError> {
        if socket_type != SocketType::Udp {
            return Err(ManagerError::UnsupportedSocketType(socket_type));
        }

        let id = SocketId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut socket = RelaySocket::new(id, self.factory.clone(), self.config.clone(), client, self.events.clone());
        let local = socket.init(local, range, &remote)?;

        // Registered before the shared settings are read. A toggle racing with us either lands in
        // the snapshot below or is broadcast into the queue `run` drains first.
        let (commands, recv) = mpsc::unbounded_channel();
        self.sockets.insert(id, commands.clone());

        let ice_bandwidth = self.ice_bandwidth.load(Ordering::SeqCst);
        if ice_bandwidth != self.config.ice_bandwidth {
            socket.set_ice_bandwidth(ice_bandwidth);
        }
        socket.set_rtp_dump(
            self.dump_incoming_rtp.load(Ordering::SeqCst),
            self.dump_outgoing_rtp.load(Ordering::SeqCst),
            true,
        );

        tokio::spawn(socket.run(recv).instrument(tracing::info_span!("RelaySocket", %id, %local)));

        tracing::info!(%id, %local, "socket created");
        Ok(SocketHandle { id, local, commands })
    }

    pub fn destroy_socket(&self, id: SocketId) {
        if self.sockets.remove(&id).is_some() {
            tracing::debug!(%id, "socket removed");
        }
    }

    fn broadcast(&self, command: impl Fn() -> SocketCommand) {
        for entry in self.sockets.iter() {
            let _ = entry.value().send(command());
        }
    }

    pub fn on_network_changed(&self, connection_type: ConnectionType) {
        tracing::info!(?connection_type, sockets = self.sockets.len(), "network changed");
        self.broadcast(|| SocketCommand::NetworkChanged(connection_type));
    }

    pub fn start_rtp_dump(&self, incoming: bool, outgoing: bool) {
        if incoming {
            self.dump_incoming_rtp.store(true, Ordering::SeqCst);
        }
        if outgoing {
            self.dump_outgoing_rtp.store(true, Ordering::SeqCst);
        }
        self.broadcast(|| SocketCommand::StartRtpDump { incoming, outgoing });
    }

    pub fn stop_rtp_dump(&self, incoming: bool, outgoing: bool) {
        if incoming {
            self.dump_incoming_rtp.store(false, Ordering::SeqCst);
        }
        if outgoing {
            self.dump_outgoing_rtp.store(false, Ordering::SeqCst);
        }
        self.broadcast(|| SocketCommand::StopRtpDump { incoming, outgoing });
    }

    pub fn set_ice_bandwidth(&self, bytes_per_period: usize) {
        self.ice_bandwidth.store(bytes_per_period, Ordering::SeqCst);
        self.broadcast(|| SocketCommand::SetIceBandwidth(bytes_per_period));
    }

    pub fn dump_packet(&self, dump: PacketDump) {
        if let Some(sink) = &self.dump_sink {
            let _ = sink.send(dump);
        }
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn shutdown(&self) {
        tracing::info!(sockets = self.sockets.len(), "shutting down");
        self.broadcast(|| SocketCommand::Close);
        self.sockets.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::MockFactory;
    use peerly_proto::wire::MAGIC_COOKIE;
    use std::{io::ErrorKind, time::Duration};
    use tokio::time::timeout;

    fn binding(msg_type: u16) -> Bytes {
        let mut msg = vec![];
        msg.extend_from_slice(&msg_type.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&rand::random::<[u8; 12]>());
        msg.into()
    }

    fn info(destination: SocketAddr, packet_id: u64) -> PacketInfo {
        PacketInfo {
            destination,
            packet_options: Default::default(),
            packet_id,
        }
    }

    async fn next(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
        timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap()
    }

    async fn wait_for_count<F: SocketFactory>(manager: &SocketManager<F>, count: usize) {
        for _ in 0..100 {
            if manager.socket_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} sockets, have {}", manager.socket_count());
    }

    fn any_local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn rejects_tcp_sockets() {
        let manager = SocketManager::new(RelayConfig::default().unwrap(), MockFactory::default());
        let (client, _events) = mpsc::unbounded_channel();

        let res = manager.create_socket(SocketType::StunTcpClient, any_local(), PortRange::default(), RemoteHint::default(), client);
        assert!(matches!(res, Err(ManagerError::UnsupportedSocketType(SocketType::StunTcpClient))));
        assert_eq!(manager.socket_count(), 0);
    }

    #[tokio::test]
    async fn init_failure_registers_nothing() {
        let factory = MockFactory::default();
        factory.wire().occupied.insert(5000);
        let manager = SocketManager::new(RelayConfig::default().unwrap(), factory);
        let (client, _events) = mpsc::unbounded_channel();

        let local = "127.0.0.1:5000".parse().unwrap();
        let res = manager.create_socket(SocketType::Udp, local, PortRange::new(5000, 5000), RemoteHint::default(), client);
        assert!(matches!(res, Err(ManagerError::InitFailed(SocketError::BindFailed { .. }))));
        assert_eq!(manager.socket_count(), 0);
    }

    #[tokio::test]
    async fn socket_is_removed_on_teardown() {
        let factory = MockFactory::default();
        let manager = SocketManager::new(RelayConfig::default().unwrap(), factory.clone());
        let (client, mut events) = mpsc::unbounded_channel();

        let handle = manager
            .create_socket(SocketType::Udp, any_local(), PortRange::default(), RemoteHint::default(), client)
            .unwrap();
        assert!(matches!(next(&mut events).await, ClientEvent::SocketCreated { .. }));
        assert_eq!(manager.socket_count(), 1);

        factory.wire().local_addr_error = Some(ErrorKind::NotConnected);
        manager.on_network_changed(ConnectionType::Ethernet);
        assert_eq!(next(&mut events).await, ClientEvent::ConnectionError);
        wait_for_count(&manager, 0).await;

        assert!(handle.send(binding(0x0001), info(any_local(), 1)).is_err());
    }

    #[tokio::test]
    async fn dropping_handle_closes_socket() {
        let manager = SocketManager::new(RelayConfig::default().unwrap(), MockFactory::default());
        let (client, mut events) = mpsc::unbounded_channel();

        let handle = manager
            .create_socket(SocketType::Udp, any_local(), PortRange::default(), RemoteHint::default(), client)
            .unwrap();
        assert!(matches!(next(&mut events).await, ClientEvent::SocketCreated { .. }));

        drop(handle);
        wait_for_count(&manager, 0).await;
        // closed by the client, so the channel just ends
        assert_eq!(timeout(Duration::from_secs(5), events.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ice_bandwidth_applies_to_new_sockets() {
        let factory = MockFactory::default();
        let manager = SocketManager::new(RelayConfig::default().unwrap(), factory.clone());
        manager.set_ice_bandwidth(10);

        let (client, mut events) = mpsc::unbounded_channel();
        let handle = manager
            .create_socket(SocketType::Udp, any_local(), PortRange::default(), RemoteHint::default(), client)
            .unwrap();
        assert!(matches!(next(&mut events).await, ClientEvent::SocketCreated { .. }));

        let peer = "10.0.0.2:3478".parse().unwrap();
        handle.send(binding(0x0001), info(peer, 1)).unwrap();
        assert!(matches!(next(&mut events).await, ClientEvent::SendComplete(m) if m.packet_id == 1));
        assert!(factory.wire().sent.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bandwidth_change_racing_creation_reaches_every_socket() {
        let factory = MockFactory::default();
        let manager = SocketManager::new(RelayConfig::default().unwrap(), factory.clone());

        let creator = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut sockets = vec![];
                for _ in 0..200 {
                    let (client, events) = mpsc::unbounded_channel();
                    let handle = manager
                        .create_socket(SocketType::Udp, any_local(), PortRange::default(), RemoteHint::default(), client)
                        .unwrap();
                    sockets.push((handle, events));
                }
                sockets
            })
        };
        let toggler = {
            let manager = manager.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                manager.set_ice_bandwidth(10);
            })
        };

        toggler.await.unwrap();
        let mut sockets = creator.await.unwrap();

        // a 20 byte binding request exceeds the new budget on every socket
        let peer = "10.0.0.2:3478".parse().unwrap();
        for (handle, events) in sockets.iter_mut() {
            assert!(matches!(next(events).await, ClientEvent::SocketCreated { .. }));
            handle.send(binding(0x0001), info(peer, 1)).unwrap();
            assert!(matches!(next(events).await, ClientEvent::SendComplete(_)));
        }
        assert!(factory.wire().sent.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let manager = SocketManager::new(RelayConfig::default().unwrap(), MockFactory::default());
        let mut handles = vec![];
        for _ in 0..3 {
            let (client, events) = mpsc::unbounded_channel();
            let handle = manager.create_socket(SocketType::Udp, any_local(), PortRange::default(), RemoteHint::default(), client);
            handles.push((handle.unwrap(), events));
        }
        assert_eq!(manager.socket_count(), 3);

        manager.shutdown();
        assert_eq!(manager.socket_count(), 0);
    }

    #[tokio::test]
    async fn loopback_binding_then_data() {
        let (sink, mut dumps) = mpsc::unbounded_channel();
        let manager = SocketManager::with_dump_sink(RelayConfig::default().unwrap(), UdpSocketFactory, sink);
        manager.start_rtp_dump(true, false);

        let (a_client, mut a_events) = mpsc::unbounded_channel();
        let (b_client, mut b_events) = mpsc::unbounded_channel();
        let stun_server: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        let hint = RemoteHint {
            hostname: Some("stun.example.org".into()),
            addr: Some(stun_server),
        };
        let a = manager
            .create_socket(SocketType::Udp, any_local(), PortRange::default(), hint, a_client)
            .unwrap();
        let b = manager
            .create_socket(SocketType::Udp, any_local(), PortRange::default(), RemoteHint::default(), b_client)
            .unwrap();
        assert_eq!(
            next(&mut a_events).await,
            ClientEvent::SocketCreated {
                local: a.local_addr(),
                remote: Some(stun_server)
            }
        );
        assert_eq!(
            next(&mut b_events).await,
            ClientEvent::SocketCreated {
                local: b.local_addr(),
                remote: None
            }
        );

        // a -> b binding request
        a.send(binding(0x0001), info(b.local_addr(), 1)).unwrap();
        assert!(matches!(next(&mut a_events).await, ClientEvent::SendComplete(m) if m.packet_id == 1));
        assert!(matches!(next(&mut b_events).await, ClientEvent::DataReceived { from, .. } if from == a.local_addr()));

        // b -> a binding response promotes b on a's side
        b.send(binding(0x0101), info(a.local_addr(), 1)).unwrap();
        assert!(matches!(next(&mut b_events).await, ClientEvent::SendComplete(_)));
        assert!(matches!(next(&mut a_events).await, ClientEvent::DataReceived { .. }));

        let rtp = Bytes::from(hex::decode("806f1234000010001234567801020304").unwrap());
        a.send(rtp.clone(), info(b.local_addr(), 2)).unwrap();
        assert!(matches!(next(&mut a_events).await, ClientEvent::SendComplete(m) if m.packet_id == 2));

        // b promoted a when it received the binding request
        assert!(matches!(next(&mut b_events).await, ClientEvent::DataReceived { data, .. } if data == rtp));
        let dump = timeout(Duration::from_secs(5), dumps.recv()).await.unwrap().unwrap();
        assert!(dump.incoming);
        assert_eq!(dump.packet_length, rtp.len());
        assert_eq!(dump.header, rtp.slice(..12));
    }
}
