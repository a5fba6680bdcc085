use bytes::Bytes;
use peerly_proto::wire::options::PacketOptions;
use std::{fmt::Debug, net::SocketAddr, time::Instant};

#[derive(Hash, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p2p-{}", self.0)
    }
}

// Only UDP is served here. The TCP flavours belong to a different socket implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Udp,
    TcpServer,
    StunTcpServer,
    TcpClient,
    SslTcpClient,
    TlsClient,
    StunTcpClient,
    StunSslTcpClient,
    StunTlsClient,
}

/// Allowed local ports. `0..=0` means any port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortRange {
    pub min_port: u16,
    pub max_port: u16,
}

impl PortRange {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self { min_port, max_port }
    }

    pub fn is_any(&self) -> bool {
        self.min_port == 0 && self.max_port == 0
    }

    pub fn is_valid(&self) -> bool {
        (self.is_any() || self.min_port > 0) && self.min_port <= self.max_port
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min_port..=self.max_port).contains(&port)
    }
}

/// Remote end the client intends to talk to, as it was handed to us. Only echoed back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHint {
    pub hostname: Option<String>,
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub destination: SocketAddr,
    pub packet_options: PacketOptions,
    pub packet_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendMetrics {
    pub packet_id: u64,
    pub transport_sequence_number: Option<i32>,
    pub send_time: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    RecvBuf,
    SendBuf,
    Dscp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Unknown,
    Ethernet,
    Wifi,
    Cellular,
    Bluetooth,
    None,
}

// Socket --> Client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The socket is bound and reading.
    SocketCreated { local: SocketAddr, remote: Option<SocketAddr> },
    DataReceived { from: SocketAddr, data: Bytes, timestamp: Instant },
    /// Emitted once per Send, in the order the packets were handed over. Dropped packets report too.
    SendComplete(SendMetrics),
    /// Terminal. Nothing follows it.
    ConnectionError,
}

// Client / Manager --> Socket
pub enum SocketCommand {
    Send(Bytes, PacketInfo),
    SetOption(SocketOption, i32),
    StartRtpDump { incoming: bool, outgoing: bool },
    StopRtpDump { incoming: bool, outgoing: bool },
    SetIceBandwidth(usize),
    NetworkChanged(ConnectionType),
    Close,
}

impl Debug for SocketCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SocketCommand::Send(_, _) => "Send",
            SocketCommand::SetOption(_, _) => "SetOption",
            SocketCommand::StartRtpDump { .. } => "StartRtpDump",
            SocketCommand::StopRtpDump { .. } => "StopRtpDump",
            SocketCommand::SetIceBandwidth(_) => "SetIceBandwidth",
            SocketCommand::NetworkChanged(_) => "NetworkChanged",
            SocketCommand::Close => "Close",
        };
        write!(f, "{s}")
    }
}

/// RTP header recorded for diagnostics, handed to the trusted side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDump {
    pub header: Bytes,
    pub packet_length: usize,
    pub incoming: bool,
}

// Socket --> Manager
#[derive(Debug)]
pub(crate) enum ManagerEvent {
    Destroy(SocketId),
    DumpPacket(PacketDump),
}
