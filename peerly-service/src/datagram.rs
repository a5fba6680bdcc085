use peerly_proto::wire::options::Dscp;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    task::{Context, Poll},
};
use tokio::net::UdpSocket;

/// The OS facing half of a relay socket.
///
/// Everything is non-blocking: `try_*` calls return `WouldBlock` when the kernel is not ready and
/// the matching `poll_*_ready` call registers the task to be woken once it is.
pub trait DatagramSocket: Sync + Send + 'static {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()>;
    fn set_send_buffer_size(&self, size: usize) -> io::Result<()>;
    fn set_dscp(&self, dscp: Dscp) -> io::Result<()>;
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
    fn poll_recv_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

/// Hands out fresh, unbound sockets. Port probing asks for a new one after every failed bind.
pub trait SocketFactory: Sync + Send + 'static {
    type Socket: DatagramSocket;
    fn create(&self) -> io::Result<Self::Socket>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpSocketFactory;

impl SocketFactory for UdpSocketFactory {
    type Socket = UdpDatagram;
    fn create(&self) -> io::Result<UdpDatagram> {
        Ok(UdpDatagram { socket: None })
    }
}

#[derive(Debug)]
pub struct UdpDatagram {
    socket: Option<UdpSocket>,
}

impl UdpDatagram {
    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "udp socket is not bound"))
    }
}

impl DatagramSocket for UdpDatagram {
    // Must be called from within the tokio runtime, the socket is registered with its reactor.
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        self.socket = Some(UdpSocket::from_std(socket.into())?);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?.local_addr()
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        SockRef::from(self.socket()?).set_recv_buffer_size(size)
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        SockRef::from(self.socket()?).set_send_buffer_size(size)
    }

    fn set_dscp(&self, dscp: Dscp) -> io::Result<()> {
        let Some(tos) = dscp.tos() else {
            return Ok(());
        };

        let socket = self.socket()?;
        match socket.local_addr()? {
            SocketAddr::V4(_) => SockRef::from(socket).set_tos(tos),
            SocketAddr::V6(_) => set_traffic_class(socket, tos),
        }
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket()?.try_send_to(buf, target)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket()?.try_recv_from(buf)
    }

    fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.socket {
            Some(socket) => socket.poll_send_ready(cx),
            None => Poll::Ready(Err(ErrorKind::NotConnected.into())),
        }
    }

    fn poll_recv_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &self.socket {
            Some(socket) => socket.poll_recv_ready(cx),
            None => Poll::Ready(Err(ErrorKind::NotConnected.into())),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd"))]
fn set_traffic_class(socket: &UdpSocket, tclass: u32) -> io::Result<()> {
    SockRef::from(socket).set_tclass_v6(tclass)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "freebsd")))]
fn set_traffic_class(_socket: &UdpSocket, _tclass: u32) -> io::Result<()> {
    Err(io::Error::new(ErrorKind::Unsupported, "dscp marking on ipv6 sockets"))
}
