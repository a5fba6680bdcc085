//! Scripted in-memory socket used to drive `RelaySocket` deterministically.

use crate::datagram::{DatagramSocket, SocketFactory};
use peerly_proto::wire::options::Dscp;
use std::{
    collections::{HashSet, VecDeque},
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
};

pub(crate) const EPHEMERAL_PORT: u16 = 40000;

#[derive(Debug, Default)]
pub(crate) struct Wire {
    pub created: usize,
    pub bind_attempts: Vec<SocketAddr>,
    pub occupied: HashSet<u16>,
    pub bound: Option<SocketAddr>,
    pub local_addr_error: Option<ErrorKind>,
    pub recv_buffer: Option<usize>,
    pub send_buffer: Option<usize>,
    // Scripted outcomes for `try_send_to`, a missing entry means success.
    pub send_results: VecDeque<io::Error>,
    pub sent: Vec<(SocketAddr, Vec<u8>)>,
    pub inbound: VecDeque<io::Result<(SocketAddr, Vec<u8>)>>,
    pub dscp_results: VecDeque<io::Error>,
    pub dscp: Vec<Dscp>,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct MockFactory {
    wire: Arc<Mutex<Wire>>,
}

impl MockFactory {
    pub fn wire(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap()
    }
}

impl SocketFactory for MockFactory {
    type Socket = MockSocket;
    fn create(&self) -> io::Result<MockSocket> {
        self.wire().created += 1;
        Ok(MockSocket {
            wire: self.wire.clone(),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockSocket {
    wire: Arc<Mutex<Wire>>,
}

impl MockSocket {
    fn wire(&self) -> MutexGuard<'_, Wire> {
        self.wire.lock().unwrap()
    }
}

impl DatagramSocket for MockSocket {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        let mut wire = self.wire();
        wire.bind_attempts.push(addr);
        if wire.occupied.contains(&addr.port()) {
            return Err(ErrorKind::AddrInUse.into());
        }

        let mut bound = addr;
        if bound.port() == 0 {
            bound.set_port(EPHEMERAL_PORT);
        }
        wire.bound = Some(bound);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        let wire = self.wire();
        if let Some(kind) = wire.local_addr_error {
            return Err(kind.into());
        }
        wire.bound.ok_or_else(|| ErrorKind::NotConnected.into())
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.wire().recv_buffer = Some(size);
        Ok(())
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.wire().send_buffer = Some(size);
        Ok(())
    }

    fn set_dscp(&self, dscp: Dscp) -> io::Result<()> {
        let mut wire = self.wire();
        if let Some(err) = wire.dscp_results.pop_front() {
            return Err(err);
        }
        wire.dscp.push(dscp);
        Ok(())
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let mut wire = self.wire();
        if let Some(err) = wire.send_results.pop_front() {
            return Err(err);
        }
        wire.sent.push((target, buf.to_vec()));
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.wire().inbound.pop_front() {
            Some(Ok((from, data))) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), from))
            }
            Some(Err(e)) => Err(e),
            None => Err(ErrorKind::WouldBlock.into()),
        }
    }

    // Readiness is never signalled, tests call the handlers directly.
    fn poll_send_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }

    fn poll_recv_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}
