use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Invalid Port Range [{0}-{1}]")]
    InvalidPortRange(u16, u16),

    #[error("Local Port {port} outside of range [{min}-{max}]")]
    PortOutOfRange { port: u16, min: u16, max: u16 },

    #[error("Bind to {addr} failed : {source}")]
    BindFailed { addr: SocketAddr, source: io::Error },

    #[error("Packet Too Big {0}")]
    PacketTooBig(usize),

    #[error("Data packet to {0} before STUN binding is finished")]
    UnverifiedPeer(SocketAddr),

    #[error("Socket is not open")]
    NotOpen,

    #[error("IO Error {0}")]
    IOError(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Unsupported Socket Type {0:?}")]
    UnsupportedSocketType(crate::events::SocketType),

    #[error("Socket Init Failed : {0}")]
    InitFailed(#[from] SocketError),
}

/// Send and receive errors that are absorbed instead of tearing the socket down.
///
/// `OutOfMemory` is what ENOBUFS maps to, i.e. the interface queue is full. `ConnectionReset`
/// follows an ICMP port unreachable for an earlier datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientError {
    AddressUnreachable,
    AddressInvalid,
    AccessDenied,
    ConnectionReset,
    OutOfMemory,
    InternetDisconnected,
}

impl TransientError {
    pub fn classify(err: &io::Error) -> Option<Self> {
        #[cfg(unix)]
        {
            if let Some(code) = err.raw_os_error() {
                return match code {
                    libc::ENETUNREACH | libc::EHOSTUNREACH => Some(Self::AddressUnreachable),
                    libc::EADDRNOTAVAIL => Some(Self::AddressInvalid),
                    libc::EACCES | libc::EPERM => Some(Self::AccessDenied),
                    libc::ECONNRESET => Some(Self::ConnectionReset),
                    libc::ENOBUFS | libc::ENOMEM => Some(Self::OutOfMemory),
                    libc::ENETDOWN => Some(Self::InternetDisconnected),
                    _ => None,
                };
            }
        }

        match err.kind() {
            ErrorKind::AddrNotAvailable => Some(Self::AddressInvalid),
            ErrorKind::PermissionDenied => Some(Self::AccessDenied),
            ErrorKind::ConnectionReset => Some(Self::ConnectionReset),
            ErrorKind::OutOfMemory => Some(Self::OutOfMemory),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddressUnreachable => "address_unreachable",
            Self::AddressInvalid => "address_invalid",
            Self::AccessDenied => "access_denied",
            Self::ConnectionReset => "connection_reset",
            Self::OutOfMemory => "out_of_memory",
            Self::InternetDisconnected => "internet_disconnected",
        }
    }
}

pub fn is_transient(err: &io::Error) -> bool {
    TransientError::classify(err).is_some()
}
