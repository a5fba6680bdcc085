use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProtoError {
    #[error("Need More Data")]
    NeedMoreData,

    #[error("Invalid Magic Cookie {0:#010x}")]
    InvalidCookie(u32),

    #[error("Length Mismatch : header says {header}, payload has {payload}")]
    LengthMismatch { header: usize, payload: usize },

    #[error("Unknown Message Type {0:#06x}")]
    UnknownMessageType(u16),

    #[error("Invalid RTP Packet")]
    InvalidRtp,

    #[error("Malformed TURN Packet")]
    MalformedTurn,
}
