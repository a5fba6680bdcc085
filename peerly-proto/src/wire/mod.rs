pub mod options;
pub mod rtp;
pub mod stun;

pub const MAGIC_COOKIE: u32 = 0x2112A442;
pub const STUN_HEADER_SIZE: usize = 20;
pub const STUN_ATTR_DATA: u16 = 0x0013;
pub const TURN_CHANNEL_HEADER_SIZE: usize = 4;

pub const MIN_RTP_HEADER_SIZE: usize = 12;
pub const MIN_RTCP_HEADER_SIZE: usize = 8;
pub const DTLS_RECORD_HEADER_SIZE: usize = 13;

// Largest payload the client is allowed to hand to a socket in one Send.
pub const MAX_PACKET_SIZE: usize = 32768;
