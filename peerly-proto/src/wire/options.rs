use super::rtp::{rtp_header_length, unwrap_turn_packet};
use crate::error::ProtoError;

const ONE_BYTE_EXTENSION_PROFILE: u16 = 0xBEDE;
const TWO_BYTE_EXTENSION_PROFILE: u16 = 0x1000;
const ABS_SEND_TIME_LENGTH: usize = 3;

/// Differentiated services code point requested for outgoing packets.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Dscp {
    #[default]
    NoChange,
    Value(u8),
}

impl Dscp {
    pub const CS0: Dscp = Dscp::Value(0);
    pub const EF: Dscp = Dscp::Value(46);

    /// TOS / traffic class byte carrying this code point.
    pub fn tos(&self) -> Option<u32> {
        match self {
            Dscp::NoChange => None,
            Dscp::Value(v) => Some((*v as u32) << 2),
        }
    }
}

impl From<i32> for Dscp {
    fn from(value: i32) -> Self {
        match value {
            x if x < 0 => Dscp::NoChange,
            x => Dscp::Value((x & 0x3F) as u8),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketTimeParams {
    /// RTP header extension id of abs-send-time, if the sender negotiated it.
    pub rtp_sendtime_extension_id: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketOptions {
    pub dscp: Dscp,
    /// Transport-wide sequence number assigned by the client.
    pub transport_sequence_number: Option<i32>,
    pub packet_time_params: PacketTimeParams,
}

// abs-send-time is a 6.18 fixed point number of seconds, wrapping every 64 seconds.
fn abs_send_time(time_us: u64) -> [u8; ABS_SEND_TIME_LENGTH] {
    let wrapped = time_us % 64_000_000;
    let value = ((wrapped << 18) / 1_000_000) as u32 & 0x00FF_FFFF;
    let bytes = value.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

fn write_abs_send_time(rtp: &mut [u8], pos: usize, len: usize, time_us: u64) -> Result<bool, ProtoError> {
    if len != ABS_SEND_TIME_LENGTH {
        return Err(ProtoError::InvalidRtp);
    }
    rtp[pos..pos + ABS_SEND_TIME_LENGTH].copy_from_slice(&abs_send_time(time_us));
    Ok(true)
}

/// Rewrites the abs-send-time header extension `extension_id` of an RTP packet in place.
///
/// Returns `Ok(false)` when the packet carries no extension with that id.
pub fn update_abs_send_time(rtp: &mut [u8], extension_id: u8, time_us: u64) -> Result<bool, ProtoError> {
    let header_length = rtp_header_length(rtp)?;
    if rtp[0] & 0x10 == 0 {
        return Ok(false);
    }

    let start = 12 + (rtp[0] & 0x0F) as usize * 4;
    let profile = u16::from_be_bytes([rtp[start], rtp[start + 1]]);
    let end = header_length;
    let mut pos = start + 4;

    if profile == ONE_BYTE_EXTENSION_PROFILE {
        while pos < end {
            let byte = rtp[pos];
            if byte == 0 {
                pos += 1; // padding
                continue;
            }
            let id = byte >> 4;
            let len = (byte & 0x0F) as usize + 1;
            if id == 15 || pos + 1 + len > end {
                break;
            }
            if id == extension_id {
                return write_abs_send_time(rtp, pos + 1, len, time_us);
            }
            pos += 1 + len;
        }
    } else if profile & 0xFFF0 == TWO_BYTE_EXTENSION_PROFILE {
        while pos + 1 < end {
            let id = rtp[pos];
            if id == 0 {
                pos += 1;
                continue;
            }
            let len = rtp[pos + 1] as usize;
            if pos + 2 + len > end {
                break;
            }
            if id == extension_id {
                return write_abs_send_time(rtp, pos + 2, len, time_us);
            }
            pos += 2 + len;
        }
    }

    Ok(false)
}

/// Applies the send-time options to an outgoing datagram, unwrapping TURN framing first.
pub fn apply_packet_options(data: &mut [u8], params: &PacketTimeParams, time_us: u64) -> Result<bool, ProtoError> {
    let Some(extension_id) = params.rtp_sendtime_extension_id else {
        return Ok(false);
    };

    let rtp = unwrap_turn_packet(data)?;
    update_abs_send_time(&mut data[rtp], extension_id, time_us)
}
