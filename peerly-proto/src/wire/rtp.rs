use super::{
    DTLS_RECORD_HEADER_SIZE, MIN_RTCP_HEADER_SIZE, MIN_RTP_HEADER_SIZE, STUN_ATTR_DATA, STUN_HEADER_SIZE, TURN_CHANNEL_HEADER_SIZE,
};
use crate::{
    error::ProtoError,
    wire::stun::StunMessageType,
};
use bytes::Buf;
use std::ops::Range;

const RTP_EXTENSION_HEADER_SIZE: usize = 4;

pub fn is_dtls_packet(data: &[u8]) -> bool {
    data.len() >= DTLS_RECORD_HEADER_SIZE && (20..64).contains(&data[0])
}

pub fn is_rtcp_packet(data: &[u8]) -> bool {
    data.len() >= MIN_RTCP_HEADER_SIZE && (64..96).contains(&(data[1] & 0x7F))
}

pub fn is_rtp_packet(data: &[u8]) -> bool {
    data.len() >= MIN_RTP_HEADER_SIZE && (data[0] & 0xC0) == 0x80
}

fn is_turn_channel_data(data: &[u8]) -> bool {
    data.len() >= TURN_CHANNEL_HEADER_SIZE && (data[0] & 0xC0) == 0x40
}

fn is_turn_send_indication(data: &[u8]) -> bool {
    data.len() >= STUN_HEADER_SIZE && u16::from_be_bytes([data[0], data[1]]) == u16::from(StunMessageType::SendIndication)
}

/// Locates the application payload inside a possibly TURN wrapped datagram.
///
/// ChannelData frames and Send indications are unwrapped, anything else is returned whole.
pub fn unwrap_turn_packet(data: &[u8]) -> Result<Range<usize>, ProtoError> {
    if is_turn_channel_data(data) {
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if TURN_CHANNEL_HEADER_SIZE + length > data.len() {
            return Err(ProtoError::MalformedTurn);
        }
        return Ok(TURN_CHANNEL_HEADER_SIZE..TURN_CHANNEL_HEADER_SIZE + length);
    }

    if !is_turn_send_indication(data) {
        return Ok(0..data.len());
    }

    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length + STUN_HEADER_SIZE != data.len() {
        return Err(ProtoError::MalformedTurn);
    }

    // Walk the TLV attributes (padded to 4 bytes) until DATA shows up
    let mut attrs = &data[STUN_HEADER_SIZE..];
    while attrs.has_remaining() {
        let pos = data.len() - attrs.remaining();
        if attrs.remaining() < 4 {
            return Err(ProtoError::MalformedTurn);
        }
        let attr_type = attrs.get_u16();
        let attr_len = attrs.get_u16() as usize;
        if attr_len > attrs.remaining() {
            return Err(ProtoError::MalformedTurn);
        }
        if attr_type == STUN_ATTR_DATA {
            let start = pos + 4;
            return Ok(start..start + attr_len);
        }
        let padded = (attr_len + 3) & !3;
        attrs.advance(padded.min(attrs.remaining()));
    }

    Err(ProtoError::MalformedTurn)
}

/// Length of the RTP fixed header, CSRC list and header extension.
pub fn rtp_header_length(data: &[u8]) -> Result<usize, ProtoError> {
    if !is_rtp_packet(data) {
        return Err(ProtoError::InvalidRtp);
    }

    let csrc_count = (data[0] & 0x0F) as usize;
    let mut length = MIN_RTP_HEADER_SIZE + csrc_count * 4;
    if length > data.len() {
        return Err(ProtoError::InvalidRtp);
    }

    if data[0] & 0x10 != 0 {
        if length + RTP_EXTENSION_HEADER_SIZE > data.len() {
            return Err(ProtoError::InvalidRtp);
        }
        let words = u16::from_be_bytes([data[length + 2], data[length + 3]]) as usize;
        length += RTP_EXTENSION_HEADER_SIZE + words * 4;
        if length > data.len() {
            return Err(ProtoError::InvalidRtp);
        }
    }

    Ok(length)
}

/// Header bytes of an RTP packet worth recording, along with the RTP length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeaderDump {
    pub header: Range<usize>,
    pub packet_length: usize,
}

/// Picks out the RTP header of `data` for diagnostics dumps.
///
/// DTLS and RTCP datagrams, and anything that does not carry a valid RTP header, yield `None`.
pub fn rtp_dump_header(data: &[u8]) -> Option<RtpHeaderDump> {
    if is_dtls_packet(data) || is_rtcp_packet(data) {
        return None;
    }

    let rtp = unwrap_turn_packet(data).ok()?;
    let header_length = match rtp_header_length(&data[rtp.clone()]) {
        Ok(length) => length,
        Err(e) => {
            tracing::debug!("rtp_dump_header : {e}");
            return None;
        }
    };

    Some(RtpHeaderDump {
        header: rtp.start..rtp.start + header_length,
        packet_length: rtp.len(),
    })
}
