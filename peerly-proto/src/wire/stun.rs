use super::{MAGIC_COOKIE, STUN_HEADER_SIZE};
use crate::error::ProtoError;
use bytes::Buf;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MKind {
    Request,
    Success,
    Error,
}

// Only the message type is looked at. Attributes, integrity and fingerprint are left to the ICE stack above us.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StunMessageType {
    Binding(MKind),
    SharedSecret(MKind),
    Allocate(MKind),
    Send(MKind),
    CreatePermission(MKind),
    ChannelBind(MKind),
    // Legacy (RFC 3489 era) data indication
    DataIndication,
    SendIndication,
    TurnDataIndication,
}

impl StunMessageType {
    /// Validates the fixed 20 byte STUN header of `data` and returns the message type.
    ///
    /// The magic cookie must be present and the length field must account for exactly the
    /// bytes following the header, so a datagram carrying a truncated or padded message is rejected.
    pub fn parse(data: &[u8]) -> Result<Self, ProtoError> {
        let mut buffer = data;
        if buffer.remaining() < STUN_HEADER_SIZE {
            return Err(ProtoError::NeedMoreData);
        }

        let msg_type = buffer.get_u16();
        let length = buffer.get_u16() as usize;

        match buffer.get_u32() {
            MAGIC_COOKIE => {}
            cookie => return Err(ProtoError::InvalidCookie(cookie)),
        }

        let payload = data.len() - STUN_HEADER_SIZE;
        if length != payload {
            return Err(ProtoError::LengthMismatch { header: length, payload });
        }

        msg_type.try_into()
    }

    /// Binding and Allocate requests/responses prove that the remote end speaks STUN with us.
    pub fn is_request_or_response(&self) -> bool {
        matches!(
            self,
            Self::Binding(MKind::Request | MKind::Success) | Self::Allocate(MKind::Request | MKind::Success)
        )
    }

    pub fn is_indication(&self) -> bool {
        matches!(self, Self::DataIndication | Self::SendIndication | Self::TurnDataIndication)
    }
}

/// Classifies a datagram. `None` means the payload is not a well formed STUN message.
pub fn sniff(data: &[u8]) -> Option<StunMessageType> {
    StunMessageType::parse(data).ok()
}

impl TryFrom<u16> for StunMessageType {
    type Error = ProtoError;
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0001 => Self::Binding(MKind::Request),
            0x0101 => Self::Binding(MKind::Success),
            0x0111 => Self::Binding(MKind::Error),
            0x0002 => Self::SharedSecret(MKind::Request),
            0x0102 => Self::SharedSecret(MKind::Success),
            0x0112 => Self::SharedSecret(MKind::Error),
            0x0003 => Self::Allocate(MKind::Request),
            0x0103 => Self::Allocate(MKind::Success),
            0x0113 => Self::Allocate(MKind::Error),
            0x0004 => Self::Send(MKind::Request),
            0x0104 => Self::Send(MKind::Success),
            0x0114 => Self::Send(MKind::Error),
            0x0008 => Self::CreatePermission(MKind::Request),
            0x0108 => Self::CreatePermission(MKind::Success),
            0x0118 => Self::CreatePermission(MKind::Error),
            0x0009 => Self::ChannelBind(MKind::Request),
            0x0109 => Self::ChannelBind(MKind::Success),
            0x0119 => Self::ChannelBind(MKind::Error),
            0x0115 => Self::DataIndication,
            0x0016 => Self::SendIndication,
            0x0017 => Self::TurnDataIndication,
            x => return Err(ProtoError::UnknownMessageType(x)),
        })
    }
}

impl From<StunMessageType> for u16 {
    fn from(value: StunMessageType) -> Self {
        let class = |method: u16, kind: MKind| match kind {
            MKind::Request => method,
            MKind::Success => method | 0x0100,
            MKind::Error => method | 0x0110,
        };

        match value {
            StunMessageType::Binding(kind) => class(0x0001, kind),
            StunMessageType::SharedSecret(kind) => class(0x0002, kind),
            StunMessageType::Allocate(kind) => class(0x0003, kind),
            StunMessageType::Send(kind) => class(0x0004, kind),
            StunMessageType::CreatePermission(kind) => class(0x0008, kind),
            StunMessageType::ChannelBind(kind) => class(0x0009, kind),
            StunMessageType::DataIndication => 0x0115,
            StunMessageType::SendIndication => 0x0016,
            StunMessageType::TurnDataIndication => 0x0017,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BufMut;
    use rand::Rng;

    // Binding request carrying only a FINGERPRINT attribute
    const BINDING_REQUEST_DUMP: &str = "000100082112a4426a4a4b6b4c6c4d6d4e6e4f6f802800045d3a2c1b";

    fn header(msg_type: u16, body: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(STUN_HEADER_SIZE + body.len());
        buffer.put_u16(msg_type);
        buffer.put_u16(body.len() as u16);
        buffer.put_u32(MAGIC_COOKIE);
        buffer.extend_from_slice(&rand::rng().random::<[u8; 12]>());
        buffer.extend_from_slice(body);
        buffer
    }

    #[test]
    fn binding_request_dump() {
        let data = hex::decode(BINDING_REQUEST_DUMP).unwrap();
        assert_eq!(sniff(&data), Some(StunMessageType::Binding(MKind::Request)));
    }

    #[test]
    fn every_known_type_survives_u16() {
        for code in [
            0x0001u16, 0x0101, 0x0111, 0x0002, 0x0102, 0x0112, 0x0003, 0x0103, 0x0113, 0x0004, 0x0104, 0x0114, 0x0008, 0x0108,
            0x0118, 0x0009, 0x0109, 0x0119, 0x0115, 0x0016, 0x0017,
        ] {
            let msg_type = StunMessageType::try_from(code).unwrap();
            assert_eq!(u16::from(msg_type), code);
            assert_eq!(sniff(&header(code, &[])), Some(msg_type));
        }
    }

    #[test]
    fn truncated_header_is_not_stun() {
        let data = header(0x0001, &[]);
        assert_eq!(StunMessageType::parse(&data[..19]), Err(ProtoError::NeedMoreData));
        assert_eq!(sniff(&[]), None);
    }

    #[test]
    fn bad_cookie_is_not_stun() {
        let mut data = header(0x0001, &[]);
        data[4] = 0x00;
        assert!(matches!(StunMessageType::parse(&data), Err(ProtoError::InvalidCookie(_))));
    }

    #[test]
    fn length_must_cover_payload() {
        let mut data = header(0x0101, &[0u8; 8]);
        data.push(0);
        assert_eq!(
            StunMessageType::parse(&data),
            Err(ProtoError::LengthMismatch { header: 8, payload: 9 })
        );
    }

    #[test]
    fn unknown_type_is_not_stun() {
        assert_eq!(
            StunMessageType::parse(&header(0x0005, &[])),
            Err(ProtoError::UnknownMessageType(0x0005))
        );
    }

    #[test]
    fn request_or_response() {
        assert!(StunMessageType::Binding(MKind::Request).is_request_or_response());
        assert!(StunMessageType::Binding(MKind::Success).is_request_or_response());
        assert!(StunMessageType::Allocate(MKind::Request).is_request_or_response());
        assert!(StunMessageType::Allocate(MKind::Success).is_request_or_response());
        assert!(!StunMessageType::Binding(MKind::Error).is_request_or_response());
        assert!(!StunMessageType::CreatePermission(MKind::Request).is_request_or_response());
        assert!(!StunMessageType::DataIndication.is_request_or_response());
        assert!(StunMessageType::SendIndication.is_indication());
        assert!(!StunMessageType::Send(MKind::Request).is_indication());
    }
}
