use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{reason, Error, FixedHeader};

const ALLOWED_PROPERTIES: &[PropertyType] =
    &[PropertyType::ReasonString, PropertyType::UserProperty];

/// Unsubscribe acknowledgement
///
/// Sent by the server to the client to confirm receipt of an UNSUBSCRIBE
/// packet. Contains one reason code per requested filter, in the order the
/// filters appeared in the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
    pub properties: Properties,
    pub reason_codes: Vec<UnsubscribeReasonCode>,
}

impl UnsubAck {
    pub fn new(pkid: u16, reason_codes: Vec<UnsubscribeReasonCode>) -> Self {
        UnsubAck {
            pkid,
            properties: Properties::new(),
            reason_codes,
        }
    }
}

/// Reason codes for the UNSUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnsubscribeReasonCode {
    Success = reason::SUCCESS,
    NoSubscriptionExisted = reason::NO_SUBSCRIPTION_EXISTED,
    UnspecifiedError = reason::UNSPECIFIED_ERROR,
    ImplementationSpecificError = reason::IMPLEMENTATION_SPECIFIC_ERROR,
    NotAuthorized = reason::NOT_AUTHORIZED,
    TopicFilterInvalid = reason::TOPIC_FILTER_INVALID,
    PacketIdentifierInUse = reason::PACKET_IDENTIFIER_IN_USE,
}

impl TryFrom<u8> for UnsubscribeReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            reason::SUCCESS => Self::Success,
            reason::NO_SUBSCRIPTION_EXISTED => Self::NoSubscriptionExisted,
            reason::UNSPECIFIED_ERROR => Self::UnspecifiedError,
            reason::IMPLEMENTATION_SPECIFIC_ERROR => Self::ImplementationSpecificError,
            reason::NOT_AUTHORIZED => Self::NotAuthorized,
            reason::TOPIC_FILTER_INVALID => Self::TopicFilterInvalid,
            reason::PACKET_IDENTIFIER_IN_USE => Self::PacketIdentifierInUse,
            num => return Err(Error::InvalidReason(num)),
        };

        Ok(code)
    }
}

pub fn read(_fixed_header: FixedHeader, mut bytes: Bytes) -> Result<UnsubAck, Error> {
    let pkid = read_u16(&mut bytes)?;
    let properties = Properties::read(&mut bytes, ALLOWED_PROPERTIES)?;

    if !bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    let mut reason_codes = Vec::new();
    while bytes.has_remaining() {
        let return_code = read_u8(&mut bytes)?;
        reason_codes.push(return_code.try_into()?);
    }

    Ok(UnsubAck {
        pkid,
        properties,
        reason_codes,
    })
}

pub fn write(packet: &UnsubAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    buffer.put_u8(0xB0);
    // remaining length
    let len = len(packet)?;
    len.write(buffer);
    // packet identifier
    buffer.put_u16(packet.pkid);

    // properties
    packet.properties.write(buffer)?;

    // reason codes
    let p = packet.reason_codes.iter().map(|&c| c as u8);
    buffer.extend(p);

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &UnsubAck) -> Result<VarInt, Error> {
    let mut len = 2 + packet.reason_codes.len();

    let properties_len = packet.properties.len()?;
    len += properties_len.length() + properties_len.value();

    VarInt::new(len)
}
