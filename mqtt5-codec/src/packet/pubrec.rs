use bytes::{BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{reason, Error, FixedHeader};

const ALLOWED_PROPERTIES: &[PropertyType] =
    &[PropertyType::ReasonString, PropertyType::UserProperty];

/// Publish received
///
/// First response to a PUBLISH packet with QoS 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
    pub reason: PubRecReasonCode,
    pub properties: Properties,
}

impl PubRec {
    pub fn new(pkid: u16) -> Self {
        Self {
            pkid,
            reason: PubRecReasonCode::Success,
            properties: Properties::new(),
        }
    }
}

/// Reason codes for the PUBREC packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PubRecReasonCode {
    Success = reason::SUCCESS,
    NoMatchingSubscribers = reason::NO_MATCHING_SUBSCRIBERS,
    UnspecifiedError = reason::UNSPECIFIED_ERROR,
    ImplementationSpecificError = reason::IMPLEMENTATION_SPECIFIC_ERROR,
    NotAuthorized = reason::NOT_AUTHORIZED,
    TopicNameInvalid = reason::TOPIC_NAME_INVALID,
    PacketIdentifierInUse = reason::PACKET_IDENTIFIER_IN_USE,
    QuotaExceeded = reason::QUOTA_EXCEEDED,
    PayloadFormatInvalid = reason::PAYLOAD_FORMAT_INVALID,
}

impl PubRecReasonCode {
    /// Did the broker refuse the publish?
    ///
    /// A failure reason code terminates the QoS 2 handshake, no PUBREL
    /// should be sent for this packet identifier.
    pub fn is_failure(&self) -> bool {
        *self as u8 >= 0x80
    }
}

impl TryFrom<u8> for PubRecReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            reason::SUCCESS => Self::Success,
            reason::NO_MATCHING_SUBSCRIBERS => Self::NoMatchingSubscribers,
            reason::UNSPECIFIED_ERROR => Self::UnspecifiedError,
            reason::IMPLEMENTATION_SPECIFIC_ERROR => Self::ImplementationSpecificError,
            reason::NOT_AUTHORIZED => Self::NotAuthorized,
            reason::TOPIC_NAME_INVALID => Self::TopicNameInvalid,
            reason::PACKET_IDENTIFIER_IN_USE => Self::PacketIdentifierInUse,
            reason::QUOTA_EXCEEDED => Self::QuotaExceeded,
            reason::PAYLOAD_FORMAT_INVALID => Self::PayloadFormatInvalid,
            num => return Err(Error::InvalidReason(num)),
        };

        Ok(code)
    }
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubRec, Error> {
    let pkid = read_u16(&mut bytes)?;

    // No reason code or properties if remaining length == 2
    if fixed_header.remaining_len == 2 {
        return Ok(PubRec::new(pkid));
    }

    let ack_reason = read_u8(&mut bytes)?;
    if fixed_header.remaining_len < 4 {
        // Properties length is omitted
        return Ok(PubRec {
            pkid,
            reason: ack_reason.try_into()?,
            properties: Properties::new(),
        });
    }

    Ok(PubRec {
        pkid,
        reason: ack_reason.try_into()?,
        properties: Properties::read(&mut bytes, ALLOWED_PROPERTIES)?,
    })
}

pub fn write(packet: &PubRec, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    buffer.put_u8(0x50);
    // remaining length
    let len = len(packet)?;
    len.write(buffer);
    // packet identifier
    buffer.put_u16(packet.pkid);

    if len > 2 {
        // reason code
        buffer.put_u8(packet.reason as u8);
        // properties
        packet.properties.write(buffer)?;
    }

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &PubRec) -> Result<VarInt, Error> {
    let mut len = 2; // packet identifier

    if packet.reason == PubRecReasonCode::Success && packet.properties.is_empty() {
        // Reason code and property length can be omitted in this case
        return VarInt::new(len);
    }

    len += 1; // reason code

    let properties_len = packet.properties.len()?;
    len += properties_len.length() + properties_len.value();

    VarInt::new(len)
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::packet::{
        size_from_len,
        tests::{USER_PROP_KEY, USER_PROP_VAL},
    };
    use crate::{properties, Property};

    #[test]
    fn length_calculation() {
        let mut dummy_bytes = BytesMut::new();
        // Use user_properties to pad the size to exceed ~128 bytes to make the
        // remaining_length field in the packet be 2 bytes long.
        let pubrec_props = properties![Property::UserProperty {
            name: USER_PROP_KEY.into(),
            value: USER_PROP_VAL.into(),
        }];

        let mut pubrec_pkt = PubRec::new(1);
        pubrec_pkt.properties = pubrec_props;

        let size_from_size = size_from_len(len(&pubrec_pkt).unwrap());
        let size_from_write = write(&pubrec_pkt, &mut dummy_bytes).unwrap();
        let size_from_bytes = dummy_bytes.len();

        assert_eq!(size_from_write, size_from_bytes);
        assert_eq!(size_from_size, size_from_bytes);
    }

    #[test]
    fn failure_reason_codes_are_recognised() {
        assert!(!PubRecReasonCode::Success.is_failure());
        assert!(!PubRecReasonCode::NoMatchingSubscribers.is_failure());
        assert!(PubRecReasonCode::QuotaExceeded.is_failure());
        assert!(PubRecReasonCode::NotAuthorized.is_failure());
    }
}
