use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::parse::*;
use crate::property::{Properties, PropertyType};
use crate::{reason, Error, FixedHeader, QoS};

const ALLOWED_PROPERTIES: &[PropertyType] =
    &[PropertyType::ReasonString, PropertyType::UserProperty];

/// Subscribe acknowledgement
///
/// Sent by the server to the client to confirm receipt and processing of a
/// SUBSCRIBE packet. Contains one reason code per requested filter, in the
/// order the filters appeared in the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub properties: Properties,
    pub reason_codes: Vec<SubscribeReasonCode>,
}

impl SubAck {
    pub fn new(pkid: u16, reason_codes: Vec<SubscribeReasonCode>) -> Self {
        SubAck {
            pkid,
            properties: Properties::new(),
            reason_codes,
        }
    }
}

/// Reason codes for the SUBACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Unspecified,
    ImplementationSpecific,
    NotAuthorized,
    TopicFilterInvalid,
    PkidInUse,
    QuotaExceeded,
    SharedSubscriptionsNotSupported,
    SubscriptionIdNotSupported,
    WildcardSubscriptionsNotSupported,
}

impl TryFrom<u8> for SubscribeReasonCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let v = match value {
            reason::GRANTED_QOS_0 => Self::Success(QoS::AtMostOnce),
            reason::GRANTED_QOS_1 => Self::Success(QoS::AtLeastOnce),
            reason::GRANTED_QOS_2 => Self::Success(QoS::ExactlyOnce),
            reason::UNSPECIFIED_ERROR => Self::Unspecified,
            reason::IMPLEMENTATION_SPECIFIC_ERROR => Self::ImplementationSpecific,
            reason::NOT_AUTHORIZED => Self::NotAuthorized,
            reason::TOPIC_FILTER_INVALID => Self::TopicFilterInvalid,
            reason::PACKET_IDENTIFIER_IN_USE => Self::PkidInUse,
            reason::QUOTA_EXCEEDED => Self::QuotaExceeded,
            reason::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED => Self::SharedSubscriptionsNotSupported,
            reason::SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED => Self::SubscriptionIdNotSupported,
            reason::WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED => Self::WildcardSubscriptionsNotSupported,
            v => return Err(Error::InvalidSubscribeReasonCode(v)),
        };

        Ok(v)
    }
}

impl From<SubscribeReasonCode> for u8 {
    fn from(value: SubscribeReasonCode) -> u8 {
        match value {
            SubscribeReasonCode::Success(qos) => qos as u8,
            SubscribeReasonCode::Unspecified => reason::UNSPECIFIED_ERROR,
            SubscribeReasonCode::ImplementationSpecific => reason::IMPLEMENTATION_SPECIFIC_ERROR,
            SubscribeReasonCode::NotAuthorized => reason::NOT_AUTHORIZED,
            SubscribeReasonCode::TopicFilterInvalid => reason::TOPIC_FILTER_INVALID,
            SubscribeReasonCode::PkidInUse => reason::PACKET_IDENTIFIER_IN_USE,
            SubscribeReasonCode::QuotaExceeded => reason::QUOTA_EXCEEDED,
            SubscribeReasonCode::SharedSubscriptionsNotSupported => {
                reason::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED
            }
            SubscribeReasonCode::SubscriptionIdNotSupported => {
                reason::SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED
            }
            SubscribeReasonCode::WildcardSubscriptionsNotSupported => {
                reason::WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED
            }
        }
    }
}

pub fn read(_fixed_header: FixedHeader, mut bytes: Bytes) -> Result<SubAck, Error> {
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

    Ok(SubAck {
        pkid,
        properties,
        reason_codes,
    })
}

pub fn write(packet: &SubAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    // packet type and flags
    buffer.put_u8(0x90);
    // remaining length
    let len = len(packet)?;
    len.write(buffer);
    // packet identifier
    buffer.put_u16(packet.pkid);

    // properties
    packet.properties.write(buffer)?;

    // reason codes
    let p = packet.reason_codes.iter().map(|&c| u8::from(c));
    buffer.extend(p);

    Ok(1 + len.length() + len.value())
}

pub fn len(packet: &SubAck) -> Result<VarInt, Error> {
    let mut len = 2 + packet.reason_codes.len();

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
        let suback_props = properties![Property::UserProperty {
            name: USER_PROP_KEY.into(),
            value: USER_PROP_VAL.into(),
        }];

        let mut suback_pkt = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::ExactlyOnce)]);
        suback_pkt.properties = suback_props;

        let size_from_size = size_from_len(len(&suback_pkt).unwrap());
        let size_from_write = write(&suback_pkt, &mut dummy_bytes).unwrap();
        let size_from_bytes = dummy_bytes.len();

        assert_eq!(size_from_write, size_from_bytes);
        assert_eq!(size_from_size, size_from_bytes);
    }

    #[test]
    fn mixed_reason_codes_survive_a_round_trip() {
        let suback = SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::NotAuthorized,
                SubscribeReasonCode::WildcardSubscriptionsNotSupported,
            ],
        );

        let mut buffer = BytesMut::new();
        write(&suback, &mut buffer).unwrap();
        let fixed_header = FixedHeader::check(buffer.iter(), u32::MAX).unwrap();
        let mut bytes = buffer.freeze();
        let _ = bytes.split_to(fixed_header.header_len());
        let decoded = read(fixed_header, bytes).unwrap();

        assert_eq!(suback, decoded);
    }

    #[test]
    fn suback_without_reason_codes_is_malformed() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(0x90);
        buffer.put_u8(3);
        buffer.put_u16(1);
        buffer.put_u8(0);

        let fixed_header = FixedHeader::check(buffer.iter(), u32::MAX).unwrap();
        let mut bytes = buffer.freeze();
        let _ = bytes.split_to(fixed_header.header_len());
        assert!(matches!(
            read(fixed_header, bytes),
            Err(Error::MalformedPacket)
        ));
    }
}
